use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;

use crate::config::EngineConfig;
use crate::core::{
    ContentSnapshot, EventType, FileBasedIndexExtension, FileEvent, FileHandle, IndexId, IndexKey,
    IndexValue, InputId, Project,
};
use crate::error::{IndexError, StorageError};
use crate::index::map_reduce::UpdatableIndex;
use crate::index::membership::{ContentRootMembership, PathContentRoots};
use crate::index::registry::{ErasedIndex, IndexState, RegisteredIndex, ValueHit};
use crate::index::scanner::{collect_files, ScanHandle, ScanOutcome};
use crate::stats::{EngineReport, IndexReport};
use crate::storage::{ContentAttic, FileIdRegistry, IndexLayout, IndexingStamps};

/// before_change 与 after_change 之间的旧内容槽
struct PendingContent {
    path: Arc<Path>,
    /// None：旧内容未知（从未被索引过）
    text: Option<Arc<str>>,
    /// 变化前文件是否存在（不依赖内容的索引据此决定是否有旧快照）
    existed: bool,
    /// before_change 时接受该文件的索引（下标）
    accepted_by: Vec<usize>,
}

impl PendingContent {
    fn old_snapshot(&self, id: InputId, index: &dyn ErasedIndex) -> Option<ContentSnapshot> {
        if !index.depends_on_content() {
            return self
                .existed
                .then(|| ContentSnapshot::new(id, &self.path, ""));
        }
        self.text
            .as_ref()
            .map(|text| ContentSnapshot::new(id, &self.path, text.clone()))
    }
}

/// 引擎构建器：注册扩展后 `open`。注册表在 open 之后不可变。
pub struct FileBasedIndexBuilder {
    config: EngineConfig,
    indexes: Vec<Box<dyn ErasedIndex>>,
    membership: Option<Arc<dyn ContentRootMembership>>,
}

impl FileBasedIndexBuilder {
    pub fn register<E: FileBasedIndexExtension>(mut self, extension: E) -> Self {
        self.indexes.push(Box::new(RegisteredIndex::new(extension)));
        self
    }

    /// 替换默认的按路径判定项目归属
    pub fn membership(mut self, membership: Arc<dyn ContentRootMembership>) -> Self {
        self.membership = Some(membership);
        self
    }

    /// 启动序列：
    /// 1) 上次未正常关闭（work_in_progress 仍在）→ 清空全部索引数据
    /// 2) 逐个索引：版本不符则删除；打开存储；新建的存储 → RequiresRebuild
    /// 3) GC：删除上次注册、本次未注册的索引文件；写入新的注册记录
    pub fn open(self) -> Result<Arc<FileBasedIndex>, IndexError> {
        let FileBasedIndexBuilder {
            config,
            indexes,
            membership,
        } = self;

        let mut by_name = HashMap::with_capacity(indexes.len());
        let mut disk_names = HashSet::with_capacity(indexes.len());
        for (i, index) in indexes.iter().enumerate() {
            if by_name.insert(index.name(), i).is_some()
                || !disk_names.insert(index.name().to_lowercase())
            {
                return Err(IndexError::Duplicate(index.name().to_string()));
            }
        }

        let layout = IndexLayout::new(&config.index_root);
        layout.ensure_dirs()?;

        let crashed = layout.has_marker();
        if crashed {
            tracing::warn!(
                "Previous session at {:?} did not shut down cleanly, dropping all indexes",
                layout.root()
            );
            layout.wipe()?;
        }

        let mut file_ids = FileIdRegistry::open(layout.file_ids_file());
        if file_ids.was_reset() {
            tracing::warn!("File id registry lost, dropping all indexes");
            layout.wipe()?;
            file_ids = FileIdRegistry::open(layout.file_ids_file());
        }
        let file_ids = Arc::new(file_ids);
        layout.write_marker()?;

        let attic = ContentAttic::open(layout.attic_file())?;
        let stamps = IndexingStamps::new(layout.stamps_dir());
        let mut rebuild_set = HashSet::new();

        for index in &indexes {
            let name = index.name();
            let capacity = config.cache_capacity.unwrap_or_else(|| index.cache_size());
            match open_index(&layout, &stamps, index.as_ref(), capacity) {
                Ok(false) => index.set_state(IndexState::Ready),
                Ok(true) => {
                    tracing::info!(index = %name, "No stored data, index requires rebuild");
                    index.set_state(IndexState::RequiresRebuild);
                    rebuild_set.insert(name);
                }
                Err(e) => {
                    tracing::error!(index = %name, "Index storage unusable, index unavailable: {}", e);
                    if let Err(e) = stamps.clear_index(name) {
                        tracing::warn!(index = %name, "Failed to drop stamps: {}", e);
                    }
                    index.set_state(IndexState::RequiresRebuild);
                    rebuild_set.insert(name);
                }
            }
        }

        // GC：上次注册、本次未注册
        let previous = layout.read_registered();
        let current: BTreeSet<String> = indexes.iter().map(|i| i.name().to_string()).collect();
        for stale in previous.iter() {
            if disk_names.contains(&stale.to_lowercase()) {
                continue;
            }
            tracing::info!(index = %stale, "Index no longer registered, deleting its files");
            if let Err(e) = layout.delete_index_files(stale) {
                tracing::warn!(index = %stale, "Failed to delete files of unregistered index: {}", e);
            }
        }
        layout.write_registered(&current)?;

        let membership = membership.unwrap_or_else(|| {
            Arc::new(PathContentRoots::new(file_ids.clone())) as Arc<dyn ContentRootMembership>
        });

        tracing::info!(
            "Index engine open at {:?}: {} indexes, {} requiring rebuild, {} known files",
            layout.root(),
            indexes.len(),
            rebuild_set.len(),
            file_ids.len()
        );

        Ok(Arc::new(FileBasedIndex {
            config,
            layout,
            indexes,
            by_name,
            file_ids,
            stamps,
            attic,
            membership,
            old_contents: DashMap::new(),
            rebuild_set: Mutex::new(rebuild_set),
            scanned: Mutex::new(HashSet::new()),
            projects: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }))
    }
}

/// 打开单个索引：版本不符先删旧文件，再打开存储。返回 true 表示需要全量重建。
///
/// 任何一步失败都只影响这个索引，由调用方把它标记为不可用。
fn open_index(
    layout: &IndexLayout,
    stamps: &IndexingStamps,
    index: &dyn ErasedIndex,
    capacity: usize,
) -> Result<bool, StorageError> {
    let name = index.name();
    let stored = layout.read_version(name);
    if stored != Some(index.version()) {
        if stored.is_some() || layout.storage_file(name).exists() {
            tracing::info!(
                index = %name,
                "Index version changed ({:?} -> {}), dropping stored data",
                stored,
                index.version()
            );
        }
        layout.delete_index_files(name)?;
    }

    let fresh = index.open_storage(&layout.storage_file(name), capacity)?;
    if fresh {
        layout.write_version(name, index.version())?;
        stamps.clear_index(name)?;
    }
    Ok(fresh)
}

/// 进程级索引引擎：维护全部已注册索引，驱动增量更新、批量扫描、查询与关闭。
pub struct FileBasedIndex {
    config: EngineConfig,
    layout: IndexLayout,
    indexes: Vec<Box<dyn ErasedIndex>>,
    by_name: HashMap<&'static str, usize>,
    file_ids: Arc<FileIdRegistry>,
    stamps: IndexingStamps,
    attic: ContentAttic,
    membership: Arc<dyn ContentRootMembership>,
    old_contents: DashMap<InputId, PendingContent>,
    /// 本次会话需要重建的索引：扫描时忽略它们的 stamp
    rebuild_set: Mutex<HashSet<&'static str>>,
    /// 本次会话已完整扫描过的 (项目, 索引)
    scanned: Mutex<HashSet<(String, &'static str)>>,
    projects: RwLock<HashMap<String, Project>>,
    closed: AtomicBool,
}

impl FileBasedIndex {
    pub fn builder(config: EngineConfig) -> FileBasedIndexBuilder {
        FileBasedIndexBuilder {
            config,
            indexes: Vec::new(),
            membership: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn file_ids(&self) -> &Arc<FileIdRegistry> {
        &self.file_ids
    }

    /// 路径对应的文件句柄（必要时分配 id）
    pub fn file(&self, path: &Path) -> FileHandle {
        self.file_ids.handle_for(path)
    }

    /// 已注册的索引名（注册顺序）
    pub fn index_names(&self) -> Vec<&'static str> {
        self.indexes.iter().map(|i| i.name()).collect()
    }

    pub fn index_state(&self, name: &str) -> Result<IndexState, IndexError> {
        Ok(self.erased(name)?.state())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), IndexError> {
        if self.is_closed() {
            return Err(IndexError::Closed);
        }
        Ok(())
    }

    fn erased(&self, name: &str) -> Result<&dyn ErasedIndex, IndexError> {
        self.by_name
            .get(name)
            .map(|i| self.indexes[*i].as_ref())
            .ok_or_else(|| IndexError::UnknownIndex(name.to_string()))
    }

    fn typed<K: IndexKey, V: IndexValue>(
        &self,
        id: IndexId<K, V>,
    ) -> Result<&RegisteredIndex<K, V>, IndexError> {
        self.erased(id.name())?
            .as_any()
            .downcast_ref::<RegisteredIndex<K, V>>()
            .ok_or_else(|| IndexError::TypeMismatch(id.name().to_string()))
    }

    // ---------------------------------------------------------------
    // 增量路径
    // ---------------------------------------------------------------

    /// 文件即将变化：若有索引接受它，则把当前磁盘内容存入旧内容槽；否则清掉残留的槽。
    pub fn before_change(&self, file: &FileHandle) {
        let accepted_by = self.accepting(file);
        if accepted_by.is_empty() {
            self.old_contents.remove(&file.id);
            return;
        }
        let needs_text = accepted_by
            .iter()
            .any(|i| self.indexes[*i].depends_on_content());
        let existed = file.is_valid();
        let text = if needs_text && existed {
            Some(ContentSnapshot::load(file).text)
        } else {
            None
        };
        self.old_contents.insert(
            file.id,
            PendingContent {
                path: Arc::from(file.path.as_path()),
                text,
                existed,
                accepted_by,
            },
        );
    }

    /// 与 `before_change` 相同，但旧内容由调用方给出（事件到达时磁盘已是新内容）。
    ///
    /// 文件此前是否存在按 “有旧内容或任一索引已 stamp” 判定。
    pub fn before_change_with_content(&self, file: &FileHandle, old_text: Option<Arc<str>>) {
        let accepted_by = self.accepting(file);
        if accepted_by.is_empty() {
            self.old_contents.remove(&file.id);
            return;
        }
        let existed = old_text.is_some()
            || self
                .indexes
                .iter()
                .any(|index| self.stamps.is_indexed(file.id, index.name()));
        self.old_contents.insert(
            file.id,
            PendingContent {
                path: Arc::from(file.path.as_path()),
                text: old_text,
                existed,
                accepted_by,
            },
        );
    }

    /// 文件已经变化：对现在接受它、或变化前接受它的索引做 diff 更新。
    ///
    /// 新内容只加载一次，所有索引共享。更新成功且有新内容 → 设 stamp；
    /// 新内容缺失（删除 / 不再被接受）→ 清 stamp。失败只记日志，文件保持未 stamp。
    pub fn after_change(&self, file: &FileHandle) {
        self.apply_change(file, file.is_valid());
    }

    /// `exists == false` 时按文件已消失处理（即使路径上现在有别的文件）
    fn apply_change(&self, file: &FileHandle, exists: bool) {
        if self.is_closed() {
            tracing::debug!("after_change on closed engine ignored: {:?}", file.path);
            return;
        }
        let pending = self.old_contents.remove(&file.id).map(|(_, p)| p);
        let mut new_text: Option<Arc<str>> = None;
        let mut indexed_content = false;
        let mut content_failed = false;

        for (i, index) in self.indexes.iter().enumerate() {
            let index = index.as_ref();
            let accepts_now = exists && index.accepts(file);
            let accepted_before = pending
                .as_ref()
                .is_some_and(|p| p.accepted_by.contains(&i));
            if !accepts_now && !accepted_before {
                continue;
            }

            let old = pending
                .as_ref()
                .filter(|_| accepted_before)
                .and_then(|p| p.old_snapshot(file.id, index));
            let new = if !accepts_now {
                None
            } else if index.depends_on_content() {
                let text = new_text
                    .get_or_insert_with(|| ContentSnapshot::load(file).text)
                    .clone();
                indexed_content = true;
                Some(ContentSnapshot::new(file.id, &file.path, text))
            } else {
                Some(ContentSnapshot::without_text(file))
            };

            match index.update(file.id, new.as_ref(), old.as_ref()) {
                Ok(()) if new.is_some() => self.stamps.set(file.id, index.name()),
                Ok(()) => self.stamps.clear(file.id, index.name()),
                Err(e) => {
                    tracing::warn!(index = %index.name(), "Update of {:?} failed: {}", file.path, e);
                    content_failed |= index.depends_on_content();
                    self.stamps.clear(file.id, index.name());
                }
            }
        }

        // 有内容索引更新失败时阁楼保留旧文本：下次 diff 仍以存储里实际残留的内容为基准
        let attic_result = match (content_failed, indexed_content, new_text) {
            (true, _, _) => Ok(()),
            (false, true, Some(text)) => self.attic.put(file.id, &text),
            _ if pending.as_ref().is_some_and(|p| p.text.is_some()) => self.attic.remove(file.id),
            _ => Ok(()),
        };
        if let Err(e) = attic_result {
            tracing::warn!("Content attic update for {:?} failed: {}", file.path, e);
        }
    }

    fn accepting(&self, file: &FileHandle) -> Vec<usize> {
        self.indexes
            .iter()
            .enumerate()
            .filter(|(_, index)| index.accepts(file))
            .map(|(i, _)| i)
            .collect()
    }

    /// 应用一个文件系统事件（before/after 成对执行）。
    ///
    /// 事件到达时磁盘已是新状态，旧内容取自内容阁楼。
    pub fn apply_file_event(&self, event: &FileEvent) -> Result<(), IndexError> {
        self.ensure_open()?;
        if event.path.starts_with(self.layout.root()) {
            return Ok(());
        }

        match &event.event_type {
            EventType::Create | EventType::Modify => {
                if event.path.is_dir() {
                    let files = collect_files(
                        std::slice::from_ref(&event.path),
                        &self.config,
                        self.layout.root(),
                    );
                    for path in files {
                        self.refresh(&self.file_ids.handle_for(&path));
                    }
                } else {
                    self.refresh(&self.file_ids.handle_for(&event.path));
                }
            }
            EventType::Delete => {
                for handle in self.known_under(&event.path) {
                    self.refresh(&handle);
                }
            }
            EventType::Rename { from } => {
                if from.starts_with(self.layout.root()) {
                    return self.apply_file_event(&FileEvent::new(EventType::Create, &event.path));
                }
                let moved = self.known_under(from);
                if moved.is_empty() {
                    return self.apply_file_event(&FileEvent::new(EventType::Create, &event.path));
                }
                for old in moved {
                    let relative = old.path.strip_prefix(from).unwrap_or(Path::new(""));
                    let to = if relative.as_os_str().is_empty() {
                        event.path.clone()
                    } else {
                        event.path.join(relative)
                    };
                    // 覆盖式 rename：目标路径上原来的文件被替换，先把它当作删除处理
                    if let Some(displaced) = self.file_ids.lookup(&to).filter(|id| *id != old.id) {
                        let gone = FileHandle::new(displaced, &to);
                        self.before_change_with_content(&gone, self.attic_text(displaced));
                        self.apply_change(&gone, false);
                    }
                    self.before_change_with_content(&old, self.attic_text(old.id));
                    self.file_ids.rename(&old.path, &to);
                    self.after_change(&FileHandle::new(old.id, to));
                }
            }
        }
        Ok(())
    }

    fn refresh(&self, handle: &FileHandle) {
        self.before_change_with_content(handle, self.attic_text(handle.id));
        self.after_change(handle);
    }

    fn known_under(&self, path: &Path) -> Vec<FileHandle> {
        match self.file_ids.lookup(path) {
            Some(id) => vec![FileHandle::new(id, path)],
            None => self.file_ids.ids_under(path),
        }
    }

    fn attic_text(&self, id: InputId) -> Option<Arc<str>> {
        match self.attic.get(id) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Content attic read for id {} failed: {}", id, e);
                None
            }
        }
    }

    // ---------------------------------------------------------------
    // 项目与批量扫描
    // ---------------------------------------------------------------

    /// 注册项目并在后台线程中扫描它
    pub fn open_project(self: &Arc<Self>, project: Project) -> ScanHandle {
        self.projects
            .write()
            .insert(project.name.clone(), project.clone());

        let cancel = Arc::new(AtomicBool::new(false));
        let engine = self.clone();
        let flag = cancel.clone();
        let thread = std::thread::spawn(move || engine.scan_project(&project, &flag));
        ScanHandle::new(cancel, thread)
    }

    pub fn project(&self, name: &str) -> Result<Project, IndexError> {
        self.projects
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| IndexError::UnknownProject(name.to_string()))
    }

    pub fn projects(&self) -> Vec<Project> {
        let mut projects: Vec<Project> = self.projects.read().values().cloned().collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        projects
    }

    /// 重新扫描所有已打开的项目（例如事件丢失之后）
    pub fn rescan_projects(self: &Arc<Self>) -> Vec<ScanHandle> {
        self.projects()
            .into_iter()
            .map(|p| self.open_project(p))
            .collect()
    }

    /// 同步扫描一个项目的全部 content roots。
    ///
    /// 每个 (file, index)：已 stamp 则跳过，除非该索引在本次会话的重建集合中且项目尚未被完整扫描过；
    /// 否则若索引接受该文件，加载内容、`update(id, Some(content), None)`、设 stamp。
    /// 结束后 flush 全部存储。取消只在文件之间生效。
    pub fn scan_project(&self, project: &Project, cancel: &AtomicBool) -> Result<ScanOutcome, IndexError> {
        self.ensure_open()?;
        let started = std::time::Instant::now();

        let forced: HashSet<&'static str> = {
            let scanned = self.scanned.lock();
            self.rebuild_set
                .lock()
                .iter()
                .copied()
                .filter(|name| !scanned.contains(&(project.name.clone(), *name)))
                .collect()
        };

        let files = collect_files(&project.content_roots, &self.config, self.layout.root());
        tracing::info!(
            "Scanning project {} ({} files, {} indexes forced)",
            project.name,
            files.len(),
            forced.len()
        );

        let updated = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);

        files.par_iter().for_each(|path| {
            if cancel.load(Ordering::Relaxed) || self.is_closed() {
                return;
            }
            let handle = self.file_ids.handle_for(path);
            let mut text: Option<Arc<str>> = None;
            let mut content_failed = false;

            for index in &self.indexes {
                let index = index.as_ref();
                if !index.is_available() || !index.accepts(&handle) {
                    continue;
                }
                let name = index.name();
                if !forced.contains(name) && self.stamps.is_indexed(handle.id, name) {
                    skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let content = if index.depends_on_content() {
                    let text = text
                        .get_or_insert_with(|| ContentSnapshot::load(&handle).text)
                        .clone();
                    ContentSnapshot::new(handle.id, &handle.path, text)
                } else {
                    ContentSnapshot::without_text(&handle)
                };
                match index.update(handle.id, Some(&content), None) {
                    Ok(()) => {
                        self.stamps.set(handle.id, name);
                        updated.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::warn!(index = %name, "Indexing {:?} failed: {}", handle.path, e);
                        content_failed |= index.depends_on_content();
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }

            if let Some(text) = text.filter(|_| !content_failed) {
                if let Err(e) = self.attic.put(handle.id, &text) {
                    tracing::warn!("Content attic update for {:?} failed: {}", handle.path, e);
                }
            }
        });

        let cancelled = cancel.load(Ordering::Relaxed);
        self.flush_caches()?;

        if !cancelled {
            let mut scanned = self.scanned.lock();
            for index in &self.indexes {
                scanned.insert((project.name.clone(), index.name()));
            }
            drop(scanned);
            let rebuild_set = self.rebuild_set.lock();
            for index in &self.indexes {
                if rebuild_set.contains(index.name())
                    && index.is_available()
                    && index.state() == IndexState::RequiresRebuild
                {
                    index.set_state(IndexState::Ready);
                }
            }
        }

        let outcome = ScanOutcome {
            project: project.name.clone(),
            files: files.len(),
            updated: updated.into_inner(),
            skipped: skipped.into_inner(),
            failed: failed.into_inner(),
            cancelled,
        };
        tracing::info!(
            "Scan of {} {} in {:?}: {} updated, {} skipped, {} failed",
            project.name,
            if cancelled { "cancelled" } else { "complete" },
            started.elapsed(),
            outcome.updated,
            outcome.skipped,
            outcome.failed
        );
        Ok(outcome)
    }

    // ---------------------------------------------------------------
    // 查询
    // ---------------------------------------------------------------

    /// key 下的全部 Value；给定项目时只保留至少有一个贡献文件在项目内的 Value
    pub fn get_data<K: IndexKey, V: IndexValue>(
        &self,
        id: IndexId<K, V>,
        key: &K,
        project: Option<&Project>,
    ) -> Result<Vec<V>, IndexError> {
        self.ensure_open()?;
        let container = self.typed(id)?.with_index(|index| index.data(key))?;
        Ok(match project {
            None => container.to_value_list(),
            Some(project) => container
                .iter()
                .filter_map(|(value, mut ids)| {
                    ids.any(|i| self.membership.contains(i, project))
                        .then(|| value.clone())
                })
                .collect(),
        })
    }

    /// key 下所有贡献文件（按 id 升序，已失去路径的 id 不返回）
    pub fn get_containing_files<K: IndexKey, V: IndexValue>(
        &self,
        id: IndexId<K, V>,
        key: &K,
        project: Option<&Project>,
    ) -> Result<Vec<FileHandle>, IndexError> {
        self.ensure_open()?;
        let container = self.typed(id)?.with_index(|index| index.data(key))?;
        let ids: BTreeSet<InputId> = container.iter().flat_map(|(_, ids)| ids).collect();
        Ok(ids
            .into_iter()
            .filter(|i| project.map_or(true, |p| self.membership.contains(*i, p)))
            .filter_map(|i| self.file_ids.handle(i))
            .collect())
    }

    /// 全部非空 key（升序）
    pub fn get_all_keys<K: IndexKey, V: IndexValue>(
        &self,
        id: IndexId<K, V>,
    ) -> Result<Vec<K>, IndexError> {
        self.ensure_open()?;
        self.typed(id)?.with_index(|index| index.keys())
    }

    /// 逐个访问 (InputId, Value)；`file` 给定时只访问该文件的贡献。
    /// processor 返回 false 时停止；返回值表示是否遍历完成。
    pub fn process_values<K: IndexKey, V: IndexValue>(
        &self,
        id: IndexId<K, V>,
        key: &K,
        file: Option<&FileHandle>,
        mut processor: impl FnMut(InputId, &V) -> bool,
    ) -> Result<bool, IndexError> {
        self.ensure_open()?;
        let container = self.typed(id)?.with_index(|index| index.data(key))?;
        for (value, ids) in container.iter() {
            for input_id in ids {
                if file.is_some_and(|f| f.id != input_id) {
                    continue;
                }
                if !processor(input_id, value) {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// 按名字查询（key 为 JSON 或裸字符串），HTTP 层使用
    pub fn lookup(
        &self,
        index: &str,
        raw_key: &str,
        project: Option<&Project>,
    ) -> Result<Vec<ValueHit>, IndexError> {
        self.ensure_open()?;
        let mut hits = self.erased(index)?.lookup_json(raw_key)?;
        if let Some(project) = project {
            for hit in &mut hits {
                hit.input_ids.retain(|i| self.membership.contains(*i, project));
            }
            hits.retain(|hit| !hit.input_ids.is_empty());
        }
        Ok(hits)
    }

    // ---------------------------------------------------------------
    // 维护
    // ---------------------------------------------------------------

    /// 丢弃某个索引的全部数据与 stamp，标记为 RequiresRebuild；
    /// 之后每个项目的下一次扫描会重新索引它。
    pub fn request_rebuild(&self, name: &str) -> Result<(), IndexError> {
        self.ensure_open()?;
        let index = self.erased(name)?;
        let name = index.name();
        tracing::warn!(index = %name, "Rebuild requested");

        let cleared = if index.is_available() {
            index.clear()
        } else {
            let capacity = self.config.cache_capacity.unwrap_or_else(|| index.cache_size());
            index
                .open_storage(&self.layout.storage_file(name), capacity)
                .map(|_| ())
                .map_err(IndexError::from)
                .and_then(|()| index.clear())
        };
        index.set_state(IndexState::RequiresRebuild);
        self.rebuild_set.lock().insert(name);
        self.scanned.lock().retain(|(_, index)| *index != name);
        self.stamps.clear_index(name)?;
        self.layout.write_version(name, index.version())?;
        cleared
    }

    /// flush 全部索引存储、stamp、id 注册表与内容阁楼。
    /// 某个索引 flush 失败时请求重建该索引，不影响其它索引。
    pub fn flush_caches(&self) -> Result<(), IndexError> {
        self.ensure_open()?;
        for index in &self.indexes {
            if !index.is_available() {
                continue;
            }
            if let Err(e) = index.flush() {
                tracing::error!(index = %index.name(), "Flush failed, requesting rebuild: {}", e);
                if let Err(e) = self.request_rebuild(index.name()) {
                    tracing::error!(index = %index.name(), "Rebuild request failed: {}", e);
                }
            }
        }
        self.stamps.flush()?;
        self.file_ids.flush()?;
        self.attic.flush()?;
        Ok(())
    }

    pub fn report(&self) -> EngineReport {
        let indexes = self
            .indexes
            .iter()
            .map(|index| IndexReport {
                name: index.name().to_string(),
                version: index.version(),
                state: index.state(),
                available: index.is_available(),
                stamped_files: self.stamps.stamped_count(index.name()),
                storage: index.stats(),
            })
            .collect();
        let mut rebuild_set: Vec<String> =
            self.rebuild_set.lock().iter().map(|s| s.to_string()).collect();
        rebuild_set.sort();
        EngineReport {
            index_root: self.layout.root().to_path_buf(),
            indexes,
            known_files: self.file_ids.len(),
            attic_entries: self.attic.len(),
            pending_changes: self.old_contents.len(),
            projects: self.projects().into_iter().map(|p| p.name).collect(),
            rebuild_set,
        }
    }

    /// 关闭：flush 并关闭所有存储、stamp、id 注册表、阁楼，最后删除 work_in_progress 标记。
    /// 幂等；任何一步失败都保留标记，下次启动会整体重建。
    pub fn close(&self) -> Result<(), IndexError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!("Closing index engine at {:?}", self.layout.root());

        let mut first_error: Option<IndexError> = None;
        let mut note = |result: Result<(), IndexError>, what: &str| {
            if let Err(e) = result {
                tracing::error!("Close: {} failed: {}", what, e);
                first_error.get_or_insert(e);
            }
        };

        for index in &self.indexes {
            note(index.close().map_err(IndexError::from), index.name());
        }
        note(self.stamps.flush().map_err(IndexError::from), "stamps");
        note(self.file_ids.flush().map_err(IndexError::from), "file id registry");
        note(self.attic.close().map_err(IndexError::from), "content attic");
        self.old_contents.clear();

        match first_error {
            Some(e) => Err(e),
            None => {
                self.layout.remove_marker()?;
                Ok(())
            }
        }
    }
}

impl Drop for FileBasedIndex {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!("Index engine close on drop failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::builtin::{FileNameIndex, FILE_NAMES};
    use std::path::PathBuf;

    const PAIRS: IndexId<String, String> = IndexId::new("pairs");

    /// `*.kv` 文件，每行 `key=value`
    struct Pairs {
        version: u32,
    }

    impl FileBasedIndexExtension for Pairs {
        type Key = String;
        type Value = String;

        fn name(&self) -> IndexId<String, String> {
            PAIRS
        }

        fn map(&self, content: &ContentSnapshot) -> Vec<(String, String)> {
            content
                .text
                .lines()
                .filter_map(|l| l.split_once('='))
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .collect()
        }

        fn accepts(&self, file: &FileHandle) -> bool {
            file.path.extension().is_some_and(|e| e == "kv")
        }

        fn version(&self) -> u32 {
            self.version
        }
    }

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("fb-index-engine-{}-{}", tag, nanos))
    }

    fn open_engine(root: &Path) -> Arc<FileBasedIndex> {
        FileBasedIndex::builder(EngineConfig::with_root(root.join("idx")))
            .register(Pairs { version: 0 })
            .register(FileNameIndex)
            .open()
            .unwrap()
    }

    /// root/src/{a.kv, b.kv, notes.txt}
    fn seed_project(root: &Path) -> Project {
        let src = root.join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.kv"), "k1=v1\nshared=a").unwrap();
        std::fs::write(src.join("b.kv"), "k2=v2\nshared=b").unwrap();
        std::fs::write(src.join("notes.txt"), "k1=ignored").unwrap();
        Project::new("main", vec![src])
    }

    fn scan(engine: &FileBasedIndex, project: &Project) -> ScanOutcome {
        engine.scan_project(project, &AtomicBool::new(false)).unwrap()
    }

    fn values(engine: &FileBasedIndex, key: &str, project: Option<&Project>) -> Vec<String> {
        let mut v = engine.get_data(PAIRS, &key.to_string(), project).unwrap();
        v.sort();
        v
    }

    #[test]
    fn incremental_change_applies_diff_and_stamps() {
        let root = unique_tmp_dir("incremental");
        std::fs::create_dir_all(&root).unwrap();
        let engine = open_engine(&root);
        let path = root.join("a.kv");
        let file = engine.file(&path);

        engine.before_change(&file);
        std::fs::write(&path, "k1=v1\nk2=v2").unwrap();
        engine.after_change(&file);
        assert_eq!(values(&engine, "k1", None), vec!["v1"]);
        assert!(engine.stamps.is_indexed(file.id, "pairs"));

        engine.before_change(&file);
        std::fs::write(&path, "k2=v2\nk3=v3").unwrap();
        engine.after_change(&file);
        assert!(values(&engine, "k1", None).is_empty());
        assert_eq!(values(&engine, "k2", None), vec!["v2"]);
        assert_eq!(values(&engine, "k3", None), vec!["v3"]);
        assert_eq!(
            engine.get_all_keys(PAIRS).unwrap(),
            vec!["k2".to_string(), "k3".to_string()]
        );

        engine.before_change(&file);
        std::fs::remove_file(&path).unwrap();
        engine.after_change(&file);
        assert!(engine.get_all_keys(PAIRS).unwrap().is_empty());
        assert!(!engine.stamps.is_indexed(file.id, "pairs"));
        assert!(!engine.stamps.is_indexed(file.id, "FileNames"));
        assert_eq!(engine.attic.len(), 0);
    }

    #[test]
    fn project_filter_keeps_values_from_its_roots() {
        let root = unique_tmp_dir("projects");
        let p1 = Project::new("p1", vec![root.join("p1")]);
        let p2 = Project::new("p2", vec![root.join("p2")]);
        std::fs::create_dir_all(root.join("p1")).unwrap();
        std::fs::create_dir_all(root.join("p2")).unwrap();
        std::fs::write(root.join("p1/x.kv"), "k=a").unwrap();
        std::fs::write(root.join("p2/y.kv"), "k=b").unwrap();

        let engine = open_engine(&root);
        scan(&engine, &p1);
        scan(&engine, &p2);

        assert_eq!(values(&engine, "k", None), vec!["a", "b"]);
        assert_eq!(values(&engine, "k", Some(&p1)), vec!["a"]);
        assert_eq!(values(&engine, "k", Some(&p2)), vec!["b"]);

        let files = engine
            .get_containing_files(PAIRS, &"k".to_string(), Some(&p2))
            .unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, root.join("p2/y.kv"));
        assert_eq!(
            engine
                .get_containing_files(PAIRS, &"k".to_string(), None)
                .unwrap()
                .len(),
            2
        );
    }

    #[test]
    fn unregistered_index_is_deleted_on_startup() {
        let root = unique_tmp_dir("gc");
        let project = seed_project(&root);
        let engine = open_engine(&root);
        scan(&engine, &project);
        engine.close().unwrap();
        drop(engine);

        let layout = IndexLayout::new(root.join("idx"));
        assert!(layout.storage_file("FileNames").exists());

        let engine = FileBasedIndex::builder(EngineConfig::with_root(root.join("idx")))
            .register(Pairs { version: 0 })
            .open()
            .unwrap();
        assert!(!layout.storage_file("FileNames").exists());
        assert!(!layout.version_file("FileNames").exists());
        assert!(layout.storage_file("pairs").exists());
        let registered: Vec<String> = layout.read_registered().into_iter().collect();
        assert_eq!(registered, vec!["pairs".to_string()]);
        assert_eq!(engine.index_state("pairs").unwrap(), IndexState::Ready);
        assert_eq!(values(&engine, "k1", None), vec!["v1"]);
    }

    #[test]
    fn missing_storage_forces_rebuild_of_that_index_only() {
        let root = unique_tmp_dir("rebuild");
        let project = seed_project(&root);
        let engine = open_engine(&root);
        let first = scan(&engine, &project);
        assert_eq!(first.updated, 5);
        engine.close().unwrap();
        drop(engine);

        let layout = IndexLayout::new(root.join("idx"));
        std::fs::remove_file(layout.storage_file("pairs")).unwrap();

        let engine = open_engine(&root);
        assert_eq!(engine.index_state("pairs").unwrap(), IndexState::RequiresRebuild);
        assert_eq!(engine.index_state("FileNames").unwrap(), IndexState::Ready);
        assert!(engine.get_all_keys(PAIRS).unwrap().is_empty());

        let outcome = scan(&engine, &project);
        assert_eq!(outcome.updated, 2);
        assert_eq!(outcome.skipped, 3);
        assert_eq!(engine.index_state("pairs").unwrap(), IndexState::Ready);
        assert_eq!(values(&engine, "shared", None), vec!["a", "b"]);
    }

    #[test]
    fn stamped_files_are_skipped_on_rescan() {
        let root = unique_tmp_dir("stamps");
        let project = seed_project(&root);
        let engine = open_engine(&root);
        scan(&engine, &project);

        let again = scan(&engine, &project);
        assert_eq!(again.files, 3);
        assert_eq!(again.updated, 0);
        assert_eq!(again.skipped, 5);
    }

    #[test]
    fn version_change_drops_stored_data() {
        let root = unique_tmp_dir("version");
        let project = seed_project(&root);
        let engine = open_engine(&root);
        scan(&engine, &project);
        engine.close().unwrap();
        drop(engine);

        let engine = FileBasedIndex::builder(EngineConfig::with_root(root.join("idx")))
            .register(Pairs { version: 2 })
            .register(FileNameIndex)
            .open()
            .unwrap();
        assert_eq!(engine.index_state("pairs").unwrap(), IndexState::RequiresRebuild);
        assert!(engine.get_all_keys(PAIRS).unwrap().is_empty());
        assert_eq!(
            IndexLayout::new(root.join("idx")).read_version("pairs"),
            Some(2)
        );
        assert_eq!(scan(&engine, &project).updated, 2);
    }

    #[test]
    fn unclean_shutdown_wipes_everything() {
        let root = unique_tmp_dir("crash");
        let project = seed_project(&root);
        let engine = open_engine(&root);
        scan(&engine, &project);
        // 不调用 close：work_in_progress 标记保留
        std::mem::forget(engine);

        let engine = open_engine(&root);
        assert_eq!(engine.index_state("pairs").unwrap(), IndexState::RequiresRebuild);
        assert_eq!(engine.index_state("FileNames").unwrap(), IndexState::RequiresRebuild);
        assert!(engine.get_all_keys(FILE_NAMES).unwrap().is_empty());
        assert_eq!(scan(&engine, &project).updated, 5);
    }

    #[test]
    fn rename_that_changes_eligibility_removes_entries() {
        let root = unique_tmp_dir("rename");
        let project = seed_project(&root);
        let engine = open_engine(&root);
        scan(&engine, &project);

        let from = root.join("src/a.kv");
        let to = root.join("src/a.txt");
        let id = engine.file_ids().lookup(&from).unwrap();
        std::fs::rename(&from, &to).unwrap();
        engine
            .apply_file_event(&FileEvent::new(EventType::Rename { from: from.clone() }, &to))
            .unwrap();

        assert!(values(&engine, "k1", None).is_empty());
        assert_eq!(values(&engine, "shared", None), vec!["b"]);
        assert_eq!(engine.file_ids().lookup(&to), Some(id));
        let names = engine.get_all_keys(FILE_NAMES).unwrap();
        assert!(names.contains(&"a.txt".to_string()));
        assert!(!names.contains(&"a.kv".to_string()));
        assert!(!engine.stamps.is_indexed(id, "pairs"));
        assert!(engine.stamps.is_indexed(id, "FileNames"));
    }

    #[test]
    fn modify_event_diffs_against_last_indexed_content() {
        let root = unique_tmp_dir("modify");
        let project = seed_project(&root);
        let engine = open_engine(&root);
        scan(&engine, &project);

        let path = root.join("src/a.kv");
        std::fs::write(&path, "k9=v9\nshared=a").unwrap();
        engine
            .apply_file_event(&FileEvent::new(EventType::Modify, &path))
            .unwrap();
        assert!(values(&engine, "k1", None).is_empty());
        assert_eq!(values(&engine, "k9", None), vec!["v9"]);
        assert_eq!(values(&engine, "shared", None), vec!["a", "b"]);

        std::fs::remove_dir_all(root.join("src")).unwrap();
        engine
            .apply_file_event(&FileEvent::new(EventType::Delete, root.join("src")))
            .unwrap();
        assert!(engine.get_all_keys(PAIRS).unwrap().is_empty());
        assert!(engine.get_all_keys(FILE_NAMES).unwrap().is_empty());
    }

    #[test]
    fn cancelled_scan_leaves_index_requiring_rebuild() {
        let root = unique_tmp_dir("cancel");
        let project = seed_project(&root);
        let engine = open_engine(&root);

        let outcome = engine
            .scan_project(&project, &AtomicBool::new(true))
            .unwrap();
        assert!(outcome.cancelled);
        assert_eq!(outcome.updated, 0);
        assert_eq!(engine.index_state("pairs").unwrap(), IndexState::RequiresRebuild);

        let handle = engine.open_project(project.clone());
        let outcome = handle.join().unwrap();
        assert!(!outcome.cancelled);
        assert_eq!(outcome.updated, 5);
        assert_eq!(engine.index_state("pairs").unwrap(), IndexState::Ready);
        assert_eq!(engine.project("main").unwrap(), project);
    }

    #[test]
    fn request_rebuild_clears_and_next_scan_restores() {
        let root = unique_tmp_dir("request");
        let project = seed_project(&root);
        let engine = open_engine(&root);
        scan(&engine, &project);

        engine.request_rebuild("pairs").unwrap();
        assert_eq!(engine.index_state("pairs").unwrap(), IndexState::RequiresRebuild);
        assert!(engine.get_all_keys(PAIRS).unwrap().is_empty());

        let outcome = scan(&engine, &project);
        assert_eq!(outcome.updated, 2);
        assert_eq!(values(&engine, "k2", None), vec!["v2"]);
        assert_eq!(engine.index_state("pairs").unwrap(), IndexState::Ready);
    }

    #[test]
    fn process_values_stops_when_asked() {
        let root = unique_tmp_dir("process");
        let project = seed_project(&root);
        let engine = open_engine(&root);
        scan(&engine, &project);

        let key = "shared".to_string();
        let mut seen = Vec::new();
        let complete = engine
            .process_values(PAIRS, &key, None, |id, v| {
                seen.push((id, v.clone()));
                false
            })
            .unwrap();
        assert!(!complete);
        assert_eq!(seen.len(), 1);

        let b = engine.file(&root.join("src/b.kv"));
        let mut only_b = Vec::new();
        assert!(engine
            .process_values(PAIRS, &key, Some(&b), |id, v| {
                only_b.push((id, v.clone()));
                true
            })
            .unwrap());
        assert_eq!(only_b, vec![(b.id, "b".to_string())]);
    }

    #[test]
    fn lookup_errors_and_closed_engine() {
        let root = unique_tmp_dir("errors");
        let engine = open_engine(&root);
        let wrong: IndexId<String, u32> = IndexId::new("pairs");
        assert!(matches!(
            engine.get_data(wrong, &"k".to_string(), None),
            Err(IndexError::TypeMismatch(_))
        ));
        let unknown: IndexId<String, String> = IndexId::new("nope");
        assert!(matches!(
            engine.get_data(unknown, &"k".to_string(), None),
            Err(IndexError::UnknownIndex(_))
        ));
        assert!(matches!(
            engine.project("ghost"),
            Err(IndexError::UnknownProject(_))
        ));

        engine.close().unwrap();
        engine.close().unwrap();
        assert!(!IndexLayout::new(root.join("idx")).has_marker());
        assert!(matches!(
            engine.get_data(PAIRS, &"k".to_string(), None),
            Err(IndexError::Closed)
        ));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let root = unique_tmp_dir("dup");
        let result = FileBasedIndex::builder(EngineConfig::with_root(root.join("idx")))
            .register(Pairs { version: 0 })
            .register(Pairs { version: 1 })
            .open();
        assert!(matches!(result, Err(IndexError::Duplicate(_))));
    }

    #[test]
    fn rename_over_indexed_file_drops_the_replaced_content() {
        let root = unique_tmp_dir("overwrite");
        let project = seed_project(&root);
        let engine = open_engine(&root);
        scan(&engine, &project);

        let target = root.join("src/a.kv");
        let replaced = engine.file_ids().lookup(&target).unwrap();
        let tmp = root.join("src/new.kv");
        std::fs::write(&tmp, "k1=fresh").unwrap();
        engine
            .apply_file_event(&FileEvent::new(EventType::Create, &tmp))
            .unwrap();
        let moved = engine.file_ids().lookup(&tmp).unwrap();

        // 编辑器式保存：临时文件 rename 覆盖原文件
        std::fs::rename(&tmp, &target).unwrap();
        engine
            .apply_file_event(&FileEvent::new(EventType::Rename { from: tmp.clone() }, &target))
            .unwrap();

        assert_eq!(values(&engine, "k1", None), vec!["fresh"]);
        assert_eq!(values(&engine, "shared", None), vec!["b"]);
        assert_eq!(engine.file_ids().lookup(&target), Some(moved));
        assert!(engine.file_ids().path_of(replaced).is_none());
        assert!(!engine.stamps.is_indexed(replaced, "pairs"));
        assert!(!engine.stamps.is_indexed(replaced, "FileNames"));
        assert_eq!(engine.attic.get(replaced).unwrap(), None);

        let names = engine.get_all_keys(FILE_NAMES).unwrap();
        assert!(!names.contains(&"new.kv".to_string()));
        let a_owners = engine
            .get_containing_files(FILE_NAMES, &"a.kv".to_string(), None)
            .unwrap();
        assert_eq!(a_owners, vec![FileHandle::new(moved, &target)]);
    }

    #[test]
    fn failed_update_keeps_last_indexed_content_in_attic() {
        let root = unique_tmp_dir("attic-fail");
        let project = seed_project(&root);
        let engine = open_engine(&root);
        scan(&engine, &project);

        let path = root.join("src/a.kv");
        let id = engine.file_ids().lookup(&path).unwrap();
        let pairs = engine.erased("pairs").unwrap();
        pairs.close().unwrap();

        std::fs::write(&path, "k9=v9").unwrap();
        engine
            .apply_file_event(&FileEvent::new(EventType::Modify, &path))
            .unwrap();
        assert!(!engine.stamps.is_indexed(id, "pairs"));
        assert_eq!(
            engine.attic.get(id).unwrap().as_deref(),
            Some("k1=v1\nshared=a")
        );

        pairs
            .open_storage(&engine.layout.storage_file("pairs"), 16)
            .unwrap();
        engine
            .apply_file_event(&FileEvent::new(EventType::Modify, &path))
            .unwrap();
        assert!(values(&engine, "k1", None).is_empty());
        assert_eq!(values(&engine, "k9", None), vec!["v9"]);
        assert_eq!(values(&engine, "shared", None), vec!["b"]);
        assert_eq!(engine.attic.get(id).unwrap().as_deref(), Some("k9=v9"));
    }

    #[test]
    fn unopenable_storage_disables_only_that_index() {
        let root = unique_tmp_dir("unopenable");
        let project = seed_project(&root);
        let layout = IndexLayout::new(root.join("idx"));
        layout.ensure_dirs().unwrap();
        std::fs::create_dir_all(layout.storage_file("pairs")).unwrap();

        let engine = open_engine(&root);
        assert_eq!(engine.index_state("pairs").unwrap(), IndexState::RequiresRebuild);
        assert!(matches!(
            engine.get_data(PAIRS, &"k1".to_string(), None),
            Err(IndexError::Unavailable(_))
        ));

        let outcome = scan(&engine, &project);
        assert_eq!(outcome.updated, 3);
        assert_eq!(outcome.failed, 0);
        assert_eq!(engine.index_state("FileNames").unwrap(), IndexState::Ready);
        assert_eq!(
            engine.get_all_keys(FILE_NAMES).unwrap(),
            vec!["a.kv".to_string(), "b.kv".to_string(), "notes.txt".to_string()]
        );
        engine.close().unwrap();
    }
}
