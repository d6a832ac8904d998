use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::core::{FileHandle, InputId};
use crate::error::StorageError;
use crate::storage::checked_file::{read_checked, write_atomic};

const IDS_MAGIC: u32 = 0x4449_4631; // "1FID"
const IDS_VERSION: u32 = 1;

#[derive(Serialize, Deserialize, Default)]
struct RegistryData {
    next_id: InputId,
    entries: Vec<(InputId, PathBuf)>,
}

#[derive(Default)]
struct Tables {
    by_path: HashMap<PathBuf, InputId>,
    by_id: HashMap<InputId, PathBuf>,
    next_id: InputId,
    dirty: bool,
}

/// 路径 ↔ InputId 注册表。
///
/// - id 从 1 开始单调分配，永不复用（索引里可能仍残留旧 id 的数据）
/// - rename 保留 id，只改路径
/// - 持久化为单个原子替换文件；flush 时才写盘
pub struct FileIdRegistry {
    path: PathBuf,
    tables: RwLock<Tables>,
    reset: bool,
}

impl FileIdRegistry {
    /// 打开注册表。文件损坏时从空表开始，并通过 `was_reset` 告知调用方：
    /// 此时已有索引中的 id 已经失去意义。
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (data, reset) = match read_checked(&path, IDS_MAGIC, IDS_VERSION) {
            Ok(Some(body)) => match bincode::deserialize::<RegistryData>(&body) {
                Ok(data) => (data, false),
                Err(e) => {
                    tracing::warn!("File id registry {:?} undecodable: {}, starting empty", path, e);
                    (RegistryData::default(), true)
                }
            },
            Ok(None) => (RegistryData::default(), false),
            Err(e) => {
                tracing::warn!("File id registry {:?} unreadable: {}, starting empty", path, e);
                (RegistryData::default(), true)
            }
        };

        let mut tables = Tables {
            next_id: data.next_id.max(1),
            ..Default::default()
        };
        for (id, p) in data.entries {
            tables.next_id = tables.next_id.max(id.saturating_add(1));
            tables.by_path.insert(p.clone(), id);
            tables.by_id.insert(id, p);
        }
        tracing::debug!("File id registry {:?}: {} entries", path, tables.by_id.len());

        Self {
            path,
            tables: RwLock::new(tables),
            reset,
        }
    }

    pub fn was_reset(&self) -> bool {
        self.reset
    }

    /// 取得（必要时分配）路径对应的 id
    pub fn id_for(&self, path: &Path) -> InputId {
        if let Some(id) = self.tables.read().by_path.get(path) {
            return *id;
        }
        let mut t = self.tables.write();
        if let Some(id) = t.by_path.get(path) {
            return *id;
        }
        let id = t.next_id;
        t.next_id += 1;
        t.by_path.insert(path.to_path_buf(), id);
        t.by_id.insert(id, path.to_path_buf());
        t.dirty = true;
        id
    }

    pub fn handle_for(&self, path: &Path) -> FileHandle {
        FileHandle::new(self.id_for(path), path)
    }

    pub fn lookup(&self, path: &Path) -> Option<InputId> {
        self.tables.read().by_path.get(path).copied()
    }

    pub fn path_of(&self, id: InputId) -> Option<PathBuf> {
        self.tables.read().by_id.get(&id).cloned()
    }

    pub fn handle(&self, id: InputId) -> Option<FileHandle> {
        self.path_of(id).map(|p| FileHandle::new(id, p))
    }

    /// 文件移动：id 跟随文件。目标路径若已有旧 id，旧 id 失去路径（成为孤儿）。
    pub fn rename(&self, from: &Path, to: &Path) -> Option<InputId> {
        let mut t = self.tables.write();
        let id = t.by_path.remove(from)?;
        if let Some(displaced) = t.by_path.insert(to.to_path_buf(), id) {
            t.by_id.remove(&displaced);
        }
        t.by_id.insert(id, to.to_path_buf());
        t.dirty = true;
        Some(id)
    }

    /// `dir` 之下（含自身）所有已知文件
    pub fn ids_under(&self, dir: &Path) -> Vec<FileHandle> {
        let t = self.tables.read();
        let mut out: Vec<FileHandle> = t
            .by_path
            .iter()
            .filter(|(p, _)| p.starts_with(dir))
            .map(|(p, id)| FileHandle::new(*id, p.clone()))
            .collect();
        out.sort_by_key(|h| h.id);
        out
    }

    pub fn len(&self) -> usize {
        self.tables.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        let mut t = self.tables.write();
        if !t.dirty {
            return Ok(());
        }
        let mut entries: Vec<(InputId, PathBuf)> =
            t.by_id.iter().map(|(id, p)| (*id, p.clone())).collect();
        entries.sort_by_key(|(id, _)| *id);
        let data = RegistryData {
            next_id: t.next_id,
            entries,
        };
        let body = bincode::serialize(&data)?;
        write_atomic(&self.path, IDS_MAGIC, IDS_VERSION, &body)?;
        t.dirty = false;
        Ok(())
    }
}
