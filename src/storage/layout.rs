use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::storage::checked_file::remove_if_exists;

/// 索引根目录布局：
///
/// ```text
/// <root>/
///   indexes/<name>.idx      每个索引的 PersistentMap
///   indexes/<name>.ver      扩展版本号（文本）
///   stamps/<name>.stamp     IndexingStamp 位图
///   registered              上次运行注册的索引名（JSON 数组）
///   file_ids.bin            路径 ↔ InputId
///   attic.dat               最近一次被索引的文件内容
///   work_in_progress        运行期标记；启动时仍存在说明上次没有正常关闭
/// ```
#[derive(Clone, Debug)]
pub struct IndexLayout {
    root: PathBuf,
}

impl IndexLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn indexes_dir(&self) -> PathBuf {
        self.root.join("indexes")
    }

    pub fn stamps_dir(&self) -> PathBuf {
        self.root.join("stamps")
    }

    pub fn storage_file(&self, index: &str) -> PathBuf {
        self.indexes_dir().join(format!("{}.idx", index.to_lowercase()))
    }

    pub fn version_file(&self, index: &str) -> PathBuf {
        self.indexes_dir().join(format!("{}.ver", index.to_lowercase()))
    }

    pub fn registered_file(&self) -> PathBuf {
        self.root.join("registered")
    }

    pub fn file_ids_file(&self) -> PathBuf {
        self.root.join("file_ids.bin")
    }

    pub fn attic_file(&self) -> PathBuf {
        self.root.join("attic.dat")
    }

    pub fn marker_file(&self) -> PathBuf {
        self.root.join("work_in_progress")
    }

    pub fn ensure_dirs(&self) -> Result<(), StorageError> {
        std::fs::create_dir_all(self.indexes_dir())?;
        std::fs::create_dir_all(self.stamps_dir())?;
        Ok(())
    }

    /// 上次运行留下的 work_in_progress 标记
    pub fn has_marker(&self) -> bool {
        self.marker_file().exists()
    }

    pub fn write_marker(&self) -> Result<(), StorageError> {
        std::fs::write(self.marker_file(), std::process::id().to_string())?;
        Ok(())
    }

    pub fn remove_marker(&self) -> Result<(), StorageError> {
        remove_if_exists(&self.marker_file())
    }

    /// 上次运行注册的索引名。文件缺失或不可解析时为空集（此时不做 GC）。
    pub fn read_registered(&self) -> BTreeSet<String> {
        let path = self.registered_file();
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to read {:?}: {}", path, e);
                }
                return BTreeSet::new();
            }
        };
        match serde_json::from_slice::<Vec<String>>(&raw) {
            Ok(names) => names.into_iter().collect(),
            Err(e) => {
                tracing::warn!("Registered-index record {:?} is malformed: {}", path, e);
                BTreeSet::new()
            }
        }
    }

    pub fn write_registered(&self, names: &BTreeSet<String>) -> Result<(), StorageError> {
        let names: Vec<&String> = names.iter().collect();
        let body = serde_json::to_vec_pretty(&names)
            .map_err(|e| StorageError::corrupt(self.registered_file(), e.to_string()))?;
        let tmp = self.root.join("registered.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, self.registered_file())?;
        Ok(())
    }

    /// `None` 表示版本文件缺失或不可解析
    pub fn read_version(&self, index: &str) -> Option<u32> {
        std::fs::read_to_string(self.version_file(index))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    pub fn write_version(&self, index: &str, version: u32) -> Result<(), StorageError> {
        std::fs::write(self.version_file(index), version.to_string())?;
        Ok(())
    }

    /// 删除一个索引的全部磁盘文件（存储 + 版本 + stamp）
    pub fn delete_index_files(&self, index: &str) -> Result<(), StorageError> {
        remove_if_exists(&self.storage_file(index))?;
        remove_if_exists(&self.version_file(index))?;
        remove_if_exists(&self.stamps_dir().join(format!("{}.stamp", index.to_lowercase())))
    }

    /// 整体清空（上次运行异常退出）：索引、stamp、id 表、阁楼全部作废
    pub fn wipe(&self) -> Result<(), StorageError> {
        for dir in [self.indexes_dir(), self.stamps_dir()] {
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        remove_if_exists(&self.file_ids_file())?;
        remove_if_exists(&self.attic_file())?;
        self.ensure_dirs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("fb-index-layout-{}-{}", tag, nanos))
    }

    #[test]
    fn registered_record_roundtrips_and_tolerates_garbage() {
        let layout = IndexLayout::new(unique_tmp_dir("registered"));
        layout.ensure_dirs().unwrap();
        assert!(layout.read_registered().is_empty());

        let names: BTreeSet<String> = ["words", "names"].iter().map(|s| s.to_string()).collect();
        layout.write_registered(&names).unwrap();
        assert_eq!(layout.read_registered(), names);

        std::fs::write(layout.registered_file(), b"{not json").unwrap();
        assert!(layout.read_registered().is_empty());
    }

    #[test]
    fn delete_and_wipe_remove_files() {
        let layout = IndexLayout::new(unique_tmp_dir("wipe"));
        layout.ensure_dirs().unwrap();
        std::fs::write(layout.storage_file("Words"), b"x").unwrap();
        layout.write_version("Words", 3).unwrap();
        assert_eq!(layout.read_version("words"), Some(3));

        layout.delete_index_files("Words").unwrap();
        assert!(!layout.storage_file("words").exists());
        assert_eq!(layout.read_version("Words"), None);

        std::fs::write(layout.storage_file("names"), b"x").unwrap();
        std::fs::write(layout.attic_file(), b"x").unwrap();
        layout.write_marker().unwrap();
        assert!(layout.has_marker());
        layout.wipe().unwrap();
        assert!(!layout.storage_file("names").exists());
        assert!(!layout.attic_file().exists());
        assert!(layout.indexes_dir().is_dir());
        layout.remove_marker().unwrap();
        assert!(!layout.has_marker());
    }
}
