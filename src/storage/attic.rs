use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::InputId;
use crate::error::StorageError;
use crate::storage::persistent_map::PersistentMap;

/// 内容阁楼：记录每个文件 “最近一次被索引时” 的文本。
///
/// 文件系统事件到达时磁盘上已经是新内容；旧内容从这里取出，
/// 作为 `before_change_with_content` 的输入，否则 diff 删不掉旧的 (Key, Value)。
pub struct ContentAttic {
    path: PathBuf,
    map: Mutex<Option<PersistentMap>>,
}

impl ContentAttic {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let map = match PersistentMap::open(&path) {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("Content attic {:?} unusable ({}), recreating", path, e);
                crate::storage::checked_file::remove_if_exists(&path)?;
                PersistentMap::open(&path)?
            }
        };
        Ok(Self {
            path,
            map: Mutex::new(Some(map)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: InputId) -> Result<Option<Arc<str>>, StorageError> {
        let guard = self.map.lock();
        let map = guard.as_ref().ok_or_else(|| StorageError::Closed(self.path.clone()))?;
        Ok(map
            .get(&id.to_le_bytes())?
            .map(|bytes| Arc::from(String::from_utf8_lossy(&bytes).as_ref())))
    }

    pub fn put(&self, id: InputId, text: &str) -> Result<(), StorageError> {
        let mut guard = self.map.lock();
        let map = guard.as_mut().ok_or_else(|| StorageError::Closed(self.path.clone()))?;
        map.put(&id.to_le_bytes(), text.as_bytes())
    }

    pub fn remove(&self, id: InputId) -> Result<(), StorageError> {
        let mut guard = self.map.lock();
        let map = guard.as_mut().ok_or_else(|| StorageError::Closed(self.path.clone()))?;
        map.remove(&id.to_le_bytes()).map(|_| ())
    }

    pub fn len(&self) -> usize {
        self.map.lock().as_ref().map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        let mut guard = self.map.lock();
        let map = guard.as_mut().ok_or_else(|| StorageError::Closed(self.path.clone()))?;
        map.clear()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        let mut guard = self.map.lock();
        let Some(map) = guard.as_mut() else {
            return Ok(());
        };
        map.compact_if_worthwhile()?;
        map.flush()
    }

    pub fn close(&self) -> Result<(), StorageError> {
        match self.map.lock().take() {
            Some(map) => map.close(),
            None => Ok(()),
        }
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
        std::env::temp_dir().join(format!("fb-index-attic-{}-{}", tag, nanos))
    }

    #[test]
    fn stores_latest_text_per_file() {
        let dir = unique_tmp_dir("latest");
        std::fs::create_dir_all(&dir).unwrap();
        let attic = ContentAttic::open(dir.join("attic.dat")).unwrap();
        attic.put(1, "old").unwrap();
        attic.put(1, "new").unwrap();
        attic.put(2, "other").unwrap();
        attic.remove(2).unwrap();
        attic.close().unwrap();

        let attic = ContentAttic::open(dir.join("attic.dat")).unwrap();
        assert_eq!(attic.get(1).unwrap().as_deref(), Some("new"));
        assert!(attic.get(2).unwrap().is_none());
        assert_eq!(attic.len(), 1);
    }

    #[test]
    fn closed_attic_rejects_access() {
        let dir = unique_tmp_dir("closed");
        std::fs::create_dir_all(&dir).unwrap();
        let attic = ContentAttic::open(dir.join("attic.dat")).unwrap();
        attic.close().unwrap();
        attic.close().unwrap();
        assert!(matches!(attic.put(1, "x"), Err(StorageError::Closed(_))));
        attic.flush().unwrap();
    }
}
