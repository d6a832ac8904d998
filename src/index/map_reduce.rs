use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::core::{ContentSnapshot, IndexKey, IndexValue, InputId};
use crate::error::StorageError;
use crate::storage::{IndexStorage, StorageStats, ValueContainer};

/// 抽取函数：内容快照 → (Key, Value) 对
pub type Indexer<K, V> = Arc<dyn Fn(&ContentSnapshot) -> Vec<(K, V)> + Send + Sync>;

/// diff 更新契约。
///
/// `update(id, new, old)`：令 O = 抽取(old)，N = 抽取(new)（缺失一侧为空集），
/// 只执行 O\N 的 remove 与 N\O 的 add，O∩N 不动。对同一输入重复调用是幂等的。
pub trait UpdatableIndex<K, V>: Send + Sync {
    fn update(
        &self,
        input_id: InputId,
        new_content: Option<&ContentSnapshot>,
        old_content: Option<&ContentSnapshot>,
    ) -> Result<(), StorageError>;

    fn data(&self, key: &K) -> Result<ValueContainer<V>, StorageError>;

    fn keys(&self) -> Result<Vec<K>, StorageError>;

    fn clear(&self) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError>;

    fn close(&self) -> Result<(), StorageError>;

    fn stats(&self) -> StorageStats;
}

/// 基于 `IndexStorage` 的 map-reduce 索引。
///
/// 读写锁把 “一次 update 的全部 add/remove” 与读者串行化：
/// 读者看不到半个文件的更新。
pub struct MapReduceIndex<K, V> {
    indexer: Indexer<K, V>,
    storage: Box<dyn IndexStorage<K, V>>,
    lock: RwLock<()>,
}

impl<K: IndexKey, V: IndexValue> MapReduceIndex<K, V> {
    pub fn new(indexer: Indexer<K, V>, storage: Box<dyn IndexStorage<K, V>>) -> Self {
        Self {
            indexer,
            storage,
            lock: RwLock::new(()),
        }
    }

    fn extract(&self, content: Option<&ContentSnapshot>) -> HashSet<(K, V)> {
        match content {
            Some(c) => (self.indexer)(c).into_iter().collect(),
            None => HashSet::new(),
        }
    }
}

impl<K: IndexKey, V: IndexValue> UpdatableIndex<K, V> for MapReduceIndex<K, V> {
    fn update(
        &self,
        input_id: InputId,
        new_content: Option<&ContentSnapshot>,
        old_content: Option<&ContentSnapshot>,
    ) -> Result<(), StorageError> {
        // 抽取在锁外完成
        let old = self.extract(old_content);
        let new = self.extract(new_content);

        let _guard = self.lock.write();
        for (key, value) in old.difference(&new) {
            self.storage.remove_value(key, input_id, value)?;
        }
        for (key, value) in new.difference(&old) {
            self.storage.add_value(key, input_id, value.clone())?;
        }
        Ok(())
    }

    fn data(&self, key: &K) -> Result<ValueContainer<V>, StorageError> {
        let _guard = self.lock.read();
        self.storage.read(key)
    }

    fn keys(&self) -> Result<Vec<K>, StorageError> {
        let _guard = self.lock.read();
        self.storage.keys()
    }

    fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.lock.write();
        self.storage.clear()
    }

    fn flush(&self) -> Result<(), StorageError> {
        let _guard = self.lock.write();
        self.storage.flush()
    }

    fn close(&self) -> Result<(), StorageError> {
        let _guard = self.lock.write();
        self.storage.close()
    }

    fn stats(&self) -> StorageStats {
        self.storage.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MapIndexStorage;
    use std::path::PathBuf;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("fb-index-mr-{}-{}", tag, nanos))
    }

    /// 每行 `key=value`
    fn line_index(tag: &str) -> MapReduceIndex<String, String> {
        let (storage, _) =
            MapIndexStorage::<String, String>::open(unique_tmp_dir(tag).join("lines.idx"), 16)
                .unwrap();
        let indexer: Indexer<String, String> = Arc::new(|c: &ContentSnapshot| {
            c.text
                .lines()
                .filter_map(|l| l.split_once('='))
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .collect()
        });
        MapReduceIndex::new(indexer, Box::new(storage))
    }

    fn ids(index: &MapReduceIndex<String, String>, key: &str, value: &str) -> Vec<InputId> {
        index
            .data(&key.to_string())
            .unwrap()
            .input_ids_vec(&value.to_string())
    }

    #[test]
    fn diff_touches_only_changed_pairs() {
        let index = line_index("diff");
        let old = ContentSnapshot::new(7, "/p/f", "k1=v1\nk2=v2");
        let new = ContentSnapshot::new(7, "/p/f", "k2=v2\nk3=v3");

        // 另一个文件共享 k2=v2：更新 7 不能影响它
        index
            .update(8, Some(&ContentSnapshot::new(8, "/p/g", "k2=v2")), None)
            .unwrap();
        index.update(7, Some(&old), None).unwrap();
        assert_eq!(ids(&index, "k1", "v1"), vec![7]);

        index.update(7, Some(&new), Some(&old)).unwrap();
        assert!(index.data(&"k1".to_string()).unwrap().is_empty());
        assert_eq!(ids(&index, "k2", "v2"), vec![7, 8]);
        assert_eq!(ids(&index, "k3", "v3"), vec![7]);
        assert_eq!(index.keys().unwrap(), vec!["k2".to_string(), "k3".to_string()]);
    }

    #[test]
    fn repeated_update_is_idempotent() {
        let index = line_index("idem");
        let old = ContentSnapshot::new(3, "/p/f", "a=1");
        let new = ContentSnapshot::new(3, "/p/f", "a=2\nb=1");

        index.update(3, Some(&old), None).unwrap();
        index.update(3, Some(&new), Some(&old)).unwrap();
        index.update(3, Some(&new), Some(&old)).unwrap();

        let a = index.data(&"a".to_string()).unwrap();
        assert_eq!(a.to_value_list(), vec!["2".to_string()]);
        assert_eq!(ids(&index, "b", "1"), vec![3]);
    }

    #[test]
    fn removal_with_absent_new_content() {
        let index = line_index("remove");
        let c = ContentSnapshot::new(4, "/p/f", "x=y");
        index.update(4, Some(&c), None).unwrap();
        index.update(4, None, Some(&c)).unwrap();
        index.flush().unwrap();
        assert!(index.keys().unwrap().is_empty());
        assert_eq!(index.stats().stored_keys, 0);
    }
}
