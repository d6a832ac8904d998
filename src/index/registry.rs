use std::any::Any;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::core::{ContentSnapshot, FileBasedIndexExtension, FileHandle, IndexKey, IndexValue, InputId};
use crate::error::{IndexError, StorageError};
use crate::index::map_reduce::{Indexer, MapReduceIndex, UpdatableIndex};
use crate::storage::{MapIndexStorage, StorageStats};

/// 单个索引在本次会话中的状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum IndexState {
    Registering,
    Ready,
    RequiresRebuild,
    Closed,
}

/// 查询命中：JSON 形式的 Value + 贡献文件
#[derive(Clone, Debug, Serialize)]
pub struct ValueHit {
    pub value: serde_json::Value,
    pub input_ids: Vec<InputId>,
}

/// 类型擦除后的已注册索引：编排层据此统一遍历所有索引。
pub(crate) trait ErasedIndex: Send + Sync {
    fn name(&self) -> &'static str;
    fn version(&self) -> u32;
    fn cache_size(&self) -> usize;
    fn accepts(&self, file: &FileHandle) -> bool;
    fn depends_on_content(&self) -> bool;

    fn state(&self) -> IndexState;
    fn set_state(&self, state: IndexState);
    fn is_available(&self) -> bool;

    /// 打开（或重新打开）存储。返回 true 表示存储文件是新建的。
    fn open_storage(&self, path: &std::path::Path, cache_capacity: usize) -> Result<bool, StorageError>;

    fn update(
        &self,
        input_id: InputId,
        new_content: Option<&ContentSnapshot>,
        old_content: Option<&ContentSnapshot>,
    ) -> Result<(), IndexError>;

    fn clear(&self) -> Result<(), IndexError>;
    fn flush(&self) -> Result<(), IndexError>;
    fn close(&self) -> Result<(), StorageError>;
    fn stats(&self) -> Option<StorageStats>;

    /// key 以 JSON 文本给出；不是合法 JSON 时按字符串 key 解释
    fn lookup_json(&self, raw_key: &str) -> Result<Vec<ValueHit>, IndexError>;

    fn as_any(&self) -> &dyn Any;
}

/// 某个扩展的运行期实体：扩展本身 + 状态 + （可能不可用的）MapReduceIndex
pub(crate) struct RegisteredIndex<K, V> {
    extension: Arc<dyn FileBasedIndexExtension<Key = K, Value = V>>,
    name: &'static str,
    state: Mutex<IndexState>,
    /// None：存储打不开（或已关闭），索引不可用
    index: RwLock<Option<MapReduceIndex<K, V>>>,
}

impl<K: IndexKey, V: IndexValue> RegisteredIndex<K, V> {
    pub(crate) fn new<E>(extension: E) -> Self
    where
        E: FileBasedIndexExtension<Key = K, Value = V>,
    {
        let name = extension.name().name();
        Self {
            extension: Arc::new(extension),
            name,
            state: Mutex::new(IndexState::Registering),
            index: RwLock::new(None),
        }
    }

    /// 对可用的索引执行操作；不可用时返回 `Unavailable`
    pub(crate) fn with_index<R>(
        &self,
        f: impl FnOnce(&MapReduceIndex<K, V>) -> Result<R, StorageError>,
    ) -> Result<R, IndexError> {
        let guard = self.index.read();
        let index = guard
            .as_ref()
            .ok_or_else(|| IndexError::Unavailable(self.name.to_string()))?;
        Ok(f(index)?)
    }

    fn parse_key(&self, raw: &str) -> Result<K, IndexError> {
        if let Ok(key) = serde_json::from_str::<K>(raw) {
            return Ok(key);
        }
        serde_json::from_value::<K>(serde_json::Value::String(raw.to_string())).map_err(|e| {
            IndexError::BadKey {
                index: self.name.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

impl<K: IndexKey, V: IndexValue> ErasedIndex for RegisteredIndex<K, V> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn version(&self) -> u32 {
        self.extension.version()
    }

    fn cache_size(&self) -> usize {
        self.extension.cache_size()
    }

    fn accepts(&self, file: &FileHandle) -> bool {
        self.extension.accepts(file)
    }

    fn depends_on_content(&self) -> bool {
        self.extension.depends_on_content()
    }

    fn state(&self) -> IndexState {
        *self.state.lock()
    }

    fn set_state(&self, state: IndexState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(index = %self.name, "state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    fn is_available(&self) -> bool {
        self.index.read().is_some()
    }

    fn open_storage(&self, path: &std::path::Path, cache_capacity: usize) -> Result<bool, StorageError> {
        let (storage, fresh) = MapIndexStorage::<K, V>::open(path, cache_capacity)?;
        let extension = self.extension.clone();
        let indexer: Indexer<K, V> = Arc::new(move |content: &ContentSnapshot| extension.map(content));
        let previous = self
            .index
            .write()
            .replace(MapReduceIndex::new(indexer, Box::new(storage)));
        if let Some(previous) = previous {
            previous.close()?;
        }
        Ok(fresh)
    }

    fn update(
        &self,
        input_id: InputId,
        new_content: Option<&ContentSnapshot>,
        old_content: Option<&ContentSnapshot>,
    ) -> Result<(), IndexError> {
        self.with_index(|index| index.update(input_id, new_content, old_content))
    }

    fn clear(&self) -> Result<(), IndexError> {
        self.with_index(|index| index.clear())
    }

    fn flush(&self) -> Result<(), IndexError> {
        self.with_index(|index| index.flush())
    }

    fn close(&self) -> Result<(), StorageError> {
        let taken = self.index.write().take();
        self.set_state(IndexState::Closed);
        match taken {
            Some(index) => index.close(),
            None => Ok(()),
        }
    }

    fn stats(&self) -> Option<StorageStats> {
        self.index.read().as_ref().map(|index| index.stats())
    }

    fn lookup_json(&self, raw_key: &str) -> Result<Vec<ValueHit>, IndexError> {
        let key = self.parse_key(raw_key)?;
        let container = self.with_index(|index| index.data(&key))?;
        let mut hits = Vec::with_capacity(container.size());
        for (value, ids) in container.iter() {
            let value = serde_json::to_value(value).map_err(|e| IndexError::BadKey {
                index: self.name.to_string(),
                reason: format!("value not representable as JSON: {}", e),
            })?;
            hits.push(ValueHit {
                value,
                input_ids: ids.collect(),
            });
        }
        Ok(hits)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
