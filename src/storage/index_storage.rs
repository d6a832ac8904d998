use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use lru::LruCache;
use parking_lot::Mutex;

use crate::core::{IndexKey, IndexValue, InputId};
use crate::error::StorageError;
use crate::storage::persistent_map::PersistentMap;
use crate::storage::value_container::ValueContainer;

/// 单个索引的 Key → ValueContainer 存储
pub trait IndexStorage<K, V>: Send + Sync {
    fn add_value(&self, key: &K, input_id: InputId, value: V) -> Result<(), StorageError>;

    fn remove_value(&self, key: &K, input_id: InputId, value: &V) -> Result<(), StorageError>;

    /// 删除整个 key（缓存 + 持久层），幂等
    fn remove(&self, key: &K) -> Result<(), StorageError>;

    /// 返回深拷贝；key 不存在时为空容器
    fn read(&self, key: &K) -> Result<ValueContainer<V>, StorageError>;

    /// 所有非空 key（升序）
    fn keys(&self) -> Result<Vec<K>, StorageError>;

    fn clear(&self) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError>;

    fn close(&self) -> Result<(), StorageError>;

    fn stats(&self) -> StorageStats;
}

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct StorageStats {
    pub cached_keys: usize,
    pub dirty_keys: usize,
    pub stored_keys: usize,
    pub store_bytes: u64,
}

struct Cached<V> {
    container: ValueContainer<V>,
    dirty: bool,
}

struct Inner<K, V> {
    cache: LruCache<K, Cached<V>>,
    /// close 之后为 None
    map: Option<PersistentMap>,
}

/// 有界 write-back 缓存 + PersistentMap。
///
/// - 持久层是唯一真相，缓存只是加速；淘汰时才写回（dirty 才写）
/// - 一把锁覆盖 {缓存查找, 读盘, 插入缓存, 淘汰写回}，同一 key 的并发 read-modify-write 不会丢更新
pub struct MapIndexStorage<K, V> {
    path: PathBuf,
    inner: Mutex<Inner<K, V>>,
}

impl<K: IndexKey, V: IndexValue> MapIndexStorage<K, V> {
    /// 打开存储。失败时删除（推定损坏的）文件重试一次；第二次失败向上传播。
    ///
    /// 返回值第二项为 true 表示底层文件是新建的（缺失或被重建），调用方应安排全量重建。
    pub fn open(path: impl Into<PathBuf>, cache_capacity: usize) -> Result<(Self, bool), StorageError> {
        let path = path.into();
        let map = match PersistentMap::open(&path) {
            Ok(m) => m,
            Err(first) => {
                tracing::warn!(
                    "Index storage {:?} failed to open ({}), deleting and retrying once",
                    path,
                    first
                );
                if let Err(e) = std::fs::remove_file(&path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("Failed to delete corrupt storage {:?}: {}", path, e);
                    }
                }
                PersistentMap::open(&path)?
            }
        };
        let fresh = map.was_created();
        let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);

        Ok((
            Self {
                path,
                inner: Mutex::new(Inner {
                    cache: LruCache::new(capacity),
                    map: Some(map),
                }),
            },
            fresh,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 对缓存中的容器执行修改；未命中先从持久层加载（或创建空容器）
    fn with_container<R>(
        &self,
        key: &K,
        f: impl FnOnce(&mut Cached<V>) -> R,
    ) -> Result<R, StorageError> {
        let mut inner = self.inner.lock();
        inner.load(&self.path, key)?;
        match inner.cache.get_mut(key) {
            Some(entry) => Ok(f(entry)),
            None => Err(StorageError::corrupt(&self.path, "cache entry vanished after load")),
        }
    }
}

impl<K: IndexKey, V: IndexValue> Inner<K, V> {
    fn map(&mut self, path: &Path) -> Result<&mut PersistentMap, StorageError> {
        self.map
            .as_mut()
            .ok_or_else(|| StorageError::Closed(path.to_path_buf()))
    }

    fn load(&mut self, path: &Path, key: &K) -> Result<(), StorageError> {
        if self.cache.contains(key) {
            return Ok(());
        }
        self.make_room(path)?;
        let key_bytes = encode_key(key)?;
        let container = match self.map(path)?.get(&key_bytes)? {
            Some(bytes) => ValueContainer::decode(&bytes)?,
            None => ValueContainer::new(),
        };
        self.cache.push(
            key.clone(),
            Cached {
                container,
                dirty: false,
            },
        );
        Ok(())
    }

    /// 缓存已满时淘汰 LRU 项：先写回，写成功后才出缓存。
    /// 写回失败时该项留在缓存里，错误交给当前调用方。
    fn make_room(&mut self, path: &Path) -> Result<(), StorageError> {
        if self.cache.len() < self.cache.cap().get() {
            return Ok(());
        }
        let pending = match self.cache.peek_lru() {
            Some((key, cached)) if cached.dirty => Some(encode_entry(key, &cached.container)?),
            _ => None,
        };
        if let Some((key_bytes, bytes)) = pending {
            self.persist(path, &key_bytes, bytes.as_deref())?;
        }
        self.cache.pop_lru();
        Ok(())
    }

    /// `bytes == None`：容器已空，从持久层删除
    fn persist(&mut self, path: &Path, key_bytes: &[u8], bytes: Option<&[u8]>) -> Result<(), StorageError> {
        let map = self.map(path)?;
        match bytes {
            Some(bytes) => map.put(key_bytes, bytes),
            None => map.remove(key_bytes).map(|_| ()),
        }
    }

    fn flush(&mut self, path: &Path) -> Result<(), StorageError> {
        if self.map.is_none() {
            return Ok(());
        }
        while let Some((key, cached)) = self.cache.pop_lru() {
            if !cached.dirty {
                continue;
            }
            let written = encode_entry(&key, &cached.container)
                .and_then(|(key_bytes, bytes)| self.persist(path, &key_bytes, bytes.as_deref()));
            if let Err(e) = written {
                // 放回缓存，数据不丢；下次 flush / 淘汰再试
                self.cache.push(key, cached);
                return Err(e);
            }
        }
        self.map(path)?.flush()
    }
}

impl<K: IndexKey, V: IndexValue> IndexStorage<K, V> for MapIndexStorage<K, V> {
    fn add_value(&self, key: &K, input_id: InputId, value: V) -> Result<(), StorageError> {
        self.with_container(key, |entry| {
            entry.container.add_value(input_id, value);
            entry.dirty = true;
        })
    }

    fn remove_value(&self, key: &K, input_id: InputId, value: &V) -> Result<(), StorageError> {
        self.with_container(key, |entry| {
            if entry.container.remove_value(input_id, value) {
                entry.dirty = true;
            }
        })
    }

    fn remove(&self, key: &K) -> Result<(), StorageError> {
        let key_bytes = encode_key(key)?;
        let mut inner = self.inner.lock();
        // 缓存项与持久记录在同一把锁内删除，之后不会有旧容器被写回
        inner.cache.pop(key);
        inner.map(&self.path)?.remove(&key_bytes)?;
        Ok(())
    }

    fn read(&self, key: &K) -> Result<ValueContainer<V>, StorageError> {
        self.with_container(key, |entry| entry.container.snapshot())
    }

    fn keys(&self) -> Result<Vec<K>, StorageError> {
        let mut inner = self.inner.lock();
        let mut keys = BTreeSet::new();
        for raw in inner.map(&self.path)?.keys() {
            keys.insert(bincode::deserialize::<K>(raw)?);
        }
        for (key, cached) in inner.cache.iter() {
            if cached.container.is_empty() {
                keys.remove(key);
            } else {
                keys.insert(key.clone());
            }
        }
        Ok(keys.into_iter().collect())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.cache.clear();
        inner.map(&self.path)?.clear()
    }

    fn flush(&self) -> Result<(), StorageError> {
        self.inner.lock().flush(&self.path)
    }

    fn close(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.flush(&self.path)?;
        if let Some(map) = inner.map.take() {
            map.close()?;
        }
        Ok(())
    }

    fn stats(&self) -> StorageStats {
        let inner = self.inner.lock();
        let dirty_keys = inner.cache.iter().filter(|(_, c)| c.dirty).count();
        StorageStats {
            cached_keys: inner.cache.len(),
            dirty_keys,
            stored_keys: inner.map.as_ref().map(|m| m.len()).unwrap_or(0),
            store_bytes: inner.map.as_ref().map(|m| m.store_bytes()).unwrap_or(0),
        }
    }
}

fn encode_key<K: IndexKey>(key: &K) -> Result<Vec<u8>, StorageError> {
    Ok(bincode::serialize(key)?)
}

/// 写回用的 (key, 容器) 字节；空容器编码为 None
fn encode_entry<K: IndexKey, V: IndexValue>(
    key: &K,
    container: &ValueContainer<V>,
) -> Result<(Vec<u8>, Option<Vec<u8>>), StorageError> {
    let bytes = if container.is_empty() {
        None
    } else {
        Some(container.to_bytes()?)
    };
    Ok((encode_key(key)?, bytes))
}
