use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::file::{ContentSnapshot, FileHandle};

/// IndexStorage 的默认 LRU 容量
pub const DEFAULT_CACHE_SIZE: usize = 1024;

/// 索引 Key：可序列化（bincode）、可哈希、全序（`get_all_keys` 排序用）
pub trait IndexKey:
    Serialize + DeserializeOwned + Eq + Hash + Ord + Clone + fmt::Debug + Send + Sync + 'static
{
}

impl<T> IndexKey for T where
    T: Serialize + DeserializeOwned + Eq + Hash + Ord + Clone + fmt::Debug + Send + Sync + 'static
{
}

/// 索引 Value：可序列化、可哈希
pub trait IndexValue:
    Serialize + DeserializeOwned + Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static
{
}

impl<T> IndexValue for T where
    T: Serialize + DeserializeOwned + Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static
{
}

/// 带类型的索引名。
///
/// 名字同时是磁盘存储文件的 basename（小写化）和 IndexingStamp 的 key；
/// K/V 只在编译期存在，查询时据此校验注册的索引类型。
pub struct IndexId<K, V> {
    name: &'static str,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> IndexId<K, V> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _types: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<K, V> Clone for IndexId<K, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, V> Copy for IndexId<K, V> {}

impl<K, V> fmt::Debug for IndexId<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IndexId({})", self.name)
    }
}

impl<K, V> fmt::Display for IndexId<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// 索引扩展：启动时注册，进程生命周期内不可变。
///
/// 引擎不关心 “抽取什么”：`map` 把一个内容快照映射为 (Key, Value) 对集合，
/// 重复的对会被去重。`map` 必须是确定性的，否则 diff 更新不再幂等。
pub trait FileBasedIndexExtension: Send + Sync + 'static {
    type Key: IndexKey;
    type Value: IndexValue;

    fn name(&self) -> IndexId<Self::Key, Self::Value>;

    fn map(&self, content: &ContentSnapshot) -> Vec<(Self::Key, Self::Value)>;

    /// InputFilter
    fn accepts(&self, file: &FileHandle) -> bool;

    /// 版本变化时整个索引会被丢弃重建（磁盘格式不向前兼容）
    fn version(&self) -> u32 {
        0
    }

    fn cache_size(&self) -> usize {
        DEFAULT_CACHE_SIZE
    }

    /// false 表示只看文件身份（路径），引擎不会为它加载文件内容
    fn depends_on_content(&self) -> bool {
        true
    }
}
