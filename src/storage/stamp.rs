use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use roaring::RoaringBitmap;

use crate::core::InputId;
use crate::error::StorageError;
use crate::storage::checked_file::{read_checked, remove_if_exists, write_atomic};

const STAMP_MAGIC: u32 = 0x504D_5453; // "STMP"
const STAMP_VERSION: u32 = 1;

#[derive(Default)]
struct StampSet {
    bits: RoaringBitmap,
    dirty: bool,
}

/// IndexingStamp：每个 (InputId, IndexName) 一个 “批量扫描已完成” 位。
///
/// 每个索引一个版本化文件 `<name>.stamp`（header + RoaringBitmap），
/// 与索引存储本身分开保存。文件损坏时按 “全部未索引” 处理：
/// 代价只是下一次扫描重新索引，不影响正确性。
pub struct IndexingStamps {
    dir: PathBuf,
    sets: RwLock<HashMap<String, StampSet>>,
}

impl IndexingStamps {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sets: RwLock::new(HashMap::new()),
        }
    }

    pub fn stamp_path(dir: &Path, index: &str) -> PathBuf {
        dir.join(format!("{}.stamp", index.to_lowercase()))
    }

    pub fn is_indexed(&self, input_id: InputId, index: &str) -> bool {
        if let Some(set) = self.sets.read().get(index) {
            return set.bits.contains(input_id);
        }
        let mut sets = self.sets.write();
        self.loaded(&mut sets, index).bits.contains(input_id)
    }

    pub fn set(&self, input_id: InputId, index: &str) {
        let mut sets = self.sets.write();
        let set = self.loaded(&mut sets, index);
        if set.bits.insert(input_id) {
            set.dirty = true;
        }
    }

    pub fn clear(&self, input_id: InputId, index: &str) {
        let mut sets = self.sets.write();
        let set = self.loaded(&mut sets, index);
        if set.bits.remove(input_id) {
            set.dirty = true;
        }
    }

    /// 丢弃某个索引的全部 stamp（内存 + 文件）
    pub fn clear_index(&self, index: &str) -> Result<(), StorageError> {
        self.sets.write().insert(index.to_string(), StampSet::default());
        remove_if_exists(&Self::stamp_path(&self.dir, index))
    }

    pub fn stamped_count(&self, index: &str) -> u64 {
        let mut sets = self.sets.write();
        self.loaded(&mut sets, index).bits.len()
    }

    /// 把 dirty 的集合原子写回磁盘
    pub fn flush(&self) -> Result<(), StorageError> {
        let mut sets = self.sets.write();
        for (name, set) in sets.iter_mut() {
            if !set.dirty {
                continue;
            }
            store(&Self::stamp_path(&self.dir, name), &set.bits)?;
            set.dirty = false;
        }
        Ok(())
    }

    fn loaded<'a>(&self, sets: &'a mut HashMap<String, StampSet>, index: &str) -> &'a mut StampSet {
        sets.entry(index.to_string()).or_insert_with(|| StampSet {
            bits: load(&Self::stamp_path(&self.dir, index)),
            dirty: false,
        })
    }
}

fn load(path: &Path) -> RoaringBitmap {
    let body = match read_checked(path, STAMP_MAGIC, STAMP_VERSION) {
        Ok(Some(body)) => body,
        Ok(None) => return RoaringBitmap::new(),
        Err(e) => {
            tracing::warn!("Stamp file {:?} unreadable ({}), treating as unindexed", path, e);
            return RoaringBitmap::new();
        }
    };
    match RoaringBitmap::deserialize_from(&body[..]) {
        Ok(bits) => bits,
        Err(e) => {
            tracing::warn!("Stamp file {:?} is corrupt ({}), treating as unindexed", path, e);
            RoaringBitmap::new()
        }
    }
}

fn store(path: &Path, bits: &RoaringBitmap) -> Result<(), StorageError> {
    let mut body = Vec::with_capacity(bits.serialized_size());
    bits.serialize_into(&mut body)?;
    write_atomic(path, STAMP_MAGIC, STAMP_VERSION, &body)
}
