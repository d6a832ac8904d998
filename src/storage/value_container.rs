use std::collections::HashMap;
use std::io::Read;

use roaring::RoaringBitmap;

use crate::core::{IndexValue, InputId};
use crate::error::StorageError;

/// 单个 Value 的贡献文件集合。
///
/// 绝大多数 (Key, Value) 只由一个文件贡献：单 id 内联存放，
/// 第二个 id 到来时才升级为 RoaringBitmap。删除不降级。
#[derive(Clone, Debug)]
enum InputIds {
    One(InputId),
    Many(RoaringBitmap),
}

impl InputIds {
    fn len(&self) -> u64 {
        match self {
            InputIds::One(_) => 1,
            InputIds::Many(set) => set.len(),
        }
    }

    fn contains(&self, id: InputId) -> bool {
        match self {
            InputIds::One(existing) => *existing == id,
            InputIds::Many(set) => set.contains(id),
        }
    }

    fn iter(&self) -> InputIdIter<'_> {
        match self {
            InputIds::One(id) => InputIdIter::One(Some(*id)),
            InputIds::Many(set) => InputIdIter::Many(set.iter()),
        }
    }
}

/// 升序遍历某个 Value 的 InputId
pub enum InputIdIter<'a> {
    One(Option<InputId>),
    Many(roaring::bitmap::Iter<'a>),
}

impl Iterator for InputIdIter<'_> {
    type Item = InputId;

    fn next(&mut self) -> Option<InputId> {
        match self {
            InputIdIter::One(slot) => slot.take(),
            InputIdIter::Many(it) => it.next(),
        }
    }
}

/// 一个 Key 下的 “Value ↦ 贡献文件集合”。
///
/// 不变式：不存在 id 集合为空的 Value（每次删除时维护，而非只在落盘时检查）。
#[derive(Debug)]
pub struct ValueContainer<V> {
    values: HashMap<V, InputIds>,
}

impl<V> Default for ValueContainer<V> {
    fn default() -> Self {
        Self {
            values: HashMap::new(),
        }
    }
}

impl<V: IndexValue> ValueContainer<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_value(&mut self, input_id: InputId, value: V) {
        let Some(ids) = self.values.get_mut(&value) else {
            self.values.insert(value, InputIds::One(input_id));
            return;
        };
        match ids {
            InputIds::One(existing) => {
                let existing = *existing;
                if existing != input_id {
                    let mut set = RoaringBitmap::new();
                    set.insert(existing);
                    set.insert(input_id);
                    *ids = InputIds::Many(set);
                }
            }
            InputIds::Many(set) => {
                set.insert(input_id);
            }
        }
    }

    /// 返回 true 表示 (value, id) 存在并已移除。集合变空时整个 Value 条目被删掉。
    pub fn remove_value(&mut self, input_id: InputId, value: &V) -> bool {
        let (removed, now_empty) = match self.values.get_mut(value) {
            None => return false,
            Some(InputIds::One(existing)) => {
                if *existing != input_id {
                    return false;
                }
                (true, true)
            }
            Some(InputIds::Many(set)) => {
                let removed = set.remove(input_id);
                (removed, set.is_empty())
            }
        };
        if now_empty {
            self.values.remove(value);
        }
        removed
    }

    /// 不同 Value 的个数
    pub fn size(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.values.keys()
    }

    pub fn to_value_list(&self) -> Vec<V> {
        self.values.keys().cloned().collect()
    }

    pub fn input_ids(&self, value: &V) -> Option<InputIdIter<'_>> {
        self.values.get(value).map(|ids| ids.iter())
    }

    /// 升序 id 列表；Value 不存在时为空
    pub fn input_ids_vec(&self, value: &V) -> Vec<InputId> {
        self.input_ids(value)
            .map(|it| it.collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, input_id: InputId, value: &V) -> bool {
        self.values
            .get(value)
            .is_some_and(|ids| ids.contains(input_id))
    }

    /// (value, id 迭代器) 全量遍历
    pub fn iter(&self) -> impl Iterator<Item = (&V, InputIdIter<'_>)> {
        self.values.iter().map(|(v, ids)| (v, ids.iter()))
    }

    /// 深拷贝快照：调用方修改快照不会影响本容器（反之亦然）
    pub fn snapshot(&self) -> Self {
        let mut values = HashMap::with_capacity(self.values.len());
        for (value, ids) in &self.values {
            let copied = match ids {
                InputIds::One(id) => InputIds::One(*id),
                InputIds::Many(set) => InputIds::Many(set.iter().collect()),
            };
            values.insert(value.clone(), copied);
        }
        Self { values }
    }

    /// 编码：`count(Value)`，逐个 `bincode(Value) | count(id) | id*`（LE u32）
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), StorageError> {
        let live: Vec<(&V, &InputIds)> = self
            .values
            .iter()
            .filter(|(_, ids)| ids.len() > 0)
            .collect();
        out.extend_from_slice(&(live.len() as u32).to_le_bytes());
        for (value, ids) in live {
            bincode::serialize_into(&mut *out, value)?;
            out.extend_from_slice(&(ids.len() as u32).to_le_bytes());
            for id in ids.iter() {
                out.extend_from_slice(&id.to_le_bytes());
            }
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StorageError> {
        let mut out = Vec::new();
        self.encode(&mut out)?;
        Ok(out)
    }

    /// 解码。id 数为 0 的条目视为损坏：丢弃并记日志，不报错。
    pub fn decode(bytes: &[u8]) -> Result<Self, StorageError> {
        let mut cur = bytes;
        let count = read_u32(&mut cur)?;
        let mut values = HashMap::with_capacity(count.min(1024) as usize);
        let mut dropped = 0usize;

        for _ in 0..count {
            let value: V = bincode::deserialize_from(&mut cur)?;
            let id_count = read_u32(&mut cur)?;
            if id_count == 0 {
                dropped += 1;
                continue;
            }
            let ids = if id_count == 1 {
                InputIds::One(read_u32(&mut cur)?)
            } else {
                let mut set = RoaringBitmap::new();
                for _ in 0..id_count {
                    set.insert(read_u32(&mut cur)?);
                }
                InputIds::Many(set)
            };
            values.insert(value, ids);
        }

        if dropped > 0 {
            tracing::warn!(
                "Dropped {} corrupt value entries (zero input ids) while decoding container",
                dropped
            );
        }
        if !cur.is_empty() {
            return Err(StorageError::Codec(Box::new(bincode::ErrorKind::Custom(
                format!("{} trailing bytes after value container", cur.len()),
            ))));
        }
        Ok(Self { values })
    }
}

fn read_u32(cur: &mut &[u8]) -> Result<u32, StorageError> {
    let mut b = [0u8; 4];
    cur.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}
