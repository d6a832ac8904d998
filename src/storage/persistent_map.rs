use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use xxhash_rust::xxh3::xxh3_64;

use crate::error::StorageError;

const MAP_MAGIC: u32 = 0x5041_4D31; // "1MAP"
const MAP_VERSION: u32 = 1;
const HEADER_SIZE: u64 = 8; // magic + version
const RECORD_HEADER: u64 = 8; // len + checksum

const REC_PUT: u8 = 1;
const REC_REMOVE: u8 = 2;

/// 垃圾字节超过该值且超过 live 字节时，close 触发 compaction
const COMPACT_MIN_GARBAGE: u64 = 1 << 20;

#[derive(Clone, Copy, Debug)]
struct Slot {
    /// value 字节在文件中的绝对偏移
    offset: u64,
    len: u32,
    /// 整条记录（含 8B 记录头）长度，用于垃圾统计
    record_len: u64,
}

/// 持久 key → bytes 表（append-only 记录日志 + 内存偏移表）。
///
/// 文件布局：
/// - header: MAGIC(u32) + VERSION(u32)
/// - records: `len(u32) | checksum(u32) | payload`
///   - payload PUT:    `1 | klen(u32) | key | vlen(u32) | value`
///   - payload REMOVE: `2 | klen(u32) | key`
///
/// 打开时顺序回放重建偏移表；尾部截断 / 校验失败的记录视为崩溃残留，
/// 截断到最后一条完整记录（best-effort）。header 不匹配则打开失败。
///
/// 不做内部加锁：写操作要求 `&mut self`，由上层（IndexStorage）持锁。
pub struct PersistentMap {
    path: PathBuf,
    file: File,
    slots: HashMap<Vec<u8>, Slot>,
    end: u64,
    live_bytes: u64,
    created: bool,
}

impl PersistentMap {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let open_err = |reason: String| StorageError::Open {
            path: path.clone(),
            reason,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| open_err(e.to_string()))?;
        }

        let created = !path.exists();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| open_err(e.to_string()))?;

        let mut map = Self {
            path: path.clone(),
            file,
            slots: HashMap::new(),
            end: HEADER_SIZE,
            live_bytes: 0,
            created,
        };

        if created {
            map.write_header().map_err(|e| open_err(e.to_string()))?;
            return Ok(map);
        }

        map.replay().map_err(|e| match e {
            StorageError::Open { .. } => e,
            other => open_err(other.to_string()),
        })?;
        Ok(map)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 本次 open 是否新建了文件（上层据此判定 RequiresRebuild）
    pub fn was_created(&self) -> bool {
        self.created
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.slots.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.slots.keys().map(|k| k.as_slice())
    }

    /// 文件字节数（含垃圾）
    pub fn store_bytes(&self) -> u64 {
        self.end
    }

    fn garbage_bytes(&self) -> u64 {
        self.end
            .saturating_sub(HEADER_SIZE)
            .saturating_sub(self.live_bytes)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let Some(slot) = self.slots.get(key) else {
            return Ok(None);
        };
        let mut buf = vec![0u8; slot.len as usize];
        self.file.read_exact_at(&mut buf, slot.offset)?;
        Ok(Some(buf))
    }

    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let klen = len_u32(key.len(), &self.path)?;
        let vlen = len_u32(value.len(), &self.path)?;

        let mut payload = Vec::with_capacity(1 + 4 + key.len() + 4 + value.len());
        payload.push(REC_PUT);
        payload.extend_from_slice(&klen.to_le_bytes());
        payload.extend_from_slice(key);
        payload.extend_from_slice(&vlen.to_le_bytes());
        let value_rel = payload.len() as u64;
        payload.extend_from_slice(value);

        let record_start = self.append(&payload)?;
        let slot = Slot {
            offset: record_start + RECORD_HEADER + value_rel,
            len: vlen,
            record_len: RECORD_HEADER + payload.len() as u64,
        };
        if let Some(old) = self.slots.insert(key.to_vec(), slot) {
            self.live_bytes = self.live_bytes.saturating_sub(old.record_len);
        }
        self.live_bytes += slot.record_len;
        Ok(())
    }

    /// 返回 true 表示 key 存在并已删除；不存在时不写记录（幂等）
    pub fn remove(&mut self, key: &[u8]) -> Result<bool, StorageError> {
        if !self.slots.contains_key(key) {
            return Ok(false);
        }
        let klen = len_u32(key.len(), &self.path)?;
        let mut payload = Vec::with_capacity(1 + 4 + key.len());
        payload.push(REC_REMOVE);
        payload.extend_from_slice(&klen.to_le_bytes());
        payload.extend_from_slice(key);
        self.append(&payload)?;

        if let Some(old) = self.slots.remove(key) {
            self.live_bytes = self.live_bytes.saturating_sub(old.record_len);
        }
        Ok(true)
    }

    /// 清空全部数据（保留文件与 header）
    pub fn clear(&mut self) -> Result<(), StorageError> {
        self.file.set_len(0)?;
        self.write_header()?;
        self.slots.clear();
        self.end = HEADER_SIZE;
        self.live_bytes = 0;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), StorageError> {
        self.file.sync_data()?;
        Ok(())
    }

    /// 垃圾足够多时重写为只含 live 记录的新文件（tmp + fsync + rename）
    pub fn compact_if_worthwhile(&mut self) -> Result<bool, StorageError> {
        let garbage = self.garbage_bytes();
        if garbage < COMPACT_MIN_GARBAGE || garbage < self.live_bytes {
            return Ok(false);
        }
        self.compact()?;
        Ok(true)
    }

    pub fn compact(&mut self) -> Result<(), StorageError> {
        let before = self.end;
        let tmp_path = self.path.with_extension("compact.tmp");
        let mut new_slots = HashMap::with_capacity(self.slots.len());
        let mut end = HEADER_SIZE;
        {
            let mut out = std::io::BufWriter::new(File::create(&tmp_path)?);
            out.write_all(&MAP_MAGIC.to_le_bytes())?;
            out.write_all(&MAP_VERSION.to_le_bytes())?;

            // 按偏移顺序搬运，读盘尽量顺序
            let mut live: Vec<(&Vec<u8>, &Slot)> = self.slots.iter().collect();
            live.sort_by_key(|(_, s)| s.offset);

            for (key, slot) in live {
                let mut value = vec![0u8; slot.len as usize];
                self.file.read_exact_at(&mut value, slot.offset)?;

                let mut payload = Vec::with_capacity(1 + 4 + key.len() + 4 + value.len());
                payload.push(REC_PUT);
                payload.extend_from_slice(&(key.len() as u32).to_le_bytes());
                payload.extend_from_slice(key);
                payload.extend_from_slice(&slot.len.to_le_bytes());
                let value_rel = payload.len() as u64;
                payload.extend_from_slice(&value);

                let record_len = RECORD_HEADER + payload.len() as u64;
                out.write_all(&(payload.len() as u32).to_le_bytes())?;
                out.write_all(&checksum(&payload).to_le_bytes())?;
                out.write_all(&payload)?;

                new_slots.insert(
                    key.clone(),
                    Slot {
                        offset: end + RECORD_HEADER + value_rel,
                        len: slot.len,
                        record_len,
                    },
                );
                end += record_len;
            }

            out.flush()?;
            out.get_ref().sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        self.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        self.slots = new_slots;
        self.end = end;
        self.live_bytes = end - HEADER_SIZE;

        tracing::debug!(
            "Compacted {:?}: {} -> {} bytes ({} keys)",
            self.path,
            before,
            end,
            self.slots.len()
        );
        Ok(())
    }

    /// 关闭：必要时 compaction，然后 fsync
    pub fn close(mut self) -> Result<(), StorageError> {
        if let Err(e) = self.compact_if_worthwhile() {
            tracing::warn!("Compaction of {:?} failed on close: {}", self.path, e);
        }
        self.file.sync_all()?;
        Ok(())
    }

    fn write_header(&mut self) -> std::io::Result<()> {
        let mut hdr = [0u8; HEADER_SIZE as usize];
        hdr[0..4].copy_from_slice(&MAP_MAGIC.to_le_bytes());
        hdr[4..8].copy_from_slice(&MAP_VERSION.to_le_bytes());
        self.file.write_all_at(&hdr, 0)?;
        self.file.sync_data()
    }

    fn append(&mut self, payload: &[u8]) -> Result<u64, StorageError> {
        let len = len_u32(payload.len(), &self.path)?;
        let mut rec = Vec::with_capacity(RECORD_HEADER as usize + payload.len());
        rec.extend_from_slice(&len.to_le_bytes());
        rec.extend_from_slice(&checksum(payload).to_le_bytes());
        rec.extend_from_slice(payload);

        let start = self.end;
        self.file.write_all_at(&rec, start)?;
        self.end += rec.len() as u64;
        Ok(start)
    }

    fn replay(&mut self) -> Result<(), StorageError> {
        let file_len = self.file.metadata()?.len();
        let mut reader = BufReader::new(&self.file);

        let mut hdr = [0u8; HEADER_SIZE as usize];
        if reader.read_exact(&mut hdr).is_err() {
            return Err(StorageError::Open {
                path: self.path.clone(),
                reason: "file shorter than header".to_string(),
            });
        }
        let magic = u32::from_le_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]);
        let version = u32::from_le_bytes([hdr[4], hdr[5], hdr[6], hdr[7]]);
        if magic != MAP_MAGIC || version != MAP_VERSION {
            return Err(StorageError::Open {
                path: self.path.clone(),
                reason: format!("header mismatch (magic={magic:#x}, version={version})"),
            });
        }

        let mut slots: HashMap<Vec<u8>, Slot> = HashMap::new();
        let mut live_bytes = 0u64;
        let mut offset = HEADER_SIZE;
        let mut torn = false;

        loop {
            let mut rh = [0u8; RECORD_HEADER as usize];
            match reader.read_exact(&mut rh) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    torn = offset < file_len;
                    break;
                }
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes([rh[0], rh[1], rh[2], rh[3]]) as u64;
            let crc = u32::from_le_bytes([rh[4], rh[5], rh[6], rh[7]]);
            if offset + RECORD_HEADER + len > file_len {
                torn = true;
                break;
            }
            let mut payload = vec![0u8; len as usize];
            reader.read_exact(&mut payload)?;
            if checksum(&payload) != crc {
                torn = true;
                break;
            }

            let Some(rec) = parse_payload(&payload) else {
                torn = true;
                break;
            };
            let record_len = RECORD_HEADER + len;
            match rec {
                Parsed::Put {
                    key,
                    value_rel,
                    value_len,
                } => {
                    let slot = Slot {
                        offset: offset + RECORD_HEADER + value_rel,
                        len: value_len,
                        record_len,
                    };
                    if let Some(old) = slots.insert(key.to_vec(), slot) {
                        live_bytes = live_bytes.saturating_sub(old.record_len);
                    }
                    live_bytes += record_len;
                }
                Parsed::Remove { key } => {
                    if let Some(old) = slots.remove(key) {
                        live_bytes = live_bytes.saturating_sub(old.record_len);
                    }
                }
            }
            offset += record_len;
        }
        drop(reader);

        if torn {
            tracing::warn!(
                "Persistent map {:?}: dropping torn tail at offset {} (file len {})",
                self.path,
                offset,
                file_len
            );
            self.file.set_len(offset)?;
        }

        self.slots = slots;
        self.end = offset;
        self.live_bytes = live_bytes;
        Ok(())
    }
}

enum Parsed<'a> {
    Put {
        key: &'a [u8],
        value_rel: u64,
        value_len: u32,
    },
    Remove {
        key: &'a [u8],
    },
}

fn parse_payload(buf: &[u8]) -> Option<Parsed<'_>> {
    let kind = *buf.first()?;
    let mut off = 1usize;
    let klen = u32::from_le_bytes(buf.get(off..off + 4)?.try_into().ok()?) as usize;
    off += 4;
    let key = buf.get(off..off + klen)?;
    off += klen;
    match kind {
        REC_PUT => {
            let vlen = u32::from_le_bytes(buf.get(off..off + 4)?.try_into().ok()?);
            off += 4;
            if buf.len() != off + vlen as usize {
                return None;
            }
            Some(Parsed::Put {
                key,
                value_rel: off as u64,
                value_len: vlen,
            })
        }
        REC_REMOVE if buf.len() == off => Some(Parsed::Remove { key }),
        _ => None,
    }
}

fn checksum(data: &[u8]) -> u32 {
    xxh3_64(data) as u32
}

fn len_u32(len: usize, path: &Path) -> Result<u32, StorageError> {
    u32::try_from(len)
        .map_err(|_| StorageError::corrupt(path, format!("record too large ({len} bytes)")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("fb-index-map-{}-{}", tag, nanos))
    }

    #[test]
    fn put_remove_survive_reopen() {
        let dir = unique_tmp_dir("reopen");
        let path = dir.join("a.idx");

        let mut m = PersistentMap::open(&path).unwrap();
        assert!(m.was_created());
        m.put(b"k1", b"one").unwrap();
        m.put(b"k2", b"two").unwrap();
        m.put(b"k1", b"uno").unwrap();
        assert!(m.remove(b"k2").unwrap());
        assert!(!m.remove(b"k2").unwrap());
        m.close().unwrap();

        let m = PersistentMap::open(&path).unwrap();
        assert!(!m.was_created());
        assert_eq!(m.len(), 1);
        assert_eq!(m.get(b"k1").unwrap().as_deref(), Some(&b"uno"[..]));
        assert_eq!(m.get(b"k2").unwrap(), None);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = unique_tmp_dir("torn");
        let path = dir.join("a.idx");

        let mut m = PersistentMap::open(&path).unwrap();
        m.put(b"good", b"value").unwrap();
        m.close().unwrap();

        // 模拟崩溃：追加半条记录
        let mut f = OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[200, 0, 0, 0, 1, 2]).unwrap();
        drop(f);

        let mut m = PersistentMap::open(&path).unwrap();
        assert_eq!(m.get(b"good").unwrap().as_deref(), Some(&b"value"[..]));
        m.put(b"next", b"v2").unwrap();
        m.close().unwrap();

        let m = PersistentMap::open(&path).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.get(b"next").unwrap().as_deref(), Some(&b"v2"[..]));
    }

    #[test]
    fn bad_header_fails_open() {
        let dir = unique_tmp_dir("header");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("a.idx");
        std::fs::write(&path, b"garbage!garbage!").unwrap();

        match PersistentMap::open(&path) {
            Err(StorageError::Open { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("open should fail"),
        }
    }

    #[test]
    fn compaction_keeps_live_records() {
        let dir = unique_tmp_dir("compact");
        let path = dir.join("a.idx");

        let mut m = PersistentMap::open(&path).unwrap();
        for i in 0..50u32 {
            m.put(b"hot", &i.to_le_bytes()).unwrap();
        }
        m.put(b"cold", b"c").unwrap();
        let before = m.store_bytes();
        m.compact().unwrap();
        assert!(m.store_bytes() < before);
        assert_eq!(m.get(b"hot").unwrap(), Some(49u32.to_le_bytes().to_vec()));
        m.close().unwrap();

        let m = PersistentMap::open(&path).unwrap();
        assert_eq!(m.len(), 2);
        assert_eq!(m.get(b"cold").unwrap().as_deref(), Some(&b"c"[..]));
    }
}
