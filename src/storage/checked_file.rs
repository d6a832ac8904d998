use std::io::Write;
use std::path::Path;

use xxhash_rust::xxh3::xxh3_64;

use crate::error::StorageError;

const HEADER_SIZE: usize = 4 + 4 + 4 + 4; // magic + version + body_len + checksum

/// 带 header 的整文件原子替换。
///
/// 落盘流程：
/// 1) 写 `<path>.tmp`：header（magic/version/len/checksum）+ body
/// 2) fsync(tmpfile)
/// 3) rename(tmp, target)
/// 4) fsync(dir)
///
/// 任何一步之前崩溃，target 都保持旧内容。
pub fn write_atomic(path: &Path, magic: u32, version: u32, body: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let body_len =
        u32::try_from(body.len()).map_err(|_| StorageError::corrupt(path, "body exceeds 4GiB"))?;

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);

    let mut file = std::fs::File::create(&tmp_path)?;
    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(&magic.to_le_bytes());
    header[4..8].copy_from_slice(&version.to_le_bytes());
    header[8..12].copy_from_slice(&body_len.to_le_bytes());
    header[12..16].copy_from_slice(&(xxh3_64(body) as u32).to_le_bytes());
    file.write_all(&header)?;
    file.write_all(body)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = std::fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// 读取并校验。文件不存在返回 `Ok(None)`；header / 长度 / checksum 不一致返回 `Corrupt`。
pub fn read_checked(path: &Path, magic: u32, version: u32) -> Result<Option<Vec<u8>>, StorageError> {
    let data = match std::fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if data.len() < HEADER_SIZE {
        return Err(StorageError::corrupt(path, "file shorter than header"));
    }

    let word = |i: usize| u32::from_le_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
    let found_magic = word(0);
    let found_version = word(4);
    let body_len = word(8) as usize;
    let checksum = word(12);

    if found_magic != magic {
        return Err(StorageError::corrupt(
            path,
            format!("magic mismatch: {:#x} != {:#x}", found_magic, magic),
        ));
    }
    if found_version != version {
        return Err(StorageError::corrupt(
            path,
            format!("version mismatch: {} != {}", found_version, version),
        ));
    }
    let body = &data[HEADER_SIZE..];
    if body.len() != body_len {
        return Err(StorageError::corrupt(path, "body length mismatch"));
    }
    if xxh3_64(body) as u32 != checksum {
        return Err(StorageError::corrupt(path, "checksum mismatch"));
    }
    Ok(Some(body.to_vec()))
}

pub fn remove_if_exists(path: &Path) -> Result<(), StorageError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
