use std::path::{Path, PathBuf};
use std::sync::Arc;

/// 文件标识：由 `FileIdRegistry` 分配，文件生命周期内稳定（move 不改变 id）。
pub type InputId = u32;

/// 文件句柄：id + 当前路径。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileHandle {
    pub id: InputId,
    pub path: PathBuf,
}

impl FileHandle {
    pub fn new(id: InputId, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
        }
    }

    /// 文件当前是否存在（after_change 用它区分 “删除” 与 “修改”）
    pub fn is_valid(&self) -> bool {
        self.path.is_file()
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }

    /// 读取文本内容。非 UTF-8 字节按 lossy 解码。
    pub fn load_text(&self) -> std::io::Result<String> {
        let bytes = std::fs::read(&self.path)?;
        Ok(match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        })
    }
}

/// 文件在某一时刻的内容快照；diff 的输入。
///
/// `text` 用 `Arc<str>` 共享：一次事件里新内容只加载一次，所有索引复用。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentSnapshot {
    pub input_id: InputId,
    pub path: Arc<Path>,
    pub text: Arc<str>,
}

impl ContentSnapshot {
    pub fn new(input_id: InputId, path: impl AsRef<Path>, text: impl Into<Arc<str>>) -> Self {
        Self {
            input_id,
            path: Arc::from(path.as_ref()),
            text: text.into(),
        }
    }

    /// 空文本快照：供 `depends_on_content() == false` 的索引使用
    pub fn without_text(file: &FileHandle) -> Self {
        Self::new(file.id, &file.path, "")
    }

    /// 加载失败按空内容处理（ContentLoadError 永远不致命）
    pub fn load(file: &FileHandle) -> Self {
        match file.load_text() {
            Ok(text) => Self::new(file.id, &file.path, text),
            Err(e) => {
                tracing::warn!("Failed to load content of {:?}, indexing as empty: {}", file.path, e);
                Self::without_text(file)
            }
        }
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}
