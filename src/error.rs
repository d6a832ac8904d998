use std::path::PathBuf;

/// 存储层错误（PersistentMap / IndexStorage / stamp / id 注册表）
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// 打开失败（缺失 / 损坏）。IndexStorage 会删除文件重试一次，再失败则该索引不可用。
    #[error("cannot open storage {path:?}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("storage I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed data in {path:?}: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("codec failure: {0}")]
    Codec(#[from] bincode::Error),

    #[error("storage {0:?} is closed")]
    Closed(PathBuf),
}

impl StorageError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        StorageError::Corrupt {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

/// 编排层错误（FileBasedIndex）
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("unknown index `{0}`")]
    UnknownIndex(String),

    #[error("index `{0}` is registered with different key/value types")]
    TypeMismatch(String),

    #[error("index `{0}` is unavailable: its storage could not be opened")]
    Unavailable(String),

    #[error("index `{0}` registered twice")]
    Duplicate(String),

    #[error("unknown project `{0}`")]
    UnknownProject(String),

    #[error("cannot decode key for index `{index}`: {reason}")]
    BadKey { index: String, reason: String },

    #[error("engine is closed")]
    Closed,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("index root I/O failure: {0}")]
    Io(#[from] std::io::Error),
}
