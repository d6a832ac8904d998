use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 打开的项目：名字 + content roots。
///
/// 一个进程级索引可能同时被多个项目的文件填充，查询按项目过滤。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    pub content_roots: Vec<PathBuf>,
}

impl Project {
    pub fn new(name: impl Into<String>, content_roots: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            content_roots,
        }
    }

    pub fn contains_path(&self, path: &std::path::Path) -> bool {
        self.content_roots.iter().any(|root| path.starts_with(root))
    }
}
