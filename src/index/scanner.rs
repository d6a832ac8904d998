use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ignore::WalkBuilder;
use serde::Serialize;

use crate::config::EngineConfig;
use crate::error::IndexError;

/// 一次批量扫描的结果
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScanOutcome {
    pub project: String,
    /// 遍历到的文件数
    pub files: usize,
    /// 实际执行的 (file, index) 更新
    pub updated: usize,
    /// 因 stamp 跳过的 (file, index)
    pub skipped: usize,
    /// 更新失败（文件保持未 stamp）
    pub failed: usize,
    pub cancelled: bool,
}

/// 后台扫描句柄：`cancel` 设置共享标志，扫描按文件轮询；部分进度是安全的。
pub struct ScanHandle {
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<Result<ScanOutcome, IndexError>>>,
}

impl ScanHandle {
    pub(crate) fn new(
        cancel: Arc<AtomicBool>,
        thread: JoinHandle<Result<ScanOutcome, IndexError>>,
    ) -> Self {
        Self {
            cancel,
            thread: Some(thread),
        }
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// 等待扫描结束
    pub fn join(mut self) -> Result<ScanOutcome, IndexError> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .unwrap_or_else(|_| Err(IndexError::Io(std::io::Error::other("scan thread panicked")))),
            None => Ok(ScanOutcome::default()),
        }
    }
}

/// 遍历 content roots 下的所有普通文件（尊重 .gitignore，跳过 `exclude` 子树）。
///
/// 结果排序去重：多个 root 互相嵌套时同一文件只出现一次。
pub fn collect_files(roots: &[PathBuf], config: &EngineConfig, exclude: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for root in roots {
        if root.is_file() {
            files.push(root.clone());
            continue;
        }
        let exclude = exclude.to_path_buf();
        let walker = WalkBuilder::new(root)
            .hidden(!config.include_hidden)
            .ignore(config.respect_gitignore)
            .git_ignore(config.respect_gitignore)
            .git_exclude(config.respect_gitignore)
            .filter_entry(move |e| !e.path().starts_with(&exclude))
            .build();

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::debug!("scan: skip unreadable entry under {:?}: {}", root, e);
                    continue;
                }
            };
            if entry.file_type().is_some_and(|ft| ft.is_file()) {
                files.push(entry.into_path());
            }
        }
    }
    files.sort();
    files.dedup();
    files
}
