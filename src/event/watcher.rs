use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// 持有 notify watcher 与已监听的 content roots；drop 即停止监听。
pub struct EventWatcher {
    inner: notify::RecommendedWatcher,
    roots: Vec<PathBuf>,
}

impl EventWatcher {
    /// 创建 watcher。事件经有界队列交给管道，队列满时丢弃并计入 `overflow_drops`
    /// （管道据此触发重建）。
    pub fn start(
        channel_size: usize,
        overflow_drops: Arc<AtomicU64>,
    ) -> notify::Result<(Self, mpsc::Receiver<notify::Event>)> {
        let (tx, rx) = mpsc::channel(channel_size.max(1));
        let inner = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    tracing::warn!("Watcher error: {}", e);
                    return;
                }
            };
            // 只读访问不影响索引，不占队列
            if matches!(event.kind, EventKind::Access(_)) {
                return;
            }
            if tx.try_send(event).is_err() {
                let total = overflow_drops.fetch_add(1, Ordering::Relaxed) + 1;
                if total == 1 || total % 1000 == 0 {
                    tracing::warn!("Event queue full, {} events dropped so far", total);
                }
            }
        })?;
        Ok((
            Self {
                inner,
                roots: Vec::new(),
            },
            rx,
        ))
    }

    /// 递归监听 content roots；已被覆盖的嵌套 root 不重复注册。返回新注册的 root 数。
    pub fn watch(&mut self, roots: &[PathBuf]) -> usize {
        let mut added = 0;
        for root in outermost(roots) {
            if self.roots.iter().any(|r| root.starts_with(r)) {
                continue;
            }
            match self.inner.watch(&root, RecursiveMode::Recursive) {
                Ok(()) => {
                    tracing::debug!("Watching {:?}", root);
                    self.roots.push(root);
                    added += 1;
                }
                Err(e) => tracing::warn!("Failed to watch {:?}: {}", root, e),
            }
        }
        added
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}

/// 去掉被其它 root 包含的 root（递归监听已覆盖它们）
fn outermost(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut sorted: Vec<&PathBuf> = roots.iter().collect();
    sorted.sort_by_key(|p| p.components().count());
    let mut out: Vec<PathBuf> = Vec::new();
    for root in sorted {
        if !out.iter().any(|kept| root.starts_with(kept)) {
            out.push(root.clone());
        }
    }
    out
}
