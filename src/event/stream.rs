use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::core::FileEvent;
use crate::index::FileBasedIndex;
use crate::stats::EventPipelineStats;

const REBUILD_COOLDOWN: Duration = Duration::from_secs(60);

/// 事件管道：notify 事件 → debounce 批次 → `FileBasedIndex::apply_file_event`
pub struct EventPipeline {
    engine: Arc<FileBasedIndex>,
    debounce: Duration,
    overflow_drops: Arc<AtomicU64>,
    stats: Mutex<EventPipelineStats>,
    /// 上次处理过的溢出计数与重建时间
    overflow_state: Mutex<(u64, Option<Instant>)>,
}

impl EventPipeline {
    pub fn new(engine: Arc<FileBasedIndex>, debounce: Duration) -> Self {
        Self {
            engine,
            debounce,
            overflow_drops: Arc::new(AtomicU64::new(0)),
            stats: Mutex::new(EventPipelineStats::default()),
            overflow_state: Mutex::new((0, None)),
        }
    }

    /// 交给 watcher 的溢出计数器
    pub fn overflow_counter(&self) -> Arc<AtomicU64> {
        self.overflow_drops.clone()
    }

    pub fn stats(&self) -> EventPipelineStats {
        let mut stats = self.stats.lock().clone();
        stats.overflow_drops = self.overflow_drops.load(Ordering::Relaxed);
        stats
    }

    /// 消费事件直到 channel 关闭
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<notify::Event>) {
        while let Some(first) = rx.recv().await {
            let mut batch = FileEvent::from_notify(first);

            // debounce 窗口内继续收集
            let deadline = tokio::time::Instant::now() + self.debounce;
            loop {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(event)) => batch.extend(FileEvent::from_notify(event)),
                    Ok(None) | Err(_) => break,
                }
            }

            let batch = coalesce(batch);
            if !batch.is_empty() {
                let pipeline = self.clone();
                let applied = tokio::task::spawn_blocking(move || pipeline.apply_batch(&batch)).await;
                if let Err(e) = applied {
                    tracing::error!("Event batch task failed: {}", e);
                }
            }
            self.check_overflow();
        }
        tracing::info!("Event channel closed, pipeline stopped ({})", self.stats());
    }

    /// 同步应用一批事件，返回成功条数
    pub fn apply_batch(&self, batch: &[FileEvent]) -> usize {
        let mut ok = 0usize;
        let mut failed = 0u64;
        for event in batch {
            match self.engine.apply_file_event(event) {
                Ok(()) => ok += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!("Failed to apply {:?} on {:?}: {}", event.event_type, event.path, e);
                }
            }
        }
        let mut stats = self.stats.lock();
        stats.last_batch_size = batch.len();
        stats.total_events_applied += ok as u64;
        stats.failed_events += failed;
        tracing::debug!("Applied event batch: {} ok, {} failed", ok, failed);
        ok
    }

    /// 事件丢失后索引不再可信：全部索引请求重建并重扫项目（带冷却）
    fn check_overflow(&self) {
        let drops = self.overflow_drops.load(Ordering::Relaxed);
        let mut state = self.overflow_state.lock();
        if drops == state.0 {
            return;
        }
        if state.1.is_some_and(|at| at.elapsed() < REBUILD_COOLDOWN) {
            return;
        }
        tracing::warn!(
            "{} events dropped since last check, rebuilding all indexes",
            drops - state.0
        );
        *state = (drops, Some(Instant::now()));
        drop(state);

        for name in self.engine.index_names() {
            if let Err(e) = self.engine.request_rebuild(name) {
                tracing::error!(index = %name, "Rebuild request failed: {}", e);
            }
        }
        // 后台扫描，句柄不需要保留
        drop(self.engine.rescan_projects());
    }
}

/// 去掉批次内完全相同的重复事件（保留最后一次出现的位置）
fn coalesce(batch: Vec<FileEvent>) -> Vec<FileEvent> {
    let mut seen = HashSet::with_capacity(batch.len());
    let mut out: Vec<FileEvent> = batch
        .into_iter()
        .rev()
        .filter(|e| seen.insert(e.clone()))
        .collect();
    out.reverse();
    out
}
