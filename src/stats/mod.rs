use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

use crate::index::IndexState;
use crate::storage::StorageStats;

/// 引擎状态报告（`/status` 与周期日志共用）
#[derive(Clone, Debug, Serialize)]
pub struct EngineReport {
    pub index_root: PathBuf,
    pub indexes: Vec<IndexReport>,
    /// FileIdRegistry 条目数
    pub known_files: usize,
    /// 内容阁楼条目数
    pub attic_entries: usize,
    /// before_change 之后尚未 after_change 的文件
    pub pending_changes: usize,
    pub projects: Vec<String>,
    pub rebuild_set: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct IndexReport {
    pub name: String,
    pub version: u32,
    pub state: IndexState,
    pub available: bool,
    pub stamped_files: u64,
    /// 不可用的索引没有存储统计
    pub storage: Option<StorageStats>,
}

/// 事件管道计数
#[derive(Clone, Debug, Default, Serialize)]
pub struct EventPipelineStats {
    /// 最近一次 debounce 窗口的事件数
    pub last_batch_size: usize,
    /// 累计应用的事件数
    pub total_events_applied: u64,
    /// 应用失败的事件数
    pub failed_events: u64,
    /// channel 溢出丢弃次数
    pub overflow_drops: u64,
}

pub fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

impl fmt::Display for EngineReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           fb-index Engine Report                 ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ known files:    {:>10}                       ║", self.known_files)?;
        writeln!(f, "║ attic entries:  {:>10}                       ║", self.attic_entries)?;
        writeln!(f, "║ pending:        {:>10}                       ║", self.pending_changes)?;
        writeln!(f, "║ projects:       {:>10}                       ║", self.projects.len())?;
        for index in &self.indexes {
            writeln!(f, "╠──────────────────────────────────────────────────╣")?;
            writeln!(f, "║ {:<24} v{:<6} {:>16} ║", index.name, index.version, format!("{:?}", index.state))?;
            writeln!(f, "║   stamped:      {:>10}                       ║", index.stamped_files)?;
            match &index.storage {
                Some(s) => {
                    writeln!(
                        f,
                        "║   cached keys:  {:>10}  (dirty {:>8})       ║",
                        s.cached_keys, s.dirty_keys
                    )?;
                    writeln!(
                        f,
                        "║   stored keys:  {:>10}  ({:>10})          ║",
                        s.stored_keys,
                        human_bytes(s.store_bytes)
                    )?;
                }
                None => writeln!(f, "║   storage:     unavailable                       ║")?,
            }
        }
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

impl fmt::Display for EventPipelineStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "last batch {}, applied {}, failed {}, overflow drops {}",
            self.last_batch_size, self.total_events_applied, self.failed_events, self.overflow_drops
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_bytes_units() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.00 KB");
        assert_eq!(human_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn report_renders_unavailable_index() {
        let report = EngineReport {
            index_root: PathBuf::from("/tmp/idx"),
            indexes: vec![IndexReport {
                name: "words".into(),
                version: 2,
                state: IndexState::RequiresRebuild,
                available: false,
                stamped_files: 0,
                storage: None,
            }],
            known_files: 3,
            attic_entries: 1,
            pending_changes: 0,
            projects: vec!["p".into()],
            rebuild_set: vec!["words".into()],
        };
        let text = report.to_string();
        assert!(text.contains("words"));
        assert!(text.contains("RequiresRebuild"));
        assert!(text.contains("unavailable"));
    }
}
