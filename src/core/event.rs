use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 文件系统事件类型
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    Create,
    Delete,
    Modify,
    Rename { from: PathBuf },
}

/// 一条待应用的文件变更（事件管道 → FileBasedIndex）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileEvent {
    pub event_type: EventType,
    pub path: PathBuf,
}

impl FileEvent {
    pub fn new(event_type: EventType, path: impl Into<PathBuf>) -> Self {
        Self {
            event_type,
            path: path.into(),
        }
    }

    /// 把 notify 事件展开为 FileEvent 列表。
    ///
    /// rename 只有在 notify 同时给出 from/to 两条路径时才识别为 `Rename`；
    /// 单边 rename 退化为 Delete / Create。
    pub fn from_notify(event: notify::Event) -> Vec<FileEvent> {
        use notify::event::{EventKind, ModifyKind, RenameMode};

        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                let mut paths = event.paths.into_iter();
                match (paths.next(), paths.next()) {
                    (Some(from), Some(to)) => {
                        vec![FileEvent::new(EventType::Rename { from }, to)]
                    }
                    _ => Vec::new(),
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
                .paths
                .into_iter()
                .map(|p| FileEvent::new(EventType::Delete, p))
                .collect(),
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
                .paths
                .into_iter()
                .map(|p| FileEvent::new(EventType::Create, p))
                .collect(),
            EventKind::Access(_) | EventKind::Other => Vec::new(),
            kind => {
                let event_type = EventType::from(kind);
                event
                    .paths
                    .into_iter()
                    .map(|p| FileEvent::new(event_type.clone(), p))
                    .collect()
            }
        }
    }
}

impl From<notify::event::EventKind> for EventType {
    fn from(kind: notify::event::EventKind) -> Self {
        use notify::event::*;
        match kind {
            EventKind::Create(_) => EventType::Create,
            EventKind::Remove(_) => EventType::Delete,
            EventKind::Modify(_) => EventType::Modify,
            _ => EventType::Modify,
        }
    }
}
