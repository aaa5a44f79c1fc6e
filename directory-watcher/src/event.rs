//! File events from directory watching.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use notify::event::{ModifyKind, RenameMode};
use serde::{Deserialize, Serialize};

/// A file system event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEvent {
    pub kind: FileEventKind,

    /// Path to the affected file.
    pub path: PathBuf,

    /// When the event was observed.
    pub timestamp: DateTime<Utc>,
}

impl FileEvent {
    /// Create a new file event.
    pub fn new(kind: FileEventKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Kind of file event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,

    /// File was renamed (old path).
    RenamedFrom,

    /// File was renamed (new path).
    RenamedTo,

    /// Access, metadata-only and unclassified events.
    Other,
}

impl FileEventKind {
    /// The path now holds content that should be (re)ingested.
    pub fn is_upsert(self) -> bool {
        matches!(self, Self::Created | Self::Modified | Self::RenamedTo)
    }

    /// The path no longer holds a file.
    pub fn is_removal(self) -> bool {
        matches!(self, Self::Deleted | Self::RenamedFrom)
    }
}

impl From<notify::EventKind> for FileEventKind {
    fn from(kind: notify::EventKind) -> Self {
        match kind {
            notify::EventKind::Create(_) => Self::Created,
            notify::EventKind::Modify(ModifyKind::Name(rename)) => match rename {
                RenameMode::From => Self::RenamedFrom,
                RenameMode::To => Self::RenamedTo,
                _ => Self::Modified,
            },
            notify::EventKind::Modify(ModifyKind::Metadata(_)) => Self::Other,
            notify::EventKind::Modify(_) => Self::Modified,
            notify::EventKind::Remove(_) => Self::Deleted,
            _ => Self::Other,
        }
    }
}

/// Translate one notify event into per-path file events. A rename reported
/// with both paths becomes a `RenamedFrom` and a `RenamedTo`.
pub fn split_notify_event(event: notify::Event) -> Vec<FileEvent> {
    if let notify::EventKind::Modify(ModifyKind::Name(RenameMode::Both)) = event.kind
        && let [from, to] = event.paths.as_slice()
    {
        return vec![
            FileEvent::new(FileEventKind::RenamedFrom, from.clone()),
            FileEvent::new(FileEventKind::RenamedTo, to.clone()),
        ];
    }
    let kind = FileEventKind::from(event.kind);
    event
        .paths
        .into_iter()
        .map(|path| FileEvent::new(kind, path))
        .collect()
}

/// Keep the latest event per path, ordered by first appearance.
pub fn coalesce(events: Vec<FileEvent>) -> Vec<FileEvent> {
    let mut order: Vec<PathBuf> = Vec::new();
    let mut latest: HashMap<PathBuf, FileEvent> = HashMap::new();
    for event in events {
        if !latest.contains_key(&event.path) {
            order.push(event.path.clone());
        }
        latest.insert(event.path.clone(), event);
    }
    order
        .into_iter()
        .filter_map(|path| latest.remove(&path))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    #[test]
    fn test_kind_mapping() {
        use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

        assert_eq!(
            FileEventKind::from(notify::EventKind::Create(CreateKind::File)),
            FileEventKind::Created
        );
        assert_eq!(
            FileEventKind::from(notify::EventKind::Modify(ModifyKind::Data(DataChange::Any))),
            FileEventKind::Modified
        );
        assert_eq!(
            FileEventKind::from(notify::EventKind::Modify(ModifyKind::Metadata(
                MetadataKind::Any
            ))),
            FileEventKind::Other
        );
        assert_eq!(
            FileEventKind::from(notify::EventKind::Remove(RemoveKind::File)),
            FileEventKind::Deleted
        );
    }

    #[test]
    fn test_split_rename_both() {
        let event = notify::Event::new(notify::EventKind::Modify(ModifyKind::Name(
            RenameMode::Both,
        )))
        .add_path(PathBuf::from("/d/old.md"))
        .add_path(PathBuf::from("/d/new.md"));

        let split = split_notify_event(event);
        let kinds: Vec<_> = split.iter().map(|e| (e.kind, e.path.clone())).collect();
        assert_eq!(
            kinds,
            vec![
                (FileEventKind::RenamedFrom, PathBuf::from("/d/old.md")),
                (FileEventKind::RenamedTo, PathBuf::from("/d/new.md")),
            ]
        );
    }

    #[test]
    fn test_coalesce_keeps_latest() {
        let events = vec![
            FileEvent::new(FileEventKind::Created, "/test/a.txt"),
            FileEvent::new(FileEventKind::Modified, "/test/b.txt"),
            FileEvent::new(FileEventKind::Deleted, "/test/a.txt"),
        ];

        let coalesced = coalesce(events);
        assert_eq!(coalesced.len(), 2);
        assert_eq!(coalesced[0].path, Path::new("/test/a.txt"));
        assert_eq!(coalesced[0].kind, FileEventKind::Deleted);
        assert_eq!(coalesced[1].kind, FileEventKind::Modified);
    }
}
