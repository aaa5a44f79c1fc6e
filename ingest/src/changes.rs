//! Audit records for content mutations.

use chrono::{DateTime, Utc};
use ragforge_graph_store::{Change, ChangeKind};
use similar::{ChangeTag, TextDiff};
use uuid::Uuid;

/// Lines of context around each hunk.
const CONTEXT_RADIUS: usize = 3;

/// One node-level content mutation, before it becomes a [`Change`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDelta {
    pub entity_id: Uuid,
    pub file_id: Uuid,
    pub kind: ChangeKind,
    pub old_text: Option<String>,
    pub new_text: Option<String>,
    pub old_hash: Option<String>,
    pub new_hash: Option<String>,
}

/// A unified diff plus its line delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextPatch {
    pub diff: String,
    pub lines_added: usize,
    pub lines_removed: usize,
}

/// Line diff of `old` against `new`.
pub fn diff_text(old: &str, new: &str, name: &str) -> TextPatch {
    let diff = TextDiff::from_lines(old, new);
    let mut lines_added = 0;
    let mut lines_removed = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => lines_added += 1,
            ChangeTag::Delete => lines_removed += 1,
            ChangeTag::Equal => {}
        }
    }
    let old_header = format!("a/{name}");
    let new_header = format!("b/{name}");
    let diff = diff
        .unified_diff()
        .context_radius(CONTEXT_RADIUS)
        .header(&old_header, &new_header)
        .to_string();
    TextPatch {
        diff,
        lines_added,
        lines_removed,
    }
}

impl ContentDelta {
    pub fn into_change(self, at: DateTime<Utc>) -> Change {
        let old = self.old_text.as_deref().unwrap_or_default();
        let new = self.new_text.as_deref().unwrap_or_default();
        let patch = diff_text(old, new, &self.entity_id.to_string());
        Change {
            id: Uuid::new_v4(),
            entity_id: self.entity_id,
            file_id: self.file_id,
            kind: self.kind,
            diff: patch.diff,
            old_hash: self.old_hash,
            new_hash: self.new_hash,
            lines_added: patch.lines_added,
            lines_removed: patch.lines_removed,
            created_at: at,
        }
    }
}
