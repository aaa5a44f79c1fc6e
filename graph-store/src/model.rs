//! Shapes persisted through a [`ContentStore`](crate::ContentStore).
//!
//! Files, content nodes, placeholders, relationships and change records. The
//! store boundary speaks one numeric representation only: integers are
//! [`PropertyValue::Int`] (`i64`) and decimals are [`PropertyValue::Float`]
//! (`f64`).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;

/// Label carried by file nodes.
pub const FILE_LABEL: &str = "File";

/// Label carried by extracted entity nodes.
pub const ENTITY_LABEL: &str = "Entity";

/// Label carried by embedding chunk children of content nodes.
pub const CHUNK_LABEL: &str = "EmbeddingChunk";

/// Relationship type names used by the ingestion core.
pub mod rel {
    /// Content node → owning file.
    pub const DEFINED_IN: &str = "DEFINED_IN";
    /// Structural containment (directory → file, section → subsection).
    pub const CONTAINS: &str = "CONTAINS";
    /// Importer file → imported file, once the target is linked.
    pub const CONSUMES: &str = "CONSUMES";
    /// Importer file → not-yet-linked target file.
    pub const PENDING_IMPORT: &str = "PENDING_IMPORT";
    /// Content node → embedding chunk.
    pub const HAS_CHUNK: &str = "HAS_CHUNK";
    /// Content node → extracted entity.
    pub const MENTIONS: &str = "MENTIONS";
    /// Entity → entity, from an extracted relation.
    pub const RELATED_TO: &str = "RELATED_TO";
}

/// Lifecycle state of a file (and of individual content nodes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    /// Referenced by another file but never discovered on its own.
    Mentioned,
    /// Waiting to be parsed.
    Discovered,
    /// Parse in progress.
    Parsing,
    /// Nodes written.
    Parsed,
    /// Reference resolution in progress.
    Relations,
    /// Fully linked into the graph.
    Linked,
    /// Entity extraction in progress.
    Entities,
    /// Embedding in progress.
    Embedding,
    /// All derived state computed.
    Embedded,
    /// A stage failed; see the error fields.
    Error,
}

impl IngestState {
    /// Every state, in lifecycle order.
    pub const ALL: [IngestState; 10] = [
        Self::Mentioned,
        Self::Discovered,
        Self::Parsing,
        Self::Parsed,
        Self::Relations,
        Self::Linked,
        Self::Entities,
        Self::Embedding,
        Self::Embedded,
        Self::Error,
    ];

    /// States a crashed worker can leave a file in.
    pub const TRANSIENT: [IngestState; 4] =
        [Self::Parsing, Self::Relations, Self::Entities, Self::Embedding];

    /// Get a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mentioned => "mentioned",
            Self::Discovered => "discovered",
            Self::Parsing => "parsing",
            Self::Parsed => "parsed",
            Self::Relations => "relations",
            Self::Linked => "linked",
            Self::Entities => "entities",
            Self::Embedding => "embedding",
            Self::Embedded => "embedded",
            Self::Error => "error",
        }
    }

    /// Whether the state only exists while a worker is active.
    pub fn is_transient(&self) -> bool {
        Self::TRANSIENT.contains(self)
    }

    /// Whether the file has been linked into the graph at least once and
    /// has not been reset since.
    pub fn is_linked(&self) -> bool {
        matches!(
            self,
            Self::Linked | Self::Entities | Self::Embedding | Self::Embedded
        )
    }
}

impl fmt::Display for IngestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IngestState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| StoreError::InvalidValue(format!("unknown state: {s}")))
    }
}

/// Stage that put a file into the error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStage {
    /// Reading, hashing, parsing or writing nodes.
    Parse,
    /// Reference extraction and resolution.
    Relations,
    /// Entity extraction.
    Entities,
    /// Embedding generation.
    Embed,
}

impl ErrorStage {
    /// Get a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Relations => "relations",
            Self::Entities => "entities",
            Self::Embed => "embed",
        }
    }
}

impl fmt::Display for ErrorStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A property value as stored in the graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Borrow the value as a string, if it is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Read the value as an integer, if it is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Read the value as a decimal. Integers widen.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<u32> for PropertyValue {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<usize> for PropertyValue {
    fn from(value: usize) -> Self {
        Self::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<f32> for PropertyValue {
    fn from(value: f32) -> Self {
        Self::Float(f64::from(value))
    }
}

impl<T: Into<PropertyValue>> From<Option<T>> for PropertyValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<Vec<String>> for PropertyValue {
    fn from(value: Vec<String>) -> Self {
        Self::List(value.into_iter().map(Self::String).collect())
    }
}

/// Property bag of a node or relationship.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// Identity of a tracked file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIdentity {
    /// Deterministic id derived from the path.
    pub id: Uuid,

    /// Absolute path of the source.
    pub path: String,

    /// Project the file belongs to.
    pub project_id: String,
}

/// A tracked source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: Uuid,
    pub path: String,
    pub project_id: String,
    pub state: IngestState,
    pub state_updated_at: DateTime<Utc>,

    /// Hash of the content at the last successful link.
    pub content_hash: Option<String>,

    /// Hash of the content whose derived state (entities, embeddings) is current.
    pub embedded_content_hash: Option<String>,

    pub error_type: Option<ErrorStage>,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

impl FileRecord {
    /// Create a fresh record for the given identity.
    pub fn new(identity: &FileIdentity, state: IngestState, at: DateTime<Utc>) -> Self {
        Self {
            id: identity.id,
            path: identity.path.clone(),
            project_id: identity.project_id.clone(),
            state,
            state_updated_at: at,
            content_hash: None,
            embedded_content_hash: None,
            error_type: None,
            error_message: None,
            retry_count: 0,
        }
    }

    pub fn identity(&self) -> FileIdentity {
        FileIdentity {
            id: self.id,
            path: self.path.clone(),
            project_id: self.project_id.clone(),
        }
    }
}

/// How a state update treats the retry counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryUpdate {
    Keep,
    Increment,
    Reset,
}

/// The write half of a state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateUpdate {
    pub state: IngestState,
    pub at: DateTime<Utc>,

    /// Stored when present; left untouched otherwise.
    pub content_hash: Option<String>,

    /// Stored when present; left untouched otherwise.
    pub embedded_content_hash: Option<String>,

    /// Set on error transitions; error fields are cleared otherwise.
    pub error: Option<(ErrorStage, String)>,

    pub retry: RetryUpdate,
}

/// Conditions a file must meet for a transition to apply.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransitionGuard {
    /// Current states the transition may start from.
    pub allowed_from: Vec<IngestState>,

    /// Only apply if the state has not changed since this instant.
    pub updated_before: Option<DateTime<Utc>>,
}

/// Per-file result of [`ContentStore::apply_transition`](crate::ContentStore::apply_transition).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRecord {
    pub id: Uuid,

    /// State observed when the statement ran.
    pub previous: IngestState,

    /// Whether the guard matched and the update was written.
    pub applied: bool,
}

/// Result of marking a file discovered.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoverOutcome {
    /// A new file record was created.
    Created(FileRecord),

    /// An existing settled file was reset to discovered.
    Reset {
        previous: IngestState,
        file: FileRecord,
    },

    /// The file is in flight (or already queued) and was left alone.
    Unchanged(FileRecord),
}

impl DiscoverOutcome {
    pub fn file(&self) -> &FileRecord {
        match self {
            Self::Created(file) | Self::Unchanged(file) => file,
            Self::Reset { file, .. } => file,
        }
    }

    /// Whether the file now waits in the discovered queue because of this call.
    pub fn queued(&self) -> bool {
        !matches!(self, Self::Unchanged(_))
    }
}

/// A stored content node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub uuid: Uuid,
    pub label: String,
    pub properties: PropertyMap,
    pub content_hash: Option<String>,
    pub state: Option<IngestState>,

    /// Placeholder created for a forward reference.
    pub pending: bool,
}

/// One row of a batched node merge.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRow {
    pub uuid: Uuid,
    pub properties: PropertyMap,
    pub content_hash: Option<String>,
    pub state: Option<IngestState>,
}

/// A minimal node standing in for a relationship target that is not ingested yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderRow {
    pub uuid: Uuid,
    pub label: String,
    pub properties: PropertyMap,
}

/// Counts returned by a node merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub created: usize,
    pub updated: usize,

    /// Pending placeholders replaced by their real node.
    pub reconciled: usize,
}

impl MergeSummary {
    pub fn written(&self) -> usize {
        self.created + self.updated + self.reconciled
    }

    pub fn absorb(&mut self, other: MergeSummary) {
        self.created += other.created;
        self.updated += other.updated;
        self.reconciled += other.reconciled;
    }
}

/// Grouping key of a batched relationship merge.
///
/// Labels are optional: a missing label degrades the endpoint lookup to a
/// label-less match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationshipKey {
    pub rel_type: String,
    pub from_label: Option<String>,
    pub to_label: Option<String>,
}

impl RelationshipKey {
    pub fn new(
        rel_type: impl Into<String>,
        from_label: Option<String>,
        to_label: Option<String>,
    ) -> Self {
        Self {
            rel_type: rel_type.into(),
            from_label,
            to_label,
        }
    }

    /// Whether both endpoints use an indexed lookup.
    pub fn is_fully_labeled(&self) -> bool {
        self.from_label.is_some() && self.to_label.is_some()
    }
}

impl fmt::Display for RelationshipKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({})-[{}]->({})",
            self.from_label.as_deref().unwrap_or("?"),
            self.rel_type,
            self.to_label.as_deref().unwrap_or("?")
        )
    }
}

/// One row of a batched relationship merge.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipRow {
    pub from: Uuid,
    pub to: Uuid,
    pub properties: PropertyMap,
}

/// A stored relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub rel_type: String,
    pub from: Uuid,
    pub to: Uuid,
    pub properties: PropertyMap,
}

/// Kind of content mutation recorded in a [`Change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Append-only audit record of a content mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub id: Uuid,

    /// Node the change describes.
    pub entity_id: Uuid,

    /// File the node belongs to.
    pub file_id: Uuid,

    pub kind: ChangeKind,

    /// Unified diff between the old and new content.
    pub diff: String,

    pub old_hash: Option<String>,
    pub new_hash: Option<String>,
    pub lines_added: usize,
    pub lines_removed: usize,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_state_round_trips_through_str() {
        for state in IngestState::ALL {
            assert_eq!(state.as_str().parse::<IngestState>().unwrap(), state);
        }
        assert!("bogus".parse::<IngestState>().is_err());
    }

    #[test]
    fn test_transient_states() {
        assert!(IngestState::Parsing.is_transient());
        assert!(IngestState::Embedding.is_transient());
        assert!(!IngestState::Parsed.is_transient());
        assert!(!IngestState::Error.is_transient());
        assert!(IngestState::Embedded.is_linked());
        assert!(!IngestState::Mentioned.is_linked());
    }

    #[test]
    fn test_property_value_numeric_boundary() {
        assert_eq!(PropertyValue::from(3usize), PropertyValue::Int(3));
        assert_eq!(PropertyValue::Int(3).as_float(), Some(3.0));
        assert_eq!(PropertyValue::Float(0.5).as_int(), None);
        assert_eq!(PropertyValue::from(None::<String>), PropertyValue::Null);
    }

    #[test]
    fn test_relationship_key_display() {
        let key = RelationshipKey::new(rel::CONTAINS, Some("Directory".into()), None);
        assert_eq!(key.to_string(), "(Directory)-[CONTAINS]->(?)");
        assert!(!key.is_fully_labeled());
    }
}
