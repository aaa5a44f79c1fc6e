//! The storage interface consumed by the ingestion core.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    Change, DiscoverOutcome, FileIdentity, FileRecord, IngestState, MergeSummary, NodeRecord,
    NodeRow, PlaceholderRow, RelationshipKey, RelationshipRecord, RelationshipRow, StateUpdate,
    TransitionGuard, TransitionRecord,
};

/// Abstract content-graph store.
///
/// Every method is one statement against the backing store. Batched methods
/// take list parameters so a caller never issues one statement per row.
/// Node and relationship merges are idempotent by uuid, which is what makes
/// retries safe.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_discovered`](ContentStore::upsert_discovered) | Create or reset a file to `discovered` |
/// | [`apply_transition`](ContentStore::apply_transition) | Guarded state update over a set of files |
/// | [`state_counts`](ContentStore::state_counts) | Single aggregate over file states |
/// | [`merge_nodes`](ContentStore::merge_nodes) | Merge rows of one label by uuid |
/// | [`merge_relationships`](ContentStore::merge_relationships) | Merge rows of one (type, label, label) key |
/// | [`delete_orphans`](ContentStore::delete_orphans) | Drop nodes of a file absent from the latest parse |
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Fetch a file by id.
    async fn get_file(&self, id: Uuid) -> Result<Option<FileRecord>>;

    /// Fetch a file by its (project, path) pair.
    async fn get_file_by_path(&self, project_id: &str, path: &str) -> Result<Option<FileRecord>>;

    /// Create a file in `state` unless it already exists.
    ///
    /// Returns the current record and whether it was created.
    async fn create_file_if_absent(
        &self,
        identity: &FileIdentity,
        state: IngestState,
        at: DateTime<Utc>,
    ) -> Result<(FileRecord, bool)>;

    /// Create the file in `discovered`, or reset it to `discovered` with a
    /// zero retry count when its current state is one of `resettable`.
    async fn upsert_discovered(
        &self,
        identity: &FileIdentity,
        resettable: &[IngestState],
        at: DateTime<Utc>,
    ) -> Result<DiscoverOutcome>;

    /// Apply `update` to every file in `ids` whose current state satisfies
    /// `guard`. Ids that do not exist are absent from the result.
    async fn apply_transition(
        &self,
        ids: &[Uuid],
        guard: &TransitionGuard,
        update: &StateUpdate,
    ) -> Result<Vec<TransitionRecord>>;

    /// Files in any of `states`, oldest state change first.
    async fn files_in_states(
        &self,
        states: &[IngestState],
        updated_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<FileRecord>>;

    /// Files in `error` with `retry_count < max_retries`, ordered by retry
    /// count then age.
    async fn retryable_files(&self, max_retries: u32, limit: usize) -> Result<Vec<FileRecord>>;

    /// Number of files per state, as one aggregate query.
    async fn state_counts(&self, project_id: Option<&str>) -> Result<BTreeMap<IngestState, u64>>;

    /// Remove a file, its content nodes and their chunks. Returns the number
    /// of content nodes removed.
    async fn delete_file(&self, id: Uuid) -> Result<usize>;

    /// Fetch nodes by uuid. Unknown uuids are absent from the result.
    async fn get_nodes(&self, uuids: &[Uuid]) -> Result<Vec<NodeRecord>>;

    /// Content nodes attached to a file through `DEFINED_IN`.
    async fn file_nodes(&self, file_id: Uuid) -> Result<Vec<NodeRecord>>;

    /// Merge rows of one label by uuid. A pending placeholder with the same
    /// uuid is reconciled: its properties are replaced and the flag cleared.
    async fn merge_nodes(&self, label: &str, rows: &[NodeRow]) -> Result<MergeSummary>;

    /// Create pending placeholders that do not exist yet. Existing nodes are
    /// never touched. Returns the number created.
    async fn create_placeholders(&self, rows: &[PlaceholderRow]) -> Result<usize>;

    /// Indexed lookup: which of `uuids` exist under `label`.
    async fn find_labeled(&self, label: &str, uuids: &[Uuid]) -> Result<Vec<Uuid>>;

    /// Delete every node attached to the file whose uuid is not in `keep`,
    /// cascading to its embedding chunks. Returns the deleted uuids.
    async fn delete_orphans(&self, file_id: Uuid, keep: &HashSet<Uuid>) -> Result<Vec<Uuid>>;

    /// Content nodes in `state`, sorted by uuid. With `owner_state`, only
    /// nodes whose `DEFINED_IN` file is in that state are returned, so the
    /// limit applies after the owner filter.
    async fn nodes_in_state(
        &self,
        state: IngestState,
        owner_state: Option<IngestState>,
        limit: usize,
    ) -> Result<Vec<NodeRecord>>;

    /// Set the state of content nodes. Returns the number updated.
    async fn set_node_states(&self, uuids: &[Uuid], state: IngestState) -> Result<usize>;

    /// Store embedding vectors and mark their nodes `embedded`.
    async fn store_embeddings(&self, embeddings: &[(Uuid, Vec<f32>)]) -> Result<usize>;

    /// Merge rows of one (type, from-label, to-label) key. Rows whose
    /// endpoints cannot be matched are skipped. Returns the number merged.
    async fn merge_relationships(
        &self,
        key: &RelationshipKey,
        rows: &[RelationshipRow],
    ) -> Result<usize>;

    /// Relationships of `rel_type` ending at `to`.
    async fn relationships_to(&self, to: Uuid, rel_type: &str) -> Result<Vec<RelationshipRecord>>;

    /// Relationships of `rel_type` starting at `from`.
    async fn relationships_from(
        &self,
        from: Uuid,
        rel_type: &str,
    ) -> Result<Vec<RelationshipRecord>>;

    /// Delete outgoing relationships of the given types. Returns the number removed.
    async fn delete_relationships_from(&self, from: Uuid, rel_types: &[&str]) -> Result<usize>;

    /// Delete a single relationship. Returns whether it existed.
    async fn delete_relationship(&self, from: Uuid, rel_type: &str, to: Uuid) -> Result<bool>;

    /// Delete the pending placeholder nodes and `mentioned` files among
    /// `candidates` that no relationship points at any more. Real nodes and
    /// files are never touched. Returns the removed ids.
    async fn prune_placeholders(&self, candidates: &[Uuid]) -> Result<Vec<Uuid>>;

    /// Append change records.
    async fn append_changes(&self, changes: &[Change]) -> Result<usize>;

    /// Change records attached to a node, oldest first.
    async fn changes_for(&self, entity_id: Uuid) -> Result<Vec<Change>>;
}
