//! In-memory [`ContentStore`] implementation.
//!
//! A complete store backed by hash maps behind a single `RwLock`. Every trait
//! method takes the lock once, so each call behaves like one atomic
//! statement. Placeholder creation under the write lock is what serializes
//! racing writers on the same uuid: the first creates, the rest are no-ops.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::model::{
    CHUNK_LABEL, Change, DiscoverOutcome, FILE_LABEL, FileIdentity, FileRecord, IngestState,
    MergeSummary, NodeRecord, NodeRow, PlaceholderRow, PropertyMap, RelationshipKey,
    RelationshipRecord, RelationshipRow, RetryUpdate, StateUpdate, TransitionGuard,
    TransitionRecord, rel,
};
use crate::store::ContentStore;

#[derive(Debug, Clone)]
struct StoredNode {
    label: String,
    properties: PropertyMap,
    content_hash: Option<String>,
    state: Option<IngestState>,
    pending: bool,
}

impl StoredNode {
    fn to_record(&self, uuid: Uuid) -> NodeRecord {
        NodeRecord {
            uuid,
            label: self.label.clone(),
            properties: self.properties.clone(),
            content_hash: self.content_hash.clone(),
            state: self.state,
            pending: self.pending,
        }
    }
}

type EdgeKey = (Uuid, String, Uuid);

#[derive(Default)]
struct Graph {
    files: HashMap<Uuid, FileRecord>,

    /// Uniqueness constraint on (project, path).
    file_paths: HashMap<(String, String), Uuid>,

    nodes: HashMap<Uuid, StoredNode>,

    /// Label index used by every labeled lookup.
    labels: HashMap<String, HashSet<Uuid>>,

    edges: BTreeMap<EdgeKey, PropertyMap>,
    embeddings: HashMap<Uuid, Vec<f32>>,
    changes: Vec<Change>,
}

impl Graph {
    fn exists(&self, uuid: &Uuid) -> bool {
        self.nodes.contains_key(uuid) || self.files.contains_key(uuid)
    }

    fn has_label(&self, label: &str, uuid: &Uuid) -> bool {
        self.labels.get(label).is_some_and(|ids| ids.contains(uuid))
    }

    fn index(&mut self, label: &str, uuid: Uuid) {
        self.labels.entry(label.to_string()).or_default().insert(uuid);
    }

    fn unindex(&mut self, label: &str, uuid: &Uuid) {
        if let Some(ids) = self.labels.get_mut(label) {
            ids.remove(uuid);
        }
    }

    fn insert_file(&mut self, identity: &FileIdentity, state: IngestState, at: DateTime<Utc>) -> Result<FileRecord> {
        let key = (identity.project_id.clone(), identity.path.clone());
        if let Some(existing) = self.file_paths.get(&key)
            && *existing != identity.id
        {
            return Err(StoreError::ConstraintViolation(format!(
                "file {} already exists in project {} with id {existing}",
                identity.path, identity.project_id
            )));
        }

        let record = FileRecord::new(identity, state, at);
        self.file_paths.insert(key, identity.id);
        self.files.insert(identity.id, record.clone());
        self.index(FILE_LABEL, identity.id);
        Ok(record)
    }

    /// Targets of outgoing `rel_type` edges.
    fn targets(&self, from: Uuid, rel_type: &str) -> Vec<Uuid> {
        self.edges
            .range((from, rel_type.to_string(), Uuid::nil())..)
            .take_while(|((f, t, _), _)| *f == from && t == rel_type)
            .map(|((_, _, to), _)| *to)
            .collect()
    }

    /// Sources of incoming `rel_type` edges.
    fn sources(&self, to: Uuid, rel_type: &str) -> Vec<Uuid> {
        self.edges
            .keys()
            .filter(|(_, t, dest)| *dest == to && t == rel_type)
            .map(|(from, _, _)| *from)
            .collect()
    }

    /// Nodes attached to a file plus their embedding chunks.
    fn with_chunks(&self, nodes: &[Uuid]) -> HashSet<Uuid> {
        let mut all: HashSet<Uuid> = nodes.iter().copied().collect();
        for node in nodes {
            all.extend(self.targets(*node, rel::HAS_CHUNK));
        }
        all
    }

    fn is_referenced(&self, uuid: &Uuid) -> bool {
        self.edges.keys().any(|(_, _, to)| to == uuid)
    }

    /// Remove unreferenced pending nodes and `mentioned` files.
    fn prune_placeholders(&mut self, candidates: &[Uuid]) -> Vec<Uuid> {
        let mut pruned = Vec::new();
        for uuid in candidates {
            if pruned.contains(uuid) || self.is_referenced(uuid) {
                continue;
            }
            if self.nodes.get(uuid).is_some_and(|n| n.pending) {
                if let Some(node) = self.nodes.remove(uuid) {
                    self.unindex(&node.label, uuid);
                }
                self.edges.retain(|(from, _, _), _| from != uuid);
                pruned.push(*uuid);
            } else if self
                .files
                .get(uuid)
                .is_some_and(|f| f.state == IngestState::Mentioned)
                && let Some(file) = self.files.remove(uuid)
            {
                self.file_paths.remove(&(file.project_id, file.path));
                self.unindex(FILE_LABEL, uuid);
                self.edges.retain(|(from, _, _), _| from != uuid);
                pruned.push(*uuid);
            }
        }
        pruned
    }

    fn remove_nodes(&mut self, doomed: &HashSet<Uuid>) {
        if doomed.is_empty() {
            return;
        }
        for uuid in doomed {
            if let Some(node) = self.nodes.remove(uuid) {
                self.unindex(&node.label, uuid);
            }
            self.embeddings.remove(uuid);
        }
        let mut released = Vec::new();
        self.edges.retain(|(from, _, to), _| {
            let keep = !doomed.contains(from) && !doomed.contains(to);
            if !keep && doomed.contains(from) && !doomed.contains(to) {
                released.push(*to);
            }
            keep
        });
        self.prune_placeholders(&released);
    }
}

fn apply_update(file: &mut FileRecord, update: &StateUpdate) {
    file.state = update.state;
    file.state_updated_at = update.at;
    if let Some(hash) = &update.content_hash {
        file.content_hash = Some(hash.clone());
    }
    if let Some(hash) = &update.embedded_content_hash {
        file.embedded_content_hash = Some(hash.clone());
    }
    match &update.error {
        Some((stage, message)) => {
            file.error_type = Some(*stage);
            file.error_message = Some(message.clone());
        }
        None => {
            file.error_type = None;
            file.error_message = None;
        }
    }
    match update.retry {
        RetryUpdate::Keep => {}
        RetryUpdate::Increment => file.retry_count = file.retry_count.saturating_add(1),
        RetryUpdate::Reset => file.retry_count = 0,
    }
}

/// Counters exposed by [`MemoryStore::metrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetrics {
    /// Write statements executed.
    pub write_statements: u64,

    /// Node rows passed to merge statements.
    pub node_rows_written: u64,

    /// Relationship rows merged.
    pub relationship_rows_written: u64,

    /// Endpoint lookups that had no label to use.
    pub unlabeled_matches: u64,

    pub placeholders_created: u64,
}

#[derive(Default)]
struct Counters {
    write_statements: AtomicU64,
    node_rows_written: AtomicU64,
    relationship_rows_written: AtomicU64,
    unlabeled_matches: AtomicU64,
    placeholders_created: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// In-memory content graph.
#[derive(Default)]
pub struct MemoryStore {
    graph: RwLock<Graph>,
    counters: Counters,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the write counters.
    pub fn metrics(&self) -> StoreMetrics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StoreMetrics {
            write_statements: load(&self.counters.write_statements),
            node_rows_written: load(&self.counters.node_rows_written),
            relationship_rows_written: load(&self.counters.relationship_rows_written),
            unlabeled_matches: load(&self.counters.unlabeled_matches),
            placeholders_created: load(&self.counters.placeholders_created),
        }
    }

    /// Fetch any node by uuid.
    pub async fn node(&self, uuid: Uuid) -> Option<NodeRecord> {
        self.graph.read().await.nodes.get(&uuid).map(|n| n.to_record(uuid))
    }

    /// Nodes carrying `label`, sorted by uuid.
    pub async fn nodes_with_label(&self, label: &str) -> Vec<NodeRecord> {
        let graph = self.graph.read().await;
        let mut nodes: Vec<NodeRecord> = graph
            .labels
            .get(label)
            .into_iter()
            .flatten()
            .filter_map(|uuid| graph.nodes.get(uuid).map(|n| n.to_record(*uuid)))
            .collect();
        nodes.sort_by_key(|n| n.uuid);
        nodes
    }

    /// Number of stored content nodes (files excluded).
    pub async fn node_count(&self) -> usize {
        self.graph.read().await.nodes.len()
    }

    /// Every relationship of `rel_type`.
    pub async fn relationships_of_type(&self, rel_type: &str) -> Vec<RelationshipRecord> {
        self.graph
            .read()
            .await
            .edges
            .iter()
            .filter(|((_, t, _), _)| t == rel_type)
            .map(|((from, t, to), properties)| RelationshipRecord {
                rel_type: t.clone(),
                from: *from,
                to: *to,
                properties: properties.clone(),
            })
            .collect()
    }

    /// Stored embedding of a node.
    pub async fn embedding(&self, uuid: Uuid) -> Option<Vec<f32>> {
        self.graph.read().await.embeddings.get(&uuid).cloned()
    }

    fn record_write(&self) {
        Counters::add(&self.counters.write_statements, 1);
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn get_file(&self, id: Uuid) -> Result<Option<FileRecord>> {
        Ok(self.graph.read().await.files.get(&id).cloned())
    }

    async fn get_file_by_path(&self, project_id: &str, path: &str) -> Result<Option<FileRecord>> {
        let graph = self.graph.read().await;
        let key = (project_id.to_string(), path.to_string());
        Ok(graph
            .file_paths
            .get(&key)
            .and_then(|id| graph.files.get(id))
            .cloned())
    }

    async fn create_file_if_absent(
        &self,
        identity: &FileIdentity,
        state: IngestState,
        at: DateTime<Utc>,
    ) -> Result<(FileRecord, bool)> {
        self.record_write();
        let mut graph = self.graph.write().await;
        if let Some(existing) = graph.files.get(&identity.id) {
            return Ok((existing.clone(), false));
        }
        let record = graph.insert_file(identity, state, at)?;
        debug!("Created file {} in state {state}", identity.path);
        Ok((record, true))
    }

    async fn upsert_discovered(
        &self,
        identity: &FileIdentity,
        resettable: &[IngestState],
        at: DateTime<Utc>,
    ) -> Result<DiscoverOutcome> {
        self.record_write();
        let mut graph = self.graph.write().await;
        if let Some(file) = graph.files.get_mut(&identity.id) {
            if !resettable.contains(&file.state) {
                return Ok(DiscoverOutcome::Unchanged(file.clone()));
            }
            let previous = file.state;
            apply_update(
                file,
                &StateUpdate {
                    state: IngestState::Discovered,
                    at,
                    content_hash: None,
                    embedded_content_hash: None,
                    error: None,
                    retry: RetryUpdate::Reset,
                },
            );
            return Ok(DiscoverOutcome::Reset {
                previous,
                file: file.clone(),
            });
        }

        let record = graph.insert_file(identity, IngestState::Discovered, at)?;
        Ok(DiscoverOutcome::Created(record))
    }

    async fn apply_transition(
        &self,
        ids: &[Uuid],
        guard: &TransitionGuard,
        update: &StateUpdate,
    ) -> Result<Vec<TransitionRecord>> {
        self.record_write();
        let mut graph = self.graph.write().await;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(file) = graph.files.get_mut(id) else {
                continue;
            };
            let previous = file.state;
            let applied = guard.allowed_from.contains(&previous)
                && guard
                    .updated_before
                    .is_none_or(|cutoff| file.state_updated_at <= cutoff);
            if applied {
                apply_update(file, update);
            }
            trace!("Transition {} {previous} -> {} applied={applied}", file.path, update.state);
            records.push(TransitionRecord {
                id: *id,
                previous,
                applied,
            });
        }
        Ok(records)
    }

    async fn files_in_states(
        &self,
        states: &[IngestState],
        updated_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<FileRecord>> {
        let graph = self.graph.read().await;
        let mut files: Vec<FileRecord> = graph
            .files
            .values()
            .filter(|f| states.contains(&f.state))
            .filter(|f| updated_before.is_none_or(|cutoff| f.state_updated_at <= cutoff))
            .cloned()
            .collect();
        files.sort_by(|a, b| {
            a.state_updated_at
                .cmp(&b.state_updated_at)
                .then_with(|| a.path.cmp(&b.path))
        });
        files.truncate(limit);
        Ok(files)
    }

    async fn retryable_files(&self, max_retries: u32, limit: usize) -> Result<Vec<FileRecord>> {
        let graph = self.graph.read().await;
        let mut files: Vec<FileRecord> = graph
            .files
            .values()
            .filter(|f| f.state == IngestState::Error && f.retry_count < max_retries)
            .cloned()
            .collect();
        files.sort_by(|a, b| {
            a.retry_count
                .cmp(&b.retry_count)
                .then_with(|| a.state_updated_at.cmp(&b.state_updated_at))
        });
        files.truncate(limit);
        Ok(files)
    }

    async fn state_counts(&self, project_id: Option<&str>) -> Result<BTreeMap<IngestState, u64>> {
        let graph = self.graph.read().await;
        let mut counts = BTreeMap::new();
        for file in graph.files.values() {
            if project_id.is_some_and(|p| p != file.project_id) {
                continue;
            }
            *counts.entry(file.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn delete_file(&self, id: Uuid) -> Result<usize> {
        self.record_write();
        let mut graph = self.graph.write().await;
        let Some(file) = graph.files.remove(&id) else {
            return Ok(0);
        };
        graph.file_paths.remove(&(file.project_id.clone(), file.path.clone()));
        graph.unindex(FILE_LABEL, &id);

        let owned = graph.sources(id, rel::DEFINED_IN);
        let mut doomed = graph.with_chunks(&owned);
        doomed.insert(id);
        graph.remove_nodes(&doomed);
        debug!("Deleted file {} and {} content nodes", file.path, owned.len());
        Ok(owned.len())
    }

    async fn get_nodes(&self, uuids: &[Uuid]) -> Result<Vec<NodeRecord>> {
        let graph = self.graph.read().await;
        Ok(uuids
            .iter()
            .filter_map(|uuid| graph.nodes.get(uuid).map(|n| n.to_record(*uuid)))
            .collect())
    }

    async fn file_nodes(&self, file_id: Uuid) -> Result<Vec<NodeRecord>> {
        let graph = self.graph.read().await;
        let mut nodes: Vec<NodeRecord> = graph
            .sources(file_id, rel::DEFINED_IN)
            .into_iter()
            .filter_map(|uuid| graph.nodes.get(&uuid).map(|n| n.to_record(uuid)))
            .collect();
        nodes.sort_by_key(|n| n.uuid);
        Ok(nodes)
    }

    async fn merge_nodes(&self, label: &str, rows: &[NodeRow]) -> Result<MergeSummary> {
        self.record_write();
        Counters::add(&self.counters.node_rows_written, rows.len());
        let mut graph = self.graph.write().await;
        let mut summary = MergeSummary::default();

        for row in rows {
            let previous_label = match graph.nodes.get_mut(&row.uuid) {
                Some(node) => {
                    if node.pending {
                        summary.reconciled += 1;
                        node.pending = false;
                    } else {
                        summary.updated += 1;
                    }
                    node.properties = row.properties.clone();
                    node.content_hash = row.content_hash.clone();
                    if row.state.is_some() {
                        node.state = row.state;
                    }
                    let previous = std::mem::replace(&mut node.label, label.to_string());
                    (previous != label).then_some(previous)
                }
                None => {
                    summary.created += 1;
                    graph.nodes.insert(
                        row.uuid,
                        StoredNode {
                            label: label.to_string(),
                            properties: row.properties.clone(),
                            content_hash: row.content_hash.clone(),
                            state: row.state,
                            pending: false,
                        },
                    );
                    None
                }
            };
            if let Some(previous) = previous_label {
                graph.unindex(&previous, &row.uuid);
            }
            graph.index(label, row.uuid);
        }

        trace!(
            "Merged {} {label} rows (created: {}, updated: {}, reconciled: {})",
            rows.len(),
            summary.created,
            summary.updated,
            summary.reconciled
        );
        Ok(summary)
    }

    async fn create_placeholders(&self, rows: &[PlaceholderRow]) -> Result<usize> {
        self.record_write();
        let mut graph = self.graph.write().await;
        let mut created = 0;
        for row in rows {
            if graph.exists(&row.uuid) {
                continue;
            }
            graph.nodes.insert(
                row.uuid,
                StoredNode {
                    label: row.label.clone(),
                    properties: row.properties.clone(),
                    content_hash: None,
                    state: None,
                    pending: true,
                },
            );
            graph.index(&row.label, row.uuid);
            created += 1;
        }
        Counters::add(&self.counters.placeholders_created, created);
        Ok(created)
    }

    async fn find_labeled(&self, label: &str, uuids: &[Uuid]) -> Result<Vec<Uuid>> {
        let graph = self.graph.read().await;
        Ok(uuids
            .iter()
            .filter(|uuid| graph.has_label(label, uuid))
            .copied()
            .collect())
    }

    async fn delete_orphans(&self, file_id: Uuid, keep: &HashSet<Uuid>) -> Result<Vec<Uuid>> {
        self.record_write();
        let mut graph = self.graph.write().await;
        let mut orphans: Vec<Uuid> = graph
            .sources(file_id, rel::DEFINED_IN)
            .into_iter()
            .filter(|uuid| !keep.contains(uuid))
            .collect();
        orphans.sort();
        let doomed = graph.with_chunks(&orphans);
        graph.remove_nodes(&doomed);
        Ok(orphans)
    }

    async fn nodes_in_state(
        &self,
        state: IngestState,
        owner_state: Option<IngestState>,
        limit: usize,
    ) -> Result<Vec<NodeRecord>> {
        let graph = self.graph.read().await;
        let owner_matches = |uuid: &Uuid| match owner_state {
            None => true,
            Some(wanted) => graph
                .targets(*uuid, rel::DEFINED_IN)
                .first()
                .and_then(|owner| graph.files.get(owner))
                .is_some_and(|file| file.state == wanted),
        };
        let mut nodes: Vec<NodeRecord> = graph
            .nodes
            .iter()
            .filter(|(_, n)| !n.pending && n.state == Some(state) && n.label != CHUNK_LABEL)
            .filter(|(uuid, _)| owner_matches(uuid))
            .map(|(uuid, n)| n.to_record(*uuid))
            .collect();
        nodes.sort_by_key(|n| n.uuid);
        nodes.truncate(limit);
        Ok(nodes)
    }

    async fn set_node_states(&self, uuids: &[Uuid], state: IngestState) -> Result<usize> {
        self.record_write();
        let mut graph = self.graph.write().await;
        let mut updated = 0;
        for uuid in uuids {
            if let Some(node) = graph.nodes.get_mut(uuid) {
                node.state = Some(state);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn store_embeddings(&self, embeddings: &[(Uuid, Vec<f32>)]) -> Result<usize> {
        self.record_write();
        let mut graph = self.graph.write().await;
        let mut stored = 0;
        for (uuid, vector) in embeddings {
            let Some(node) = graph.nodes.get_mut(uuid) else {
                continue;
            };
            node.state = Some(IngestState::Embedded);
            graph.embeddings.insert(*uuid, vector.clone());
            stored += 1;
        }
        Ok(stored)
    }

    async fn merge_relationships(
        &self,
        key: &RelationshipKey,
        rows: &[RelationshipRow],
    ) -> Result<usize> {
        self.record_write();
        let mut graph = self.graph.write().await;
        let mut merged = 0;
        let mut unlabeled = 0;

        for row in rows {
            let mut matches = |label: &Option<String>, uuid: &Uuid| match label {
                Some(label) => graph.has_label(label, uuid),
                None => {
                    unlabeled += 1;
                    graph.exists(uuid)
                }
            };
            if !matches(&key.from_label, &row.from) || !matches(&key.to_label, &row.to) {
                trace!("Skipping {key} row {} -> {}: endpoint missing", row.from, row.to);
                continue;
            }
            graph
                .edges
                .insert((row.from, key.rel_type.clone(), row.to), row.properties.clone());
            merged += 1;
        }

        Counters::add(&self.counters.unlabeled_matches, unlabeled);
        Counters::add(&self.counters.relationship_rows_written, merged);
        Ok(merged)
    }

    async fn relationships_to(&self, to: Uuid, rel_type: &str) -> Result<Vec<RelationshipRecord>> {
        let graph = self.graph.read().await;
        Ok(graph
            .edges
            .iter()
            .filter(|((_, t, dest), _)| *dest == to && t == rel_type)
            .map(|((from, t, dest), properties)| RelationshipRecord {
                rel_type: t.clone(),
                from: *from,
                to: *dest,
                properties: properties.clone(),
            })
            .collect())
    }

    async fn relationships_from(
        &self,
        from: Uuid,
        rel_type: &str,
    ) -> Result<Vec<RelationshipRecord>> {
        let graph = self.graph.read().await;
        Ok(graph
            .edges
            .range((from, rel_type.to_string(), Uuid::nil())..)
            .take_while(|((f, t, _), _)| *f == from && t == rel_type)
            .map(|((f, t, to), properties)| RelationshipRecord {
                rel_type: t.clone(),
                from: *f,
                to: *to,
                properties: properties.clone(),
            })
            .collect())
    }

    async fn delete_relationships_from(&self, from: Uuid, rel_types: &[&str]) -> Result<usize> {
        self.record_write();
        let mut graph = self.graph.write().await;
        let before = graph.edges.len();
        graph
            .edges
            .retain(|(f, t, _), _| *f != from || !rel_types.contains(&t.as_str()));
        Ok(before - graph.edges.len())
    }

    async fn delete_relationship(&self, from: Uuid, rel_type: &str, to: Uuid) -> Result<bool> {
        self.record_write();
        let mut graph = self.graph.write().await;
        Ok(graph
            .edges
            .remove(&(from, rel_type.to_string(), to))
            .is_some())
    }

    async fn prune_placeholders(&self, candidates: &[Uuid]) -> Result<Vec<Uuid>> {
        self.record_write();
        let mut graph = self.graph.write().await;
        let pruned = graph.prune_placeholders(candidates);
        if !pruned.is_empty() {
            debug!("Pruned {} unreferenced placeholders", pruned.len());
        }
        Ok(pruned)
    }

    async fn append_changes(&self, changes: &[Change]) -> Result<usize> {
        self.record_write();
        self.graph.write().await.changes.extend_from_slice(changes);
        Ok(changes.len())
    }

    async fn changes_for(&self, entity_id: Uuid) -> Result<Vec<Change>> {
        let graph = self.graph.read().await;
        Ok(graph
            .changes
            .iter()
            .filter(|c| c.entity_id == entity_id)
            .cloned()
            .collect())
    }
}
