//! Processing against a store that stalls or errors on selected calls.
//!
//! Files must never be left in an in-flight state when the store
//! misbehaves: every stalled or failed call ends in `error` or in an
//! error returned to the caller.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use ragforge_graph_store::{
    Change, ContentStore, DiscoverOutcome, ErrorStage, FileIdentity, FileRecord, IngestState,
    MemoryStore, MergeSummary, NodeRecord, NodeRow, PlaceholderRow, RelationshipKey,
    RelationshipRecord, RelationshipRow, StateUpdate, StoreError, TransitionGuard,
    TransitionRecord,
};
use ragforge_ingest::{
    BatchIngestionProcessor, FileOutcome, ImportExtractor, IngestError, MarkdownParser,
    ProcessorConfig, StateMachine, TransitionOptions, VirtualSource,
};
use uuid::Uuid;

const PROJECT: &str = "docs";

#[derive(Debug, Clone, Copy)]
enum Fault {
    /// Transitions into the state never answer.
    HangOn(IngestState),
    /// Transitions into the state fail.
    FailOn(IngestState),
    /// Path lookups never answer.
    HangLookups,
}

/// Wraps [`MemoryStore`], injecting the configured fault.
#[derive(Default)]
struct FlakyStore {
    inner: MemoryStore,
    fault: Mutex<Option<Fault>>,
}

impl FlakyStore {
    fn set_fault(&self, fault: Fault) {
        *self.fault.lock().unwrap() = Some(fault);
    }

    fn fault(&self) -> Option<Fault> {
        *self.fault.lock().unwrap()
    }
}

#[async_trait]
impl ContentStore for FlakyStore {
    async fn get_file(&self, id: Uuid) -> ragforge_graph_store::Result<Option<FileRecord>> {
        self.inner.get_file(id).await
    }

    async fn get_file_by_path(
        &self,
        project_id: &str,
        path: &str,
    ) -> ragforge_graph_store::Result<Option<FileRecord>> {
        if matches!(self.fault(), Some(Fault::HangLookups)) {
            std::future::pending::<()>().await;
        }
        self.inner.get_file_by_path(project_id, path).await
    }

    async fn create_file_if_absent(
        &self,
        identity: &FileIdentity,
        state: IngestState,
        at: DateTime<Utc>,
    ) -> ragforge_graph_store::Result<(FileRecord, bool)> {
        self.inner.create_file_if_absent(identity, state, at).await
    }

    async fn upsert_discovered(
        &self,
        identity: &FileIdentity,
        resettable: &[IngestState],
        at: DateTime<Utc>,
    ) -> ragforge_graph_store::Result<DiscoverOutcome> {
        self.inner.upsert_discovered(identity, resettable, at).await
    }

    async fn apply_transition(
        &self,
        ids: &[Uuid],
        guard: &TransitionGuard,
        update: &StateUpdate,
    ) -> ragforge_graph_store::Result<Vec<TransitionRecord>> {
        match self.fault() {
            Some(Fault::HangOn(state)) if state == update.state => {
                std::future::pending::<()>().await;
            }
            Some(Fault::FailOn(state)) if state == update.state => {
                return Err(StoreError::Backend("boom".to_string()));
            }
            _ => {}
        }
        self.inner.apply_transition(ids, guard, update).await
    }

    async fn files_in_states(
        &self,
        states: &[IngestState],
        updated_before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> ragforge_graph_store::Result<Vec<FileRecord>> {
        self.inner.files_in_states(states, updated_before, limit).await
    }

    async fn retryable_files(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> ragforge_graph_store::Result<Vec<FileRecord>> {
        self.inner.retryable_files(max_retries, limit).await
    }

    async fn state_counts(
        &self,
        project_id: Option<&str>,
    ) -> ragforge_graph_store::Result<BTreeMap<IngestState, u64>> {
        self.inner.state_counts(project_id).await
    }

    async fn delete_file(&self, id: Uuid) -> ragforge_graph_store::Result<usize> {
        self.inner.delete_file(id).await
    }

    async fn get_nodes(&self, uuids: &[Uuid]) -> ragforge_graph_store::Result<Vec<NodeRecord>> {
        self.inner.get_nodes(uuids).await
    }

    async fn file_nodes(&self, file_id: Uuid) -> ragforge_graph_store::Result<Vec<NodeRecord>> {
        self.inner.file_nodes(file_id).await
    }

    async fn merge_nodes(
        &self,
        label: &str,
        rows: &[NodeRow],
    ) -> ragforge_graph_store::Result<MergeSummary> {
        self.inner.merge_nodes(label, rows).await
    }

    async fn create_placeholders(
        &self,
        rows: &[PlaceholderRow],
    ) -> ragforge_graph_store::Result<usize> {
        self.inner.create_placeholders(rows).await
    }

    async fn find_labeled(
        &self,
        label: &str,
        uuids: &[Uuid],
    ) -> ragforge_graph_store::Result<Vec<Uuid>> {
        self.inner.find_labeled(label, uuids).await
    }

    async fn delete_orphans(
        &self,
        file_id: Uuid,
        keep: &HashSet<Uuid>,
    ) -> ragforge_graph_store::Result<Vec<Uuid>> {
        self.inner.delete_orphans(file_id, keep).await
    }

    async fn nodes_in_state(
        &self,
        state: IngestState,
        owner_state: Option<IngestState>,
        limit: usize,
    ) -> ragforge_graph_store::Result<Vec<NodeRecord>> {
        self.inner.nodes_in_state(state, owner_state, limit).await
    }

    async fn set_node_states(
        &self,
        uuids: &[Uuid],
        state: IngestState,
    ) -> ragforge_graph_store::Result<usize> {
        self.inner.set_node_states(uuids, state).await
    }

    async fn store_embeddings(
        &self,
        embeddings: &[(Uuid, Vec<f32>)],
    ) -> ragforge_graph_store::Result<usize> {
        self.inner.store_embeddings(embeddings).await
    }

    async fn merge_relationships(
        &self,
        key: &RelationshipKey,
        rows: &[RelationshipRow],
    ) -> ragforge_graph_store::Result<usize> {
        self.inner.merge_relationships(key, rows).await
    }

    async fn relationships_to(
        &self,
        to: Uuid,
        rel_type: &str,
    ) -> ragforge_graph_store::Result<Vec<RelationshipRecord>> {
        self.inner.relationships_to(to, rel_type).await
    }

    async fn relationships_from(
        &self,
        from: Uuid,
        rel_type: &str,
    ) -> ragforge_graph_store::Result<Vec<RelationshipRecord>> {
        self.inner.relationships_from(from, rel_type).await
    }

    async fn delete_relationships_from(
        &self,
        from: Uuid,
        rel_types: &[&str],
    ) -> ragforge_graph_store::Result<usize> {
        self.inner.delete_relationships_from(from, rel_types).await
    }

    async fn delete_relationship(
        &self,
        from: Uuid,
        rel_type: &str,
        to: Uuid,
    ) -> ragforge_graph_store::Result<bool> {
        self.inner.delete_relationship(from, rel_type, to).await
    }

    async fn prune_placeholders(
        &self,
        candidates: &[Uuid],
    ) -> ragforge_graph_store::Result<Vec<Uuid>> {
        self.inner.prune_placeholders(candidates).await
    }

    async fn append_changes(&self, changes: &[Change]) -> ragforge_graph_store::Result<usize> {
        self.inner.append_changes(changes).await
    }

    async fn changes_for(&self, entity_id: Uuid) -> ragforge_graph_store::Result<Vec<Change>> {
        self.inner.changes_for(entity_id).await
    }
}

struct Harness {
    store: Arc<FlakyStore>,
    source: Arc<VirtualSource>,
    processor: BatchIngestionProcessor,
}

impl Harness {
    fn new() -> Self {
        let store = Arc::new(FlakyStore::default());
        let source = Arc::new(VirtualSource::new());
        let processor = BatchIngestionProcessor::new(
            StateMachine::new(store.clone()),
            source.clone(),
            Arc::new(MarkdownParser),
            ProcessorConfig::default().with_store_timeout(Duration::from_millis(50)),
        )
        .with_reference_extractor(Arc::new(ImportExtractor::new()));
        Self {
            store,
            source,
            processor,
        }
    }

    async fn write(&self, path: &str, content: &str) -> Uuid {
        self.source.insert(path, content).await;
        self.processor
            .machine()
            .mark_discovered(path, PROJECT)
            .await
            .unwrap()
            .file()
            .id
    }

    async fn file(&self, id: Uuid) -> FileRecord {
        self.store.get_file(id).await.unwrap().unwrap()
    }
}

#[tokio::test]
async fn test_stalled_parsed_transition_fails_the_file() {
    let h = Harness::new();
    let id = h.write("/guide.md", "# Guide\nhello\n").await;
    h.store.set_fault(Fault::HangOn(IngestState::Parsed));

    let report = tokio::time::timeout(Duration::from_secs(2), h.processor.process_file(id))
        .await
        .expect("processing must not hang on a stalled store")
        .unwrap();
    assert!(matches!(
        report.outcome,
        FileOutcome::Failed {
            stage: ErrorStage::Parse,
            ..
        }
    ));
    let file = h.file(id).await;
    assert_eq!(file.state, IngestState::Error);
    assert_eq!(file.retry_count, 1);
}

#[tokio::test]
async fn test_stalled_claim_returns_timeout() {
    let h = Harness::new();
    let id = h.write("/guide.md", "# Guide\nhello\n").await;
    h.store.set_fault(Fault::HangOn(IngestState::Parsing));

    let result = tokio::time::timeout(Duration::from_secs(2), h.processor.process_file(id))
        .await
        .expect("processing must not hang on a stalled store");
    assert!(matches!(result, Err(IngestError::Timeout { .. })));
    assert_eq!(h.file(id).await.state, IngestState::Discovered);
}

#[tokio::test]
async fn test_failed_parsed_transition_fails_changed_file() {
    let h = Harness::new();
    let id = h.write("/guide.md", "# Guide\nhello\n").await;
    h.store.set_fault(Fault::FailOn(IngestState::Parsed));

    let report = h.processor.process_file(id).await.unwrap();
    assert!(matches!(report.outcome, FileOutcome::Failed { .. }));
    let file = h.file(id).await;
    assert_eq!(file.state, IngestState::Error);
    assert_eq!(file.error_type, Some(ErrorStage::Parse));
    assert_eq!(file.retry_count, 1);
    assert!(h.store.inner.nodes_with_label("Section").await.is_empty());
}

#[tokio::test]
async fn test_failed_parsed_transition_fails_unchanged_file() {
    let h = Harness::new();
    let id = h.write("/guide.md", "# Guide\nhello\n").await;
    h.processor.process_file(id).await.unwrap();
    let machine = h.processor.machine();
    machine
        .transition(id, IngestState::Embedded, TransitionOptions::default())
        .await
        .unwrap();
    machine.mark_discovered("/guide.md", PROJECT).await.unwrap();

    h.store.set_fault(Fault::FailOn(IngestState::Parsed));
    let report = h.processor.process_file(id).await.unwrap();
    assert!(matches!(report.outcome, FileOutcome::Failed { .. }));
    assert_eq!(h.file(id).await.state, IngestState::Error);
}

#[tokio::test]
async fn test_stalled_path_lookups_fail_reference_linking() {
    let h = Harness::new();
    let id = h.write("/src/app.ts", "import { helper } from './util';\n").await;
    h.store.set_fault(Fault::HangLookups);

    let report = tokio::time::timeout(Duration::from_secs(2), h.processor.process_file(id))
        .await
        .expect("reference resolution must not hang on a stalled store")
        .unwrap();
    assert!(matches!(
        report.outcome,
        FileOutcome::Failed {
            stage: ErrorStage::Relations,
            ..
        }
    ));
    let file = h.file(id).await;
    assert_eq!(file.state, IngestState::Error);
    assert_eq!(file.error_type, Some(ErrorStage::Relations));
}
