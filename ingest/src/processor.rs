//! Turns discovered files into graph mutations.
//!
//! ```text
//!  claim (→ parsing) ─► read + hash ─┬─ unchanged ─► parsed ─► linked
//!                                    ├─ vanished  ─► remove file
//!                                    ├─ unreadable ─► error
//!                                    └─ changed ───► one parse call
//!                                                      │
//!                        parsed ◄──────────────────────┘
//!                          │
//!     merge nodes per label, relationships per key (whole batch)
//!                          │
//!     per file, concurrently: orphans, change records, references
//!                          │
//!                 relations ─► linked (+ content hash) ─► on_file_linked
//! ```
//!
//! A failure in the shared parse or node write fails every file in the
//! batch; per-file failures only fail that file.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use futures::stream;
use ragforge_graph_store::{ErrorStage, FILE_LABEL, FileRecord, IngestState};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ProcessorConfig;
use crate::error::{IngestError, Result};
use crate::graph_writer::{GraphWriter, NodeWriteSummary, PreparedNode, RelationshipWriteSummary};
use crate::hooks::{IngestHooks, NoopHooks};
use crate::identity::content_hash;
use crate::node::ExtractorRegistry;
use crate::parser::{Parser, SourceFile, SourceSpec};
use crate::references::{LinkSummary, ReferenceExtractor, ReferenceResolver};
use crate::source::ContentSource;
use crate::state_machine::{StateMachine, TransitionOptions};
use crate::timeout::with_timeout;

/// What happened to one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    /// Parsed, written and linked.
    Linked {
        nodes_written: usize,
        nodes_unchanged: usize,
        orphans_deleted: usize,
        consumes: usize,
        pending_imports: usize,
    },

    /// Content hash matched; linked without parsing.
    Unchanged,

    /// The source vanished; the file was removed from the graph.
    Deleted,

    /// Another path owns the file, or it no longer exists.
    Skipped { current: Option<IngestState> },

    Failed { stage: ErrorStage, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileReport {
    pub id: Uuid,
    pub path: String,
    pub outcome: FileOutcome,
}

impl FileReport {
    fn new(file: &FileRecord, outcome: FileOutcome) -> Self {
        Self {
            id: file.id,
            path: file.path.clone(),
            outcome,
        }
    }

    fn failed(file: &FileRecord, error: &IngestError) -> Self {
        Self::new(
            file,
            FileOutcome::Failed {
                stage: error.stage(),
                message: error.to_string(),
            },
        )
    }
}

/// Result of one [`BatchIngestionProcessor::process_batch_files`] call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub files: Vec<FileReport>,
    pub relationships: RelationshipWriteSummary,
    pub elapsed: Duration,
}

impl BatchReport {
    fn count(&self, matches: impl Fn(&FileOutcome) -> bool) -> usize {
        self.files.iter().filter(|f| matches(&f.outcome)).count()
    }

    pub fn linked(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Linked { .. } | FileOutcome::Unchanged))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, FileOutcome::Failed { .. }))
    }

    /// Whether any file moved.
    pub fn did_work(&self) -> bool {
        self.count(|o| !matches!(o, FileOutcome::Skipped { .. })) > 0
    }

    pub fn outcome_of(&self, id: Uuid) -> Option<&FileOutcome> {
        self.files.iter().find(|f| f.id == id).map(|f| &f.outcome)
    }
}

/// A claimed file whose content differs from the last link.
struct Candidate {
    file: FileRecord,
    content: String,
    hash: String,
}

enum ReadOutcome {
    Changed(Candidate),
    Unchanged(FileRecord),
    Vanished(FileRecord),
    Failed(FileRecord, IngestError),
}

/// Per-file result of the post-write phase.
struct Finished {
    nodes_written: usize,
    nodes_unchanged: usize,
    orphans_deleted: usize,
    references: LinkSummary,
}

/// Converts discovered files into node and relationship writes.
#[derive(Clone)]
pub struct BatchIngestionProcessor {
    machine: StateMachine,
    source: Arc<dyn ContentSource>,
    parser: Arc<dyn Parser>,
    writer: GraphWriter,
    resolver: ReferenceResolver,
    hooks: Arc<dyn IngestHooks>,
    config: ProcessorConfig,
}

impl BatchIngestionProcessor {
    pub fn new(
        machine: StateMachine,
        source: Arc<dyn ContentSource>,
        parser: Arc<dyn Parser>,
        config: ProcessorConfig,
    ) -> Self {
        let writer = GraphWriter::new(
            machine.store().clone(),
            ExtractorRegistry::new(),
            config.store_timeout(),
        );
        let machine = machine.with_store_timeout(config.store_timeout());
        let resolver = ReferenceResolver::new(machine.clone());
        Self {
            machine,
            source,
            parser,
            writer,
            resolver,
            hooks: Arc::new(NoopHooks),
            config,
        }
    }

    /// Use `registry` to normalize parsed nodes.
    pub fn with_extractors(mut self, registry: ExtractorRegistry) -> Self {
        self.writer = GraphWriter::new(
            self.machine.store().clone(),
            registry,
            self.config.store_timeout(),
        );
        self
    }

    pub fn with_reference_extractor(mut self, extractor: Arc<dyn ReferenceExtractor>) -> Self {
        self.resolver = self.resolver.with_extractor(extractor);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn IngestHooks>) -> Self {
        self.resolver = self.resolver.with_hooks(hooks.clone());
        self.hooks = hooks;
        self
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Process one file. The persisted state is re-read first, so a file
    /// another path already advanced is skipped.
    pub async fn process_file(&self, id: Uuid) -> Result<FileReport> {
        let Some(file) = self.machine.get_file(id).await? else {
            return Ok(FileReport {
                id,
                path: String::new(),
                outcome: FileOutcome::Skipped { current: None },
            });
        };
        let fallback = FileReport::new(
            &file,
            FileOutcome::Skipped {
                current: Some(file.state),
            },
        );
        let mut report = self.process_batch_files(vec![file]).await?;
        Ok(report.files.pop().unwrap_or(fallback))
    }

    /// Process many files with one parse call and batched writes.
    pub async fn process_batch_files(&self, files: Vec<FileRecord>) -> Result<BatchReport> {
        let started = Instant::now();
        let mut report = BatchReport::default();
        if files.is_empty() {
            return Ok(report);
        }

        let ids: Vec<Uuid> = files.iter().map(|f| f.id).collect();
        let claim = self
            .machine
            .transition_batch(
                &ids,
                IngestState::Parsing,
                TransitionOptions::default()
                    .expecting(&[IngestState::Discovered, IngestState::Error]),
            )
            .await?;
        let claimed: HashSet<Uuid> = claim.applied.iter().copied().collect();
        let current: HashMap<Uuid, IngestState> = claim.rejected.iter().copied().collect();

        let mut owned = Vec::with_capacity(claimed.len());
        for file in files {
            if claimed.contains(&file.id) {
                owned.push(file);
            } else {
                let state = current.get(&file.id).copied();
                debug!("Skipping {}: currently {state:?}", file.path);
                report
                    .files
                    .push(FileReport::new(&file, FileOutcome::Skipped { current: state }));
            }
        }

        let reads: Vec<ReadOutcome> = stream::iter(owned)
            .map(|file| self.read_file(file))
            .buffer_unordered(self.config.effective_concurrency())
            .collect()
            .await;

        let mut changed = Vec::new();
        let mut unchanged = Vec::new();
        for read in reads {
            match read {
                ReadOutcome::Changed(candidate) => changed.push(candidate),
                ReadOutcome::Unchanged(file) => unchanged.push(file),
                ReadOutcome::Vanished(file) => {
                    let report_entry = match self.remove_file(&file).await {
                        Ok(_) => FileReport::new(&file, FileOutcome::Deleted),
                        Err(e) => self.fail_file(&file, &e).await,
                    };
                    report.files.push(report_entry);
                }
                ReadOutcome::Failed(file, error) => {
                    report.files.push(self.fail_file(&file, &error).await);
                }
            }
        }

        if !unchanged.is_empty() {
            report.files.extend(self.relink_unchanged(unchanged).await);
        }

        let mut by_project: BTreeMap<String, Vec<Candidate>> = BTreeMap::new();
        for candidate in changed {
            by_project
                .entry(candidate.file.project_id.clone())
                .or_default()
                .push(candidate);
        }
        for (project_id, candidates) in by_project {
            let (files, relationships) = self.ingest_changed(project_id, candidates).await;
            report.files.extend(files);
            report.relationships.merged += relationships.merged;
            report.relationships.placeholders += relationships.placeholders;
            report.relationships.unlabeled += relationships.unlabeled;
            report.relationships.failed_groups += relationships.failed_groups;
        }

        report.elapsed = started.elapsed();
        if report.did_work() {
            info!(
                "Processed {} files in {:?}: {} linked, {} failed",
                report.files.len(),
                report.elapsed,
                report.linked(),
                report.failed()
            );
        }
        Ok(report)
    }

    async fn read_file(&self, file: FileRecord) -> ReadOutcome {
        let read = with_timeout(
            "read content",
            self.config.read_timeout(),
            self.source.read_content(&file),
        )
        .await;
        match read {
            Ok(content) => {
                let hash = content_hash(&content);
                // A file retried from `error` may hold a partial write, so
                // only a cleanly linked hash short-circuits.
                if file.state != IngestState::Error
                    && file.content_hash.as_deref() == Some(hash.as_str())
                {
                    ReadOutcome::Unchanged(file)
                } else {
                    ReadOutcome::Changed(Candidate {
                        file,
                        content,
                        hash,
                    })
                }
            }
            Err(IngestError::Source(e)) if e.is_not_found() => ReadOutcome::Vanished(file),
            Err(e) => ReadOutcome::Failed(file, e),
        }
    }

    async fn fail_file(&self, file: &FileRecord, error: &IngestError) -> FileReport {
        if let Err(e) = self
            .machine
            .fail(file.id, error.stage(), error.to_string())
            .await
        {
            warn!("Could not record failure of {}: {e}", file.path);
        }
        FileReport::failed(file, error)
    }

    async fn fail_each<'a>(
        &self,
        files: impl IntoIterator<Item = &'a FileRecord>,
        error: &IngestError,
    ) -> Vec<FileReport> {
        let mut reports = Vec::new();
        for file in files {
            reports.push(self.fail_file(file, error).await);
        }
        reports
    }

    async fn fail_all(&self, candidates: &[Candidate], error: &IngestError) -> Vec<FileReport> {
        warn!("Failing batch of {} files: {error}", candidates.len());
        let files: Vec<&FileRecord> = candidates.iter().map(|c| &c.file).collect();
        self.fail_each(files, error).await
    }

    /// `parsing → parsed → linked` for files whose content did not change.
    async fn relink_unchanged(&self, files: Vec<FileRecord>) -> Vec<FileReport> {
        let ids: Vec<Uuid> = files.iter().map(|f| f.id).collect();
        let parsed = match self
            .machine
            .transition_batch(
                &ids,
                IngestState::Parsed,
                TransitionOptions::default().expecting(&[IngestState::Parsing]),
            )
            .await
        {
            Ok(parsed) => parsed,
            Err(e) => return self.fail_each(&files, &e).await,
        };
        let linked = match self
            .machine
            .transition_batch(
                &parsed.applied,
                IngestState::Linked,
                TransitionOptions::default().expecting(&[IngestState::Parsed]),
            )
            .await
        {
            Ok(linked) => linked,
            Err(e) => return self.fail_each(&files, &e).await,
        };
        let linked: HashSet<Uuid> = linked.applied.into_iter().collect();

        let mut reports = Vec::with_capacity(files.len());
        for file in &files {
            if linked.contains(&file.id) {
                self.on_linked(file).await;
                reports.push(FileReport::new(file, FileOutcome::Unchanged));
            } else {
                reports.push(FileReport::new(file, FileOutcome::Skipped { current: None }));
            }
        }
        debug!("Relinked {} unchanged files", linked.len());
        reports
    }

    /// Parse, write and link claimed files of one project. Store failures
    /// fail the affected files instead of leaving them mid-flight.
    async fn ingest_changed(
        &self,
        project_id: String,
        mut candidates: Vec<Candidate>,
    ) -> (Vec<FileReport>, RelationshipWriteSummary) {
        let mut ids: Vec<Uuid> = candidates.iter().map(|c| c.file.id).collect();
        let spec = SourceSpec {
            project_id,
            files: candidates
                .iter()
                .map(|c| SourceFile {
                    path: c.file.path.clone(),
                    content: c.content.clone(),
                })
                .collect(),
        };

        let parsed = match with_timeout(
            "parse",
            self.config.parse_timeout(),
            self.parser.parse(&spec),
        )
        .await
        {
            Ok(parsed) => parsed,
            Err(e) => {
                let error = match e {
                    IngestError::Timeout { .. } | IngestError::Parse(_) => e,
                    other => IngestError::Parse(other.to_string()),
                };
                return (self.fail_all(&candidates, &error).await, Default::default());
            }
        };
        let claim = match self
            .machine
            .transition_batch(
                &ids,
                IngestState::Parsed,
                TransitionOptions::default().expecting(&[IngestState::Parsing]),
            )
            .await
        {
            Ok(claim) => claim,
            Err(e) => return (self.fail_all(&candidates, &e).await, Default::default()),
        };

        let mut reports = Vec::with_capacity(candidates.len());
        let mut lost_paths = HashSet::new();
        if claim.applied.len() < ids.len() {
            let applied: HashSet<Uuid> = claim.applied.iter().copied().collect();
            let current: HashMap<Uuid, IngestState> = claim.rejected.iter().copied().collect();
            let (kept, lost): (Vec<_>, Vec<_>) = candidates
                .into_iter()
                .partition(|c| applied.contains(&c.file.id));
            for candidate in lost {
                let state = current.get(&candidate.file.id).copied();
                debug!("{} moved to {state:?} while parsing", candidate.file.path);
                reports.push(FileReport::new(
                    &candidate.file,
                    FileOutcome::Skipped { current: state },
                ));
                lost_paths.insert(candidate.file.path);
            }
            candidates = kept;
            ids = candidates.iter().map(|c| c.file.id).collect();
            if candidates.is_empty() {
                return (reports, Default::default());
            }
        }

        let owners: HashMap<&str, Uuid> = candidates
            .iter()
            .map(|c| (c.file.path.as_str(), c.file.id))
            .collect();
        let mut keep: HashMap<Uuid, HashSet<Uuid>> = ids.iter().map(|id| (*id, HashSet::new())).collect();
        let mut known: HashMap<Uuid, String> =
            ids.iter().map(|id| (*id, FILE_LABEL.to_string())).collect();
        let mut prepared: Vec<PreparedNode> = Vec::with_capacity(parsed.nodes.len());
        let mut dropped = HashSet::new();
        for node in &parsed.nodes {
            if node.owner_file().is_some_and(|path| lost_paths.contains(path)) {
                dropped.insert(node.uuid());
                continue;
            }
            let owner = node.owner_file().and_then(|path| owners.get(path)).copied();
            if let Some(owner) = owner {
                keep.entry(owner).or_default().insert(node.uuid());
            }
            known.insert(node.uuid(), node.label().to_string());
            prepared.push(self.writer.prepare(node, owner));
        }
        debug!(
            "Parsed {} files into {} nodes and {} relationships",
            ids.len(),
            prepared.len(),
            parsed.relationships.len()
        );

        let written = match self.writer.write_nodes(&prepared).await {
            Ok(written) => written,
            Err(e) => {
                reports.extend(self.fail_all(&candidates, &e).await);
                return (reports, Default::default());
            }
        };
        let owned_relationships: Vec<_> = parsed
            .relationships
            .iter()
            .filter(|r| !dropped.contains(&r.from))
            .cloned()
            .collect();
        let relationships = self
            .writer
            .write_relationships(&owned_relationships, &known)
            .await;

        let empty = HashSet::new();
        let finished: Vec<(Candidate, Result<Finished>)> = stream::iter(candidates)
            .map(|candidate| {
                let keep = keep.get(&candidate.file.id).unwrap_or(&empty);
                let written = &written;
                async move {
                    let result = self.finish_file(&candidate, keep, written).await;
                    (candidate, result)
                }
            })
            .buffer_unordered(self.config.effective_concurrency())
            .collect()
            .await;

        let mut succeeded = Vec::new();
        for (candidate, result) in finished {
            match result {
                Ok(done) => succeeded.push((candidate, done)),
                Err(e) => reports.push(self.fail_file(&candidate.file, &e).await),
            }
        }

        let succeeded_ids: Vec<Uuid> = succeeded.iter().map(|(c, _)| c.file.id).collect();
        let relations = match self
            .machine
            .transition_batch(
                &succeeded_ids,
                IngestState::Relations,
                TransitionOptions::default().expecting(&[IngestState::Parsed]),
            )
            .await
        {
            Ok(relations) => relations,
            Err(e) => {
                let files: Vec<&FileRecord> = succeeded.iter().map(|(c, _)| &c.file).collect();
                reports.extend(self.fail_each(files, &e).await);
                return (reports, relationships);
            }
        };
        let in_relations: HashSet<Uuid> = relations.applied.into_iter().collect();

        let mut linked = Vec::with_capacity(succeeded.len());
        for (candidate, done) in succeeded {
            let outcome = if in_relations.contains(&candidate.file.id) {
                let transition = self
                    .machine
                    .transition(
                        candidate.file.id,
                        IngestState::Linked,
                        TransitionOptions::default()
                            .with_content_hash(candidate.hash.as_str())
                            .expecting(&[IngestState::Relations]),
                    )
                    .await;
                match transition {
                    Ok(outcome) => outcome.applied(),
                    Err(e) => {
                        reports.push(self.fail_file(&candidate.file, &e).await);
                        continue;
                    }
                }
            } else {
                false
            };
            if outcome {
                linked.push(candidate.file.clone());
                reports.push(FileReport::new(
                    &candidate.file,
                    FileOutcome::Linked {
                        nodes_written: done.nodes_written,
                        nodes_unchanged: done.nodes_unchanged,
                        orphans_deleted: done.orphans_deleted,
                        consumes: done.references.consumes,
                        pending_imports: done.references.pending,
                    },
                ));
            } else {
                reports.push(FileReport::new(
                    &candidate.file,
                    FileOutcome::Skipped { current: None },
                ));
            }
        }

        // After every file of the batch is linked, so imports between
        // files of the same batch resolve.
        for file in &linked {
            self.on_linked(file).await;
        }
        (reports, relationships)
    }

    /// Orphan cleanup, change records and references of one file.
    async fn finish_file(
        &self,
        candidate: &Candidate,
        keep: &HashSet<Uuid>,
        written: &NodeWriteSummary,
    ) -> Result<Finished> {
        let file = &candidate.file;
        let cleanup = self
            .writer
            .delete_orphans(file.id, keep, self.config.track_changes)
            .await?;

        let deltas: Vec<_> = written
            .deltas
            .iter()
            .filter(|d| d.file_id == file.id)
            .cloned()
            .collect();
        let nodes_written = deltas.len();

        if self.config.track_changes {
            let now = Utc::now();
            let changes: Vec<_> = deltas
                .into_iter()
                .chain(cleanup.deltas)
                .map(|delta| delta.into_change(now))
                .collect();
            if !changes.is_empty()
                && let Err(e) = with_timeout(
                    "append changes",
                    self.config.store_timeout(),
                    self.machine.store().append_changes(&changes),
                )
                .await
            {
                warn!("Dropping {} change records of {}: {e}", changes.len(), file.path);
            }
        }

        let references = self.resolver.process(file, &candidate.content).await?;
        Ok(Finished {
            nodes_written,
            nodes_unchanged: keep.len().saturating_sub(nodes_written),
            orphans_deleted: cleanup.deleted.len(),
            references,
        })
    }

    async fn on_linked(&self, file: &FileRecord) {
        if let Err(e) = self.resolver.resolve_pending_imports(file).await {
            warn!("Resolving pending imports of {} failed: {e}", file.path);
        }
        self.hooks.on_file_linked(&file.path).await;
    }

    /// Remove a file whose source vanished, with its nodes and chunks.
    /// Returns the number of content nodes removed.
    pub async fn remove_file(&self, file: &FileRecord) -> Result<usize> {
        if self.config.track_changes {
            let cleanup = self
                .writer
                .delete_orphans(file.id, &HashSet::new(), true)
                .await?;
            let now = Utc::now();
            let changes: Vec<_> = cleanup
                .deltas
                .into_iter()
                .map(|delta| delta.into_change(now))
                .collect();
            if !changes.is_empty()
                && let Err(e) = with_timeout(
                    "append changes",
                    self.config.store_timeout(),
                    self.machine.store().append_changes(&changes),
                )
                .await
            {
                warn!("Dropping {} change records of {}: {e}", changes.len(), file.path);
            }
        }
        let removed = with_timeout(
            "delete file",
            self.config.store_timeout(),
            self.machine.store().delete_file(file.id),
        )
        .await?;
        info!("Removed {} ({removed} nodes)", file.path);
        Ok(removed)
    }

    /// Remove the file at `path` if the store tracks it.
    pub async fn remove_path(&self, project_id: &str, path: &str) -> Result<bool> {
        match self.machine.get_file_by_path(project_id, path).await? {
            Some(file) => {
                self.remove_file(&file).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
