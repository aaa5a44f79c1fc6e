//! Per-file lifecycle state machine.
//!
//! ```text
//!  mentioned ─┐
//!             ▼
//!        discovered ──► parsing ──► parsed ──► relations ──► linked
//!             ▲            │           └────────────────────► │
//!             │            ▼                                  ▼
//!             └──────── error ◄── (relations, entities, embedding)
//!                                                             │
//!                        linked ──► entities ──► embedding ──► embedded
//! ```
//!
//! Every transition is one guarded store statement: the update only applies
//! if the file is currently in a state the table allows the transition from.
//! The persisted `state` is the single owner token for a file; any path that
//! wants to act on a file must win that guard first.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use ragforge_graph_store::{
    ContentStore, DiscoverOutcome, ErrorStage, FileIdentity, FileRecord, IngestState,
    RetryUpdate, StateUpdate, TransitionGuard, TransitionRecord,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::identity::file_id;
use crate::timeout::with_timeout;

const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(60);

/// States `mark_discovered` may reset. Anything else is in flight or already
/// queued and is left alone.
pub const RESETTABLE_ON_DISCOVER: [IngestState; 3] = [
    IngestState::Embedded,
    IngestState::Error,
    IngestState::Mentioned,
];

/// Whether `from → to` is in the transition table.
pub fn can_transition(from: IngestState, to: IngestState) -> bool {
    use IngestState as S;
    match (from, to) {
        (S::Discovered | S::Error, S::Parsing)
        | (S::Parsing, S::Parsed | S::Error)
        | (S::Parsed, S::Relations | S::Linked)
        | (S::Relations, S::Linked | S::Error)
        | (S::Linked, S::Entities | S::Embedding | S::Embedded)
        | (S::Entities, S::Embedding | S::Error | S::Embedded)
        | (S::Embedding, S::Embedded | S::Error) => true,
        (from, S::Discovered) => from != S::Discovered,
        _ => false,
    }
}

/// States `to` can be reached from.
pub fn sources_of(to: IngestState) -> Vec<IngestState> {
    IngestState::ALL
        .into_iter()
        .filter(|from| can_transition(*from, to))
        .collect()
}

/// Intermediate states a file passes through on its way to `error`.
fn error_route(from: IngestState) -> &'static [IngestState] {
    match from {
        IngestState::Discovered | IngestState::Error => &[IngestState::Parsing],
        IngestState::Parsed => &[IngestState::Relations],
        IngestState::Linked => &[IngestState::Entities],
        _ => &[],
    }
}

/// Optional inputs of a transition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransitionOptions {
    /// Stored with the transition.
    pub content_hash: Option<String>,

    /// Stored with the transition.
    pub embedded_content_hash: Option<String>,

    /// Required for transitions into `error`.
    pub error: Option<(ErrorStage, String)>,

    /// Narrow the allowed source states further than the table does.
    pub expected_from: Option<Vec<IngestState>>,

    /// Only apply if the state has not changed since this instant.
    pub updated_before: Option<DateTime<Utc>>,
}

impl TransitionOptions {
    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    pub fn with_embedded_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.embedded_content_hash = Some(hash.into());
        self
    }

    pub fn with_error(mut self, stage: ErrorStage, message: impl Into<String>) -> Self {
        self.error = Some((stage, message.into()));
        self
    }

    pub fn expecting(mut self, states: &[IngestState]) -> Self {
        self.expected_from = Some(states.to_vec());
        self
    }
}

/// Result of a single-file transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    Applied { previous: IngestState },

    /// The file exists but its state does not allow the transition.
    Rejected { current: IngestState },

    /// No such file.
    Missing,
}

impl TransitionOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Whether the target row existed.
    pub fn existed(&self) -> bool {
        !matches!(self, Self::Missing)
    }
}

/// Result of a batched transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchTransition {
    pub applied: Vec<Uuid>,
    pub rejected: Vec<(Uuid, IngestState)>,
    pub missing: Vec<Uuid>,
}

impl BatchTransition {
    fn from_records(ids: &[Uuid], records: Vec<TransitionRecord>) -> Self {
        let mut batch = Self::default();
        let mut seen = Vec::with_capacity(records.len());
        for record in records {
            seen.push(record.id);
            if record.applied {
                batch.applied.push(record.id);
            } else {
                batch.rejected.push((record.id, record.previous));
            }
        }
        batch.missing = ids.iter().filter(|id| !seen.contains(*id)).copied().collect();
        batch
    }
}

/// Per-state file counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateStats {
    pub counts: BTreeMap<IngestState, u64>,
    pub total: u64,
}

impl StateStats {
    pub fn count(&self, state: IngestState) -> u64 {
        self.counts.get(&state).copied().unwrap_or(0)
    }
}

/// Coarse progress over the files of a project. Mentioned files are not
/// counted: they are placeholders, not work.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total: u64,

    /// Linked or further.
    pub completed: u64,

    /// In a transient state or `parsed`.
    pub in_progress: u64,

    /// Waiting in `discovered`.
    pub pending: u64,

    pub failed: u64,

    /// `completed / total`, in percent.
    pub percent: f64,
}

impl Progress {
    fn from_counts(counts: &BTreeMap<IngestState, u64>) -> Self {
        let mut progress = Self::default();
        for (state, count) in counts {
            match state {
                IngestState::Mentioned => continue,
                IngestState::Discovered => progress.pending += count,
                IngestState::Error => progress.failed += count,
                s if s.is_linked() => progress.completed += count,
                _ => progress.in_progress += count,
            }
            progress.total += count;
        }
        if progress.total > 0 {
            progress.percent = progress.completed as f64 * 100.0 / progress.total as f64;
        }
        progress
    }
}

/// Authoritative tracker of file lifecycle states.
///
/// Every store statement it issues is bounded by the store timeout.
#[derive(Clone)]
pub struct StateMachine {
    store: Arc<dyn ContentStore>,
    store_timeout: Duration,
}

impl StateMachine {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self {
            store,
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    /// Deadline for each store statement.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    fn update_for(to: IngestState, options: TransitionOptions) -> StateUpdate {
        let retry = match to {
            IngestState::Error => RetryUpdate::Increment,
            IngestState::Discovered => RetryUpdate::Reset,
            _ => RetryUpdate::Keep,
        };
        StateUpdate {
            state: to,
            at: Utc::now(),
            content_hash: options.content_hash,
            embedded_content_hash: options.embedded_content_hash,
            error: options.error.filter(|_| to == IngestState::Error),
            retry,
        }
    }

    fn guard_for(to: IngestState, options: &TransitionOptions) -> TransitionGuard {
        let mut allowed_from = sources_of(to);
        if let Some(expected) = &options.expected_from {
            allowed_from.retain(|state| expected.contains(state));
        }
        TransitionGuard {
            allowed_from,
            updated_before: options.updated_before,
        }
    }

    /// Move one file to `to` if the table allows it from its current state.
    pub async fn transition(
        &self,
        id: Uuid,
        to: IngestState,
        options: TransitionOptions,
    ) -> Result<TransitionOutcome> {
        let guard = Self::guard_for(to, &options);
        let update = Self::update_for(to, options);
        let records = with_timeout(
            "transition",
            self.store_timeout,
            self.store.apply_transition(&[id], &guard, &update),
        )
        .await?;
        let outcome = match records.first() {
            None => TransitionOutcome::Missing,
            Some(record) if record.applied => TransitionOutcome::Applied {
                previous: record.previous,
            },
            Some(record) => {
                debug!("Rejected transition of {id}: {} -> {to}", record.previous);
                TransitionOutcome::Rejected {
                    current: record.previous,
                }
            }
        };
        Ok(outcome)
    }

    /// [`transition`](Self::transition) over many files in one statement.
    pub async fn transition_batch(
        &self,
        ids: &[Uuid],
        to: IngestState,
        options: TransitionOptions,
    ) -> Result<BatchTransition> {
        if ids.is_empty() {
            return Ok(BatchTransition::default());
        }
        let guard = Self::guard_for(to, &options);
        let update = Self::update_for(to, options);
        let records = with_timeout(
            "batch transition",
            self.store_timeout,
            self.store.apply_transition(ids, &guard, &update),
        )
        .await?;
        let batch = BatchTransition::from_records(ids, records);
        if !batch.rejected.is_empty() {
            debug!(
                "Batch transition to {to}: {} applied, {} rejected",
                batch.applied.len(),
                batch.rejected.len()
            );
        }
        Ok(batch)
    }

    /// Move a file to `error`, passing through whatever intermediate state
    /// the table requires from where it currently is.
    pub async fn fail(
        &self,
        id: Uuid,
        stage: ErrorStage,
        message: impl Into<String>,
    ) -> Result<TransitionOutcome> {
        let message = message.into();
        let Some(file) = self.get_file(id).await? else {
            return Ok(TransitionOutcome::Missing);
        };
        warn!("Failing {} at {stage}: {message}", file.path);

        let mut current = file.state;
        for step in error_route(current) {
            let outcome = self
                .transition(id, *step, TransitionOptions::default().expecting(&[current]))
                .await?;
            if !outcome.applied() {
                return Ok(outcome);
            }
            current = *step;
        }
        self.transition(
            id,
            IngestState::Error,
            TransitionOptions::default()
                .with_error(stage, message)
                .expecting(&[current]),
        )
        .await
    }

    /// [`fail`](Self::fail) for several files with the same cause.
    pub async fn fail_batch(
        &self,
        ids: &[Uuid],
        stage: ErrorStage,
        message: &str,
    ) -> Result<Vec<TransitionOutcome>> {
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            outcomes.push(self.fail(*id, stage, message).await?);
        }
        Ok(outcomes)
    }

    /// Create the file in `discovered`, or reset a settled one.
    pub async fn mark_discovered(&self, path: &str, project_id: &str) -> Result<DiscoverOutcome> {
        let identity = FileIdentity {
            id: file_id(project_id, path),
            path: path.to_string(),
            project_id: project_id.to_string(),
        };
        let outcome = with_timeout(
            "mark discovered",
            self.store_timeout,
            self.store
                .upsert_discovered(&identity, &RESETTABLE_ON_DISCOVER, Utc::now()),
        )
        .await?;
        match &outcome {
            DiscoverOutcome::Created(_) => debug!("Discovered {path}"),
            DiscoverOutcome::Reset { previous, .. } => debug!("Rediscovered {path} (was {previous})"),
            DiscoverOutcome::Unchanged(file) => {
                debug!("Left {path} alone, currently {}", file.state);
            }
        }
        Ok(outcome)
    }

    /// Create a `mentioned` placeholder file unless one exists. Returns the
    /// current record and whether it was created.
    pub async fn mark_mentioned(&self, path: &str, project_id: &str) -> Result<(FileRecord, bool)> {
        let identity = FileIdentity {
            id: file_id(project_id, path),
            path: path.to_string(),
            project_id: project_id.to_string(),
        };
        with_timeout(
            "mark mentioned",
            self.store_timeout,
            self.store
                .create_file_if_absent(&identity, IngestState::Mentioned, Utc::now()),
        )
        .await
    }

    /// Force files stuck in a transient state for longer than `threshold`
    /// back to `discovered`. Returns the ids that were reset.
    pub async fn reset_stuck_files(&self, threshold: Duration) -> Result<Vec<Uuid>> {
        let Some(cutoff) = TimeDelta::from_std(threshold)
            .ok()
            .and_then(|delta| Utc::now().checked_sub_signed(delta))
        else {
            return Ok(Vec::new());
        };

        let stuck = with_timeout(
            "find stuck files",
            self.store_timeout,
            self.store
                .files_in_states(&IngestState::TRANSIENT, Some(cutoff), usize::MAX),
        )
        .await?;
        if stuck.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = stuck.iter().map(|f| f.id).collect();

        let options = TransitionOptions {
            expected_from: Some(IngestState::TRANSIENT.to_vec()),
            updated_before: Some(cutoff),
            ..Default::default()
        };
        let batch = self
            .transition_batch(&ids, IngestState::Discovered, options)
            .await?;
        if !batch.applied.is_empty() {
            info!("Reset {} stuck files to discovered", batch.applied.len());
        }
        Ok(batch.applied)
    }

    /// Files in `error` below the retry ceiling, fewest retries first.
    pub async fn get_retryable_files(&self, max_retries: u32, limit: usize) -> Result<Vec<FileRecord>> {
        with_timeout(
            "retryable files",
            self.store_timeout,
            self.store.retryable_files(max_retries, limit),
        )
        .await
    }

    /// Files in `state`, oldest state change first.
    pub async fn files_in_state(&self, state: IngestState, limit: usize) -> Result<Vec<FileRecord>> {
        with_timeout(
            "files in state",
            self.store_timeout,
            self.store.files_in_states(&[state], None, limit),
        )
        .await
    }

    pub async fn get_file(&self, id: Uuid) -> Result<Option<FileRecord>> {
        with_timeout("get file", self.store_timeout, self.store.get_file(id)).await
    }

    pub async fn get_file_by_path(&self, project_id: &str, path: &str) -> Result<Option<FileRecord>> {
        with_timeout(
            "get file by path",
            self.store_timeout,
            self.store.get_file_by_path(project_id, path),
        )
        .await
    }

    async fn state_counts(&self, project_id: Option<&str>) -> Result<BTreeMap<IngestState, u64>> {
        with_timeout(
            "state counts",
            self.store_timeout,
            self.store.state_counts(project_id),
        )
        .await
    }

    pub async fn get_state_stats(&self, project_id: Option<&str>) -> Result<StateStats> {
        let counts = self.state_counts(project_id).await?;
        let total = counts.values().sum();
        Ok(StateStats { counts, total })
    }

    pub async fn get_progress(&self, project_id: Option<&str>) -> Result<Progress> {
        let counts = self.state_counts(project_id).await?;
        Ok(Progress::from_counts(&counts))
    }
}
