//! The continuous worker that drains the ingestion queues.
//!
//! One iteration runs three phases in order: discovered files are parsed
//! and linked, linked files are enriched, then individually re-parsed nodes
//! of embedded files are enriched. Iterations never overlap. Between
//! iterations the loop sleeps for a short busy interval after work, or a
//! growing idle interval otherwise; [`ProcessingLoop::trigger_processing`]
//! cuts the sleep short.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use ragforge_graph_store::IngestState;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::LoopConfig;
use crate::enrichment::{EnrichOutcome, EnrichmentPipeline};
use crate::error::{IngestError, Result};
use crate::processor::BatchIngestionProcessor;
use crate::state_machine::StateMachine;

/// Delay policy between iterations.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    busy: Duration,
    idle: Duration,
    max_idle: Duration,
    factor: f64,
    idle_streak: u32,
}

impl Backoff {
    pub fn new(busy: Duration, idle: Duration, max_idle: Duration, factor: f64) -> Self {
        Self {
            busy,
            idle,
            max_idle,
            factor: factor.max(1.0),
            idle_streak: 0,
        }
    }

    pub fn from_config(config: &LoopConfig) -> Self {
        Self::new(
            config.busy_interval(),
            config.idle_interval(),
            config.max_idle_interval(),
            config.backoff_factor,
        )
    }

    /// Delay after an iteration that did work.
    pub fn after_work(&mut self) -> Duration {
        self.idle_streak = 0;
        self.busy
    }

    /// Delay after an idle iteration: `idle * factor^streak`, capped.
    pub fn after_idle(&mut self) -> Duration {
        let exponent = i32::try_from(self.idle_streak).unwrap_or(i32::MAX);
        let scaled = self.idle.as_secs_f64() * self.factor.powi(exponent);
        self.idle_streak = self.idle_streak.saturating_add(1);
        if scaled.is_finite() && scaled < self.max_idle.as_secs_f64() {
            Duration::from_secs_f64(scaled)
        } else {
            self.max_idle
        }
    }

    /// Delay after a failed iteration.
    pub fn after_error(&mut self) -> Duration {
        self.idle_streak = self.idle_streak.saturating_add(1);
        self.max_idle
    }

    pub fn reset(&mut self) {
        self.idle_streak = 0;
    }
}

/// Counts from one iteration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IterationReport {
    pub files_processed: usize,
    pub files_failed: usize,
    pub files_enriched: usize,
    pub nodes_enriched: usize,
    pub elapsed_ms: u64,
}

impl IterationReport {
    pub fn did_work(&self) -> bool {
        self.files_processed + self.files_failed + self.files_enriched + self.nodes_enriched > 0
    }
}

/// Result of the startup recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Files reset from a stuck transient state.
    pub reset: usize,

    /// Errored files sent through processing again.
    pub retried: usize,
}

/// Published after every iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopStatus {
    pub running: bool,
    pub iterations: u64,
    pub consecutive_errors: u32,
    pub last: Option<IterationReport>,
    pub last_error: Option<String>,
}

/// Clears the in-flight flag when an iteration ends, even by panic.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct LoopInner {
    processor: BatchIngestionProcessor,
    enrichment: Option<EnrichmentPipeline>,
    config: LoopConfig,
    trigger: Notify,
    processing: AtomicBool,
    status: watch::Sender<LoopStatus>,
    worker: Mutex<Option<Worker>>,
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Schedules ingestion iterations until stopped.
#[derive(Clone)]
pub struct ProcessingLoop {
    inner: Arc<LoopInner>,
}

impl ProcessingLoop {
    /// `enrichment` drains linked files; without it they stay linked.
    pub fn new(
        processor: BatchIngestionProcessor,
        enrichment: Option<EnrichmentPipeline>,
        config: LoopConfig,
    ) -> Self {
        let (status, _) = watch::channel(LoopStatus::default());
        Self {
            inner: Arc::new(LoopInner {
                processor,
                enrichment,
                config,
                trigger: Notify::new(),
                processing: AtomicBool::new(false),
                status,
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn machine(&self) -> &StateMachine {
        self.inner.processor.machine()
    }

    pub fn processor(&self) -> &BatchIngestionProcessor {
        &self.inner.processor
    }

    pub fn config(&self) -> &LoopConfig {
        &self.inner.config
    }

    /// Watch the status published after every iteration.
    pub fn subscribe(&self) -> watch::Receiver<LoopStatus> {
        self.inner.status.subscribe()
    }

    pub fn status(&self) -> LoopStatus {
        self.inner.status.borrow().clone()
    }

    pub async fn is_running(&self) -> bool {
        self.inner
            .worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Spawn the loop on the current runtime.
    pub async fn start(&self) -> Result<()> {
        let mut worker = self.inner.worker.lock().await;
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Err(IngestError::AlreadyRunning);
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run(self.inner.clone(), cancel.clone()));
        *worker = Some(Worker { cancel, handle });
        self.inner.status.send_modify(|s| s.running = true);
        info!("Processing loop started");
        Ok(())
    }

    /// Run the next iteration now instead of after the pending delay.
    pub fn trigger_processing(&self) {
        self.inner.trigger.notify_one();
    }

    /// Stop scheduling and wait up to the grace period for the in-flight
    /// iteration. Returns `false` when the grace period ran out and the
    /// iteration was abandoned; stuck files are picked up by the next
    /// recovery pass.
    pub async fn stop(&self) -> bool {
        let Some(Worker { cancel, mut handle }) = self.inner.worker.lock().await.take() else {
            return true;
        };
        cancel.cancel();
        let grace = self.inner.config.stop_grace();
        let graceful = match tokio::time::timeout(grace, &mut handle).await {
            Ok(joined) => {
                if let Err(e) = joined {
                    warn!("Processing loop ended abnormally: {e}");
                }
                true
            }
            Err(_) => {
                warn!("Processing loop did not stop within {grace:?}; abandoning iteration");
                handle.abort();
                false
            }
        };
        self.inner.status.send_modify(|s| s.running = false);
        info!("Processing loop stopped");
        graceful
    }

    /// Abort the loop without waiting.
    pub async fn force_stop(&self) {
        if let Some(worker) = self.inner.worker.lock().await.take() {
            worker.cancel.cancel();
            worker.handle.abort();
            self.inner.status.send_modify(|s| s.running = false);
            warn!("Processing loop force-stopped");
        }
    }

    /// Run one iteration in the caller's task. Returns `None` when another
    /// iteration is already in flight.
    pub async fn run_iteration(&self) -> Result<Option<IterationReport>> {
        self.inner.guarded_iteration().await
    }

    /// Reset stuck files and retry errored ones below the retry ceiling.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.inner.recover().await
    }
}

impl LoopInner {
    async fn guarded_iteration(&self) -> Result<Option<IterationReport>> {
        let Some(_guard) = ProcessingGuard::acquire(&self.processing) else {
            debug!("Iteration already in flight");
            return Ok(None);
        };
        self.iteration().await.map(Some)
    }

    async fn iteration(&self) -> Result<IterationReport> {
        let started = Instant::now();
        let limit = self.config.effective_batch_size();
        let machine = self.processor.machine();
        let mut report = IterationReport::default();

        let discovered = machine.files_in_state(IngestState::Discovered, limit).await?;
        if !discovered.is_empty() {
            let batch = self.processor.process_batch_files(discovered).await?;
            report.files_processed = batch.linked();
            report.files_failed = batch.failed();
        }

        if let Some(enrichment) = &self.enrichment {
            let linked = machine.files_in_state(IngestState::Linked, limit).await?;
            if !linked.is_empty() {
                for (_, outcome) in enrichment.enrich_files(&linked).await? {
                    match outcome {
                        EnrichOutcome::Embedded { .. } | EnrichOutcome::AlreadyEmbedded => {
                            report.files_enriched += 1;
                        }
                        EnrichOutcome::Failed { .. } => report.files_failed += 1,
                        EnrichOutcome::Skipped { .. } => {}
                    }
                }
            }
            report.nodes_enriched = enrichment.enrich_linked_nodes(limit).await?;
        }

        report.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        Ok(report)
    }

    async fn recover(&self) -> Result<RecoveryReport> {
        let machine = self.processor.machine();
        let reset = machine
            .reset_stuck_files(self.config.stuck_threshold())
            .await?
            .len();
        let retryable = machine
            .get_retryable_files(self.config.max_retries, self.config.effective_batch_size())
            .await?;
        let retried = retryable.len();
        if retried > 0 {
            self.processor.process_batch_files(retryable).await?;
        }
        if reset + retried > 0 {
            info!("Recovery: reset {reset} stuck files, retried {retried} errored files");
        }
        Ok(RecoveryReport { reset, retried })
    }

    fn publish(&self, outcome: &Result<Option<IterationReport>>) {
        self.status.send_modify(|status| {
            status.iterations += 1;
            match outcome {
                Ok(report) => {
                    status.consecutive_errors = 0;
                    status.last_error = None;
                    if let Some(report) = report {
                        status.last = Some(*report);
                    }
                }
                Err(e) => {
                    status.consecutive_errors = status.consecutive_errors.saturating_add(1);
                    status.last_error = Some(e.to_string());
                }
            }
        });
    }
}

async fn run(inner: Arc<LoopInner>, cancel: CancellationToken) {
    if inner.config.recover_on_start {
        match AssertUnwindSafe(inner.recover()).catch_unwind().await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => error!("Recovery pass failed: {e}"),
            Err(_) => error!("Recovery pass panicked"),
        }
    }

    let mut backoff = Backoff::from_config(&inner.config);
    while !cancel.is_cancelled() {
        let outcome = match AssertUnwindSafe(inner.guarded_iteration()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(IngestError::Panicked("iteration")),
        };
        let delay = match &outcome {
            Ok(Some(report)) if report.did_work() => {
                info!(
                    "Iteration: {} files processed, {} failed, {} enriched, {} nodes in {}ms",
                    report.files_processed,
                    report.files_failed,
                    report.files_enriched,
                    report.nodes_enriched,
                    report.elapsed_ms
                );
                backoff.after_work()
            }
            Ok(Some(_)) => {
                let delay = backoff.after_idle();
                debug!("Idle, next iteration in {delay:?}");
                delay
            }
            Ok(None) => backoff.after_work(),
            Err(e) => {
                error!("Iteration failed: {e}");
                backoff.after_error()
            }
        };
        inner.publish(&outcome);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = inner.trigger.notified() => backoff.reset(),
            _ = tokio::time::sleep(delay) => {}
        }
    }
    debug!("Processing loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnrichmentConfig, ProcessorConfig};
    use crate::parser::MarkdownParser;
    use crate::source::VirtualSource;
    use pretty_assertions::assert_eq;
    use ragforge_graph_store::{ContentStore, MemoryStore};

    fn build(config: LoopConfig) -> (Arc<MemoryStore>, Arc<VirtualSource>, ProcessingLoop) {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(VirtualSource::new());
        let machine = StateMachine::new(store.clone());
        let processor = BatchIngestionProcessor::new(
            machine.clone(),
            source.clone(),
            Arc::new(MarkdownParser),
            ProcessorConfig::default(),
        );
        let pipeline = EnrichmentPipeline::new(machine, EnrichmentConfig::default());
        let processing = ProcessingLoop::new(processor, Some(pipeline), config);
        (store, source, processing)
    }

    fn quiet() -> LoopConfig {
        LoopConfig::default()
            .with_intervals(
                Duration::from_millis(10),
                Duration::from_secs(3600),
                Duration::from_secs(3600),
            )
            .with_stop_grace(Duration::from_secs(5))
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_secs(1),
            Duration::from_secs(3),
            1.5,
        );
        assert_eq!(backoff.after_idle(), Duration::from_secs(1));
        assert_eq!(backoff.after_idle(), Duration::from_millis(1500));
        assert_eq!(backoff.after_idle(), Duration::from_millis(2250));
        assert_eq!(backoff.after_idle(), Duration::from_secs(3));
        assert_eq!(backoff.after_work(), Duration::from_millis(100));
        assert_eq!(backoff.after_idle(), Duration::from_secs(1));
        assert_eq!(backoff.after_error(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_iteration_drains_both_queues() {
        let (store, source, processing) = build(quiet());
        source.insert("/a.md", "# A\nalpha\n").await;
        let id = processing.machine().mark_discovered("/a.md", "p").await.unwrap().file().id;

        let report = processing.run_iteration().await.unwrap().unwrap();
        assert_eq!(report.files_processed, 1);
        assert_eq!(report.files_enriched, 1);
        assert_eq!(
            store.get_file(id).await.unwrap().unwrap().state,
            IngestState::Embedded
        );

        let idle = processing.run_iteration().await.unwrap().unwrap();
        assert!(!idle.did_work());
    }

    #[tokio::test]
    async fn test_iterations_never_overlap() {
        let (_store, _source, processing) = build(quiet());
        let guard = ProcessingGuard::acquire(&processing.inner.processing);
        assert!(guard.is_some());
        assert_eq!(processing.run_iteration().await.unwrap(), None);
        drop(guard);
        assert!(processing.run_iteration().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recover_resets_and_retries() {
        let (store, source, processing) = build(quiet().with_stuck_threshold(Duration::ZERO));
        source.insert("/a.md", "# A\n").await;
        source.insert("/b.md", "# B\n").await;
        let machine = processing.machine().clone();
        let a = machine.mark_discovered("/a.md", "p").await.unwrap().file().id;
        let b = machine.mark_discovered("/b.md", "p").await.unwrap().file().id;
        machine
            .transition(a, IngestState::Parsing, Default::default())
            .await
            .unwrap();
        machine
            .fail(b, ragforge_graph_store::ErrorStage::Parse, "boom")
            .await
            .unwrap();

        let report = processing.recover().await.unwrap();
        assert_eq!(report, RecoveryReport { reset: 1, retried: 1 });
        assert_eq!(
            store.get_file(a).await.unwrap().unwrap().state,
            IngestState::Discovered
        );
        assert_eq!(
            store.get_file(b).await.unwrap().unwrap().state,
            IngestState::Linked
        );
    }

    #[tokio::test]
    async fn test_trigger_wakes_idle_loop() {
        let (store, source, processing) = build(quiet().with_recover_on_start(false));
        processing.start().await.unwrap();
        assert!(matches!(processing.start().await, Err(IngestError::AlreadyRunning)));

        let mut status = processing.subscribe();
        tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.iterations >= 1))
            .await
            .unwrap()
            .unwrap();

        source.insert("/a.md", "# A\n").await;
        let id = processing.machine().mark_discovered("/a.md", "p").await.unwrap().file().id;
        processing.trigger_processing();

        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| s.last.is_some_and(|r| r.files_enriched == 1)),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(
            store.get_file(id).await.unwrap().unwrap().state,
            IngestState::Embedded
        );

        assert!(processing.stop().await);
        assert!(!processing.is_running().await);
        assert!(!processing.status().running);
    }
}
