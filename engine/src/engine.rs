//! Ingestion engine implementation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use ragforge_directory_watcher::{
    DirectoryConfig, DirectoryWatcher, FileEvent, coalesce, scan_directory,
};
use ragforge_embeddings::{CachedProvider, EmbeddingCache, EmbeddingProvider};
use ragforge_graph_store::{ContentStore, IngestState, MemoryStore};
use ragforge_ingest::{
    BatchIngestionProcessor, CompositeParser, ContentSource, DiskSource, EnrichmentPipeline,
    EntityExtractor, ExtractorRegistry, ImportExtractor, IngestHooks, IterationReport,
    LoopStatus, MarkdownParser, Parser, ProcessingLoop, Progress, ReferenceExtractor,
    StateMachine, StateStats,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{EngineConfig, WatchConfig};
use crate::error::{EngineError, Result};

/// Incremental ingestion engine.
///
/// Owns the whole pipeline for a set of directories:
/// - the state machine over a [`ContentStore`]
/// - the batch processor and enrichment pipeline, driven by a [`ProcessingLoop`]
/// - a [`DirectoryWatcher`] whose events are pumped into the state machine
pub struct IngestionEngine {
    config: EngineConfig,
    machine: StateMachine,
    processor: BatchIngestionProcessor,
    processing: ProcessingLoop,
    watcher: Mutex<Option<DirectoryWatcher>>,
    pump: Mutex<Option<Pump>>,
}

struct Pump {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// What [`IngestionEngine::start`] found on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartReport {
    /// Files the initial scan accepted.
    pub scanned: usize,

    /// Scanned files that were queued for processing.
    pub discovered: usize,
}

/// Statistics about the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub states: StateStats,
    pub progress: Progress,
    pub processing: LoopStatus,

    /// Number of configured directories.
    pub watched_directories: usize,

    /// Whether file system events are being pumped.
    pub watching: bool,
}

impl IngestionEngine {
    /// Create a new engine builder.
    pub fn builder(config: EngineConfig) -> IngestionEngineBuilder {
        IngestionEngineBuilder::new(config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    pub fn processor(&self) -> &BatchIngestionProcessor {
        &self.processor
    }

    pub fn processing(&self) -> &ProcessingLoop {
        &self.processing
    }

    /// Scan every configured directory, start the processing loop and, when
    /// enabled, the watcher and its event pump.
    pub async fn start(&self) -> Result<StartReport> {
        let mut pump = self.pump.lock().await;
        if pump.is_some() || self.processing.is_running().await {
            return Err(EngineError::AlreadyRunning);
        }

        let roots = Arc::new(self.resolve_roots()?);
        let mut report = StartReport::default();
        if self.config.watch.scan_on_start {
            for root in roots.iter() {
                let (scanned, discovered) = self.scan_root(root).await?;
                report.scanned += scanned;
                report.discovered += discovered;
            }
        }

        self.processing.start().await?;

        if self.config.watch.enabled && !roots.is_empty() {
            let (watcher, events) = match self.start_watcher(&roots).await {
                Ok(started) => started,
                Err(e) => {
                    self.processing.stop().await;
                    return Err(e);
                }
            };
            *self.watcher.lock().await = Some(watcher);

            let router = EventRouter {
                machine: self.machine.clone(),
                processor: self.processor.clone(),
                processing: self.processing.clone(),
                roots,
            };
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(run_pump(
                router,
                events,
                cancel.clone(),
                self.config.watch.clone(),
            ));
            *pump = Some(Pump { cancel, handle });
        }

        self.processing.trigger_processing();
        info!(
            "Ingestion engine started: {} files scanned, {} queued",
            report.scanned, report.discovered
        );
        Ok(report)
    }

    /// Stop the event pump and the watcher, then stop the loop gracefully.
    /// Returns whether the loop stopped within its grace period.
    pub async fn stop(&self) -> bool {
        if let Some(pump) = self.pump.lock().await.take() {
            pump.cancel.cancel();
            if let Err(e) = pump.handle.await {
                warn!("Event pump ended abnormally: {e}");
            }
        }
        if let Some(mut watcher) = self.watcher.lock().await.take() {
            watcher.stop().await;
        }
        let graceful = self.processing.stop().await;
        info!("Ingestion engine stopped");
        graceful
    }

    /// Queue `path` of `project_id` and wake the loop. Returns whether the
    /// file now waits in the discovered queue.
    pub async fn discover(&self, project_id: &str, path: &str) -> Result<bool> {
        let queued = discover(&self.machine, project_id, path).await?;
        if queued {
            self.processing.trigger_processing();
        }
        Ok(queued)
    }

    /// Remove `path` of `project_id` from the graph.
    pub async fn remove(&self, project_id: &str, path: &str) -> Result<bool> {
        Ok(self.processor.remove_path(project_id, path).await?)
    }

    /// Run one iteration in the caller's task. `None` when an iteration is
    /// already in flight.
    pub async fn process_pending(&self) -> Result<Option<IterationReport>> {
        Ok(self.processing.run_iteration().await?)
    }

    /// State counts and progress over every project.
    pub async fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            states: self.machine.get_state_stats(None).await?,
            progress: self.machine.get_progress(None).await?,
            processing: self.processing.status(),
            watched_directories: self.config.directories.len(),
            watching: self.pump.lock().await.is_some(),
        })
    }

    /// State counts and progress of one project.
    pub async fn project_stats(&self, project_id: &str) -> Result<(StateStats, Progress)> {
        Ok((
            self.machine.get_state_stats(Some(project_id)).await?,
            self.machine.get_progress(Some(project_id)).await?,
        ))
    }

    fn resolve_roots(&self) -> Result<Vec<ProjectRoot>> {
        self.config
            .directories
            .iter()
            .map(|entry| {
                Ok(ProjectRoot {
                    project_id: entry.project_id.clone(),
                    directory: entry.directory.clone().canonicalized()?,
                })
            })
            .collect()
    }

    async fn scan_root(&self, root: &ProjectRoot) -> Result<(usize, usize)> {
        let directory = root.directory.clone();
        let files = tokio::task::spawn_blocking(move || scan_directory(&directory)).await??;

        let mut discovered = 0;
        for file in &files {
            let path = path_string(&file.path);
            if discover(&self.machine, &root.project_id, &path).await? {
                discovered += 1;
            }
        }
        debug!(
            "Scanned {} for project {}: {} files, {discovered} queued",
            root.directory.path.display(),
            root.project_id,
            files.len()
        );
        Ok((files.len(), discovered))
    }

    async fn start_watcher(
        &self,
        roots: &[ProjectRoot],
    ) -> Result<(DirectoryWatcher, mpsc::Receiver<FileEvent>)> {
        let mut watcher = DirectoryWatcher::with_capacity(self.config.watch.event_buffer);
        for root in roots {
            watcher.add(root.directory.clone()).await?;
        }
        let events = watcher.take_events()?;
        watcher.start().await?;
        Ok((watcher, events))
    }
}

/// A configured directory with its canonical root.
#[derive(Debug, Clone)]
struct ProjectRoot {
    project_id: String,
    directory: DirectoryConfig,
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Mark `path` discovered. Returns whether it is now queued; `false` means
/// the file is in flight and the change must be retried later.
async fn discover(machine: &StateMachine, project_id: &str, path: &str) -> Result<bool> {
    let outcome = machine.mark_discovered(path, project_id).await?;
    Ok(outcome.queued() || outcome.file().state == IngestState::Discovered)
}

/// Routes watcher events to the state machine.
#[derive(Clone)]
struct EventRouter {
    machine: StateMachine,
    processor: BatchIngestionProcessor,
    processing: ProcessingLoop,
    roots: Arc<Vec<ProjectRoot>>,
}

impl EventRouter {
    fn project_of(&self, path: &Path) -> Option<&str> {
        self.roots
            .iter()
            .find(|root| root.directory.accepts(path))
            .map(|root| root.project_id.as_str())
    }

    /// Apply a coalesced batch. Upserts of in-flight files land in `deferred`.
    async fn apply(&self, events: Vec<FileEvent>, deferred: &mut BTreeMap<String, String>) {
        let mut changed = 0usize;
        for event in events {
            let Some(project_id) = self.project_of(&event.path) else {
                trace!("Ignoring event outside every project: {}", event.path.display());
                continue;
            };
            let path = path_string(&event.path);
            if event.kind.is_removal() {
                deferred.remove(&path);
                match self.processor.remove_path(project_id, &path).await {
                    Ok(true) => changed += 1,
                    Ok(false) => {}
                    Err(e) => warn!("Failed to remove {path}: {e}"),
                }
            } else if event.kind.is_upsert() {
                match discover(&self.machine, project_id, &path).await {
                    Ok(true) => changed += 1,
                    Ok(false) => {
                        debug!("{path} is in flight, deferring");
                        deferred.insert(path, project_id.to_string());
                    }
                    Err(e) => warn!("Failed to discover {path}: {e}"),
                }
            }
        }
        if changed > 0 {
            self.processing.trigger_processing();
        }
    }

    async fn retry_deferred(&self, deferred: &mut BTreeMap<String, String>) {
        let mut changed = 0usize;
        let pending = std::mem::take(deferred);
        for (path, project_id) in pending {
            match discover(&self.machine, &project_id, &path).await {
                Ok(true) => changed += 1,
                Ok(false) => {
                    deferred.insert(path, project_id);
                }
                Err(e) => warn!("Dropping deferred change of {path}: {e}"),
            }
        }
        if changed > 0 {
            self.processing.trigger_processing();
        }
    }
}

async fn run_pump(
    router: EventRouter,
    mut events: mpsc::Receiver<FileEvent>,
    cancel: CancellationToken,
    watch: WatchConfig,
) {
    let mut deferred: BTreeMap<String, String> = BTreeMap::new();
    let mut retry = tokio::time::interval(watch.deferred_retry());
    retry.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => {
                let Some(first) = event else {
                    debug!("Watcher channel closed");
                    break;
                };
                let mut batch = vec![first];
                tokio::time::sleep(watch.debounce()).await;
                while let Ok(event) = events.try_recv() {
                    batch.push(event);
                }
                router.apply(coalesce(batch), &mut deferred).await;
            }
            _ = retry.tick(), if !deferred.is_empty() => {
                router.retry_deferred(&mut deferred).await;
            }
        }
    }
    if !deferred.is_empty() {
        warn!("Event pump stopped with {} deferred changes", deferred.len());
    }
}

/// Builder for [`IngestionEngine`].
pub struct IngestionEngineBuilder {
    config: EngineConfig,
    store: Option<Arc<dyn ContentStore>>,
    source: Option<Arc<dyn ContentSource>>,
    parser: Option<Arc<dyn Parser>>,
    extractors: Option<ExtractorRegistry>,
    reference_extractors: Vec<Arc<dyn ReferenceExtractor>>,
    hooks: Option<Arc<dyn IngestHooks>>,
    entity_extractor: Option<Arc<dyn EntityExtractor>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
}

impl IngestionEngineBuilder {
    /// Create a new builder.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            store: None,
            source: None,
            parser: None,
            extractors: None,
            reference_extractors: Vec::new(),
            hooks: None,
            entity_extractor: None,
            embedder: None,
        }
    }

    /// Content store; an in-memory store by default.
    pub fn with_store(mut self, store: Arc<dyn ContentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Where file bytes come from; the local filesystem by default.
    pub fn with_source(mut self, source: Arc<dyn ContentSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Parser; Markdown only by default.
    pub fn with_parser(mut self, parser: Arc<dyn Parser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn with_node_extractors(mut self, registry: ExtractorRegistry) -> Self {
        self.extractors = Some(registry);
        self
    }

    /// Add a reference extractor. Relative ES imports are extracted when
    /// none is added.
    pub fn with_reference_extractor(mut self, extractor: Arc<dyn ReferenceExtractor>) -> Self {
        self.reference_extractors.push(extractor);
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn IngestHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn with_entity_extractor(mut self, extractor: Arc<dyn EntityExtractor>) -> Self {
        self.entity_extractor = Some(extractor);
        self
    }

    /// Embedding provider, wrapped in a cache unless
    /// `embedding_cache_entries` is 0.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Build the engine.
    pub fn build(self) -> Result<IngestionEngine> {
        self.config.validate()?;
        let config = self.config;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let machine =
            StateMachine::new(store).with_store_timeout(config.processor.store_timeout());

        let source = self.source.unwrap_or_else(|| Arc::new(DiskSource));
        let parser = self.parser.unwrap_or_else(|| {
            Arc::new(CompositeParser::new().with_parser(Arc::new(MarkdownParser)))
        });
        let mut processor =
            BatchIngestionProcessor::new(machine.clone(), source, parser, config.processor.clone());
        if let Some(registry) = self.extractors {
            processor = processor.with_extractors(registry);
        }
        let reference_extractors = if self.reference_extractors.is_empty() {
            vec![Arc::new(ImportExtractor::new()) as Arc<dyn ReferenceExtractor>]
        } else {
            self.reference_extractors
        };
        for extractor in reference_extractors {
            processor = processor.with_reference_extractor(extractor);
        }
        if let Some(hooks) = self.hooks {
            processor = processor.with_hooks(hooks);
        }

        let mut enrichment = EnrichmentPipeline::new(machine.clone(), config.enrichment.clone());
        if let Some(extractor) = self.entity_extractor {
            enrichment = enrichment.with_extractor(extractor);
        }
        if let Some(embedder) = self.embedder {
            let embedder: Arc<dyn EmbeddingProvider> = if config.embedding_cache_entries > 0 {
                Arc::new(CachedProvider::new(
                    embedder,
                    EmbeddingCache::new(config.embedding_cache_entries),
                ))
            } else {
                embedder
            };
            enrichment = enrichment.with_embedder(embedder);
        }

        let processing =
            ProcessingLoop::new(processor.clone(), Some(enrichment), config.processing.clone());

        Ok(IngestionEngine {
            config,
            machine,
            processor,
            processing,
            watcher: Mutex::new(None),
            pump: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use ragforge_directory_watcher::FileEventKind;
    use ragforge_ingest::LoopConfig;
    use std::path::PathBuf;

    fn router(machine: &StateMachine) -> EventRouter {
        let processor = BatchIngestionProcessor::new(
            machine.clone(),
            Arc::new(DiskSource),
            Arc::new(MarkdownParser),
            Default::default(),
        );
        let processing = ProcessingLoop::new(processor.clone(), None, LoopConfig::default());
        EventRouter {
            machine: machine.clone(),
            processor,
            processing,
            roots: Arc::new(vec![
                ProjectRoot {
                    project_id: "docs".to_string(),
                    directory: DirectoryConfig::new("/srv/docs").with_extensions(["md"]),
                },
                ProjectRoot {
                    project_id: "web".to_string(),
                    directory: DirectoryConfig::new("/srv/web"),
                },
            ]),
        }
    }

    #[test]
    fn test_project_routing() {
        let machine = StateMachine::new(Arc::new(MemoryStore::new()));
        let router = router(&machine);

        assert_eq!(router.project_of(Path::new("/srv/docs/a.md")), Some("docs"));
        assert_eq!(router.project_of(Path::new("/srv/docs/a.ts")), None);
        assert_eq!(router.project_of(Path::new("/srv/web/app.ts")), Some("web"));
        assert_eq!(router.project_of(Path::new("/srv/other/a.md")), None);
    }

    #[tokio::test]
    async fn test_in_flight_changes_are_deferred() {
        let machine = StateMachine::new(Arc::new(MemoryStore::new()));
        let router = router(&machine);
        let path = "/srv/docs/a.md";

        let file = machine.mark_discovered(path, "docs").await.unwrap().file().clone();
        machine
            .transition(file.id, IngestState::Parsing, Default::default())
            .await
            .unwrap();

        let mut deferred = BTreeMap::new();
        router
            .apply(
                vec![FileEvent::new(FileEventKind::Modified, PathBuf::from(path))],
                &mut deferred,
            )
            .await;
        assert_eq!(deferred.get(path).map(String::as_str), Some("docs"));

        // Once the file settles, the retry queues it again.
        machine.fail(file.id, ragforge_graph_store::ErrorStage::Parse, "boom").await.unwrap();
        router.retry_deferred(&mut deferred).await;
        assert!(deferred.is_empty());
        assert_eq!(
            machine.get_file(file.id).await.unwrap().unwrap().state,
            IngestState::Discovered
        );
    }

    #[tokio::test]
    async fn test_removal_event_deletes_file() {
        let machine = StateMachine::new(Arc::new(MemoryStore::new()));
        let router = router(&machine);
        let path = "/srv/web/app.ts";
        machine.mark_discovered(path, "web").await.unwrap();

        let mut deferred = BTreeMap::new();
        deferred.insert(path.to_string(), "web".to_string());
        router
            .apply(
                vec![FileEvent::new(FileEventKind::Deleted, PathBuf::from(path))],
                &mut deferred,
            )
            .await;

        assert!(deferred.is_empty());
        assert!(machine.get_file_by_path("web", path).await.unwrap().is_none());
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let config = EngineConfig::default()
            .with_directory("", DirectoryConfig::new("/srv/docs"));
        assert!(matches!(
            IngestionEngine::builder(config).build(),
            Err(EngineError::Config(_))
        ));
    }
}
