//! Integration tests for the ingestion engine on a real directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use ragforge_engine::{
    DirectoryConfig, EngineConfig, EngineError, HashingProvider, IngestState, IngestionEngine,
    LoopConfig, MemoryStore, WatchConfig,
};
use tempfile::TempDir;

const PROJECT: &str = "docs";

fn config(root: &Path, watch: bool) -> EngineConfig {
    EngineConfig::default()
        .with_directory(PROJECT, DirectoryConfig::new(root).with_extensions(["md"]))
        .with_loop(
            LoopConfig::default()
                .with_recover_on_start(false)
                .with_intervals(
                    Duration::from_millis(10),
                    Duration::from_millis(20),
                    Duration::from_millis(50),
                ),
        )
        .with_watch(
            WatchConfig::default()
                .with_enabled(watch)
                .with_debounce(Duration::from_millis(10)),
        )
}

fn canonical(root: &TempDir, name: &str) -> String {
    root.path()
        .canonicalize()
        .unwrap()
        .join(name)
        .to_string_lossy()
        .into_owned()
}

async fn state_of(engine: &IngestionEngine, path: &str) -> Option<IngestState> {
    engine
        .machine()
        .get_file_by_path(PROJECT, path)
        .await
        .unwrap()
        .map(|f| f.state)
}

async fn wait_for_state(engine: &IngestionEngine, path: &str, expected: Option<IngestState>) {
    let reached = tokio::time::timeout(Duration::from_secs(10), async {
        while state_of(engine, path).await != expected {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(
        reached.is_ok(),
        "{path} never reached {expected:?}, last {:?}",
        state_of(engine, path).await
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_scan_processes_existing_files() {
    let root = TempDir::new().unwrap();
    std::fs::write(root.path().join("guide.md"), "# Guide\nIntro\n\n## Setup\nSteps\n").unwrap();
    std::fs::write(root.path().join("notes.txt"), "not markdown").unwrap();

    let store = Arc::new(MemoryStore::new());
    let engine = IngestionEngine::builder(config(root.path(), false))
        .with_store(store.clone())
        .with_embedder(Arc::new(HashingProvider::new(32)))
        .build()
        .unwrap();

    let report = engine.start().await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.discovered, 1);
    assert!(matches!(engine.start().await, Err(EngineError::AlreadyRunning)));

    let guide = canonical(&root, "guide.md");
    wait_for_state(&engine, &guide, Some(IngestState::Embedded)).await;

    let sections = store.nodes_with_label("Section").await;
    assert_eq!(sections.len(), 2);
    for section in &sections {
        assert_eq!(section.state, Some(IngestState::Embedded));
        assert_eq!(store.embedding(section.uuid).await.as_ref().map(Vec::len), Some(32));
    }

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.states.count(IngestState::Embedded), 1);
    assert_eq!(stats.progress.completed, 1);
    assert_eq!(stats.watched_directories, 1);
    assert!(!stats.watching);

    // An edit picked up through an explicit discover.
    std::fs::write(root.path().join("guide.md"), "# Guide\nRewritten\n").unwrap();
    assert!(engine.discover(PROJECT, &guide).await.unwrap());
    wait_for_state(&engine, &guide, Some(IngestState::Embedded)).await;
    assert_eq!(store.nodes_with_label("Section").await.len(), 1);

    assert!(engine.stop().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_events_drive_ingestion() {
    let root = TempDir::new().unwrap();
    let engine = IngestionEngine::builder(config(root.path(), true))
        .build()
        .unwrap();

    let report = engine.start().await.unwrap();
    assert_eq!(report.scanned, 0);
    assert!(engine.stats().await.unwrap().watching);

    let page = canonical(&root, "page.md");
    std::fs::write(&page, "# Page\nHello\n").unwrap();
    wait_for_state(&engine, &page, Some(IngestState::Embedded)).await;

    std::fs::remove_file(&page).unwrap();
    wait_for_state(&engine, &page, None).await;

    assert!(engine.stop().await);
    assert!(!engine.stats().await.unwrap().watching);
}
