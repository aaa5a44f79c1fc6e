//! # Ingestion Engine
//!
//! This crate wires the ingestion pipeline to the file system:
//!
//! - **Directory Watcher**: Initial scan and change events per project
//! - **Ingest**: State machine, batch processor and enrichment
//! - **Processing Loop**: Drains the queues with adaptive backoff
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       IngestionEngine                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  scan_directory ──┐                                             │
//! │                   ├──► markDiscovered ──► trigger ──┐           │
//! │  DirectoryWatcher ┘          │                      ▼           │
//! │       │ (deleted)            ▼               ProcessingLoop     │
//! │       └──────────► remove_path          processor + enrichment  │
//! │                                                                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ragforge_engine::{EngineConfig, IngestionEngine};
//!
//! let config = EngineConfig::load("ragforge.toml")?;
//! let engine = IngestionEngine::builder(config)
//!     .with_embedder(Arc::new(HashingProvider::default()))
//!     .build()?;
//!
//! engine.start().await?;
//! let stats = engine.stats().await?;
//! engine.stop().await;
//! ```

pub mod config;
pub mod engine;
pub mod error;

pub use config::{EngineConfig, WatchConfig, WatchedDirectory};
pub use engine::{EngineStats, IngestionEngine, IngestionEngineBuilder, StartReport};
pub use error::{EngineError, Result};

// Re-export from dependencies for convenience
pub use ragforge_directory_watcher::{DirectoryConfig, FileEvent, FileEventKind};
pub use ragforge_embeddings::{EmbeddingProvider, HashingProvider};
pub use ragforge_graph_store::{ContentStore, IngestState, MemoryStore};
pub use ragforge_ingest::{LoopConfig, ProcessorConfig, StateMachine};
