//! Error types for the ingestion engine.

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the ingestion engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Ingestion pipeline error.
    #[error("ingest error: {0}")]
    Ingest(#[from] ragforge_ingest::IngestError),

    /// Content store error.
    #[error("store error: {0}")]
    Store(#[from] ragforge_graph_store::StoreError),

    /// Directory watcher error.
    #[error("watcher error: {0}")]
    Watcher(#[from] ragforge_directory_watcher::WatcherError),

    /// Malformed configuration file.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("engine already running")]
    AlreadyRunning,

    /// A blocking scan task panicked or was cancelled.
    #[error("task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
