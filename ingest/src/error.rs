//! Error types for the ingestion core.

use std::time::Duration;

use ragforge_dedup::DedupError;
use ragforge_embeddings::EmbeddingError;
use ragforge_graph_store::{ErrorStage, IngestState, StoreError};
use thiserror::Error;

/// Result type alias for ingestion operations.
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors raised by a [`ContentSource`](crate::source::ContentSource).
#[derive(Error, Debug)]
pub enum SourceError {
    /// The source no longer exists.
    #[error("source not found: {0}")]
    NotFound(String),

    /// Reading the source failed.
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The bytes are not valid UTF-8 text.
    #[error("source is not valid UTF-8: {0}")]
    InvalidEncoding(String),
}

impl SourceError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors that can occur while ingesting content.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Storage operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Reading content failed.
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// The parser rejected the content.
    #[error("parse error: {0}")]
    Parse(String),

    /// Reference extraction or resolution failed.
    #[error("reference error: {0}")]
    References(String),

    /// Entity extraction failed.
    #[error("entity extraction error: {0}")]
    Entities(String),

    #[error("deduplication error: {0}")]
    Dedup(#[from] DedupError),

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    /// An external call exceeded its deadline.
    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    /// The file is not in a state the operation can start from.
    #[error("file {path} is {state}, cannot {operation}")]
    InvalidState {
        path: String,
        state: IngestState,
        operation: &'static str,
    },

    /// The processing loop is already running.
    #[error("processing loop already running")]
    AlreadyRunning,

    #[error("{0} panicked")]
    Panicked(&'static str),
}

impl IngestError {
    /// Stage recorded on the file when this error fails it.
    pub fn stage(&self) -> ErrorStage {
        match self {
            Self::References(_) => ErrorStage::Relations,
            Self::Entities(_) | Self::Dedup(_) => ErrorStage::Entities,
            Self::Embedding(_) => ErrorStage::Embed,
            _ => ErrorStage::Parse,
        }
    }
}
