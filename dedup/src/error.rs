//! Error types for entity deduplication.

use ragforge_embeddings::EmbeddingError;
use thiserror::Error;

use crate::deduplicator::DedupStrategy;

/// Result type alias for deduplication.
pub type Result<T> = std::result::Result<T, DedupError>;

/// Errors that can occur while deduplicating entities.
#[derive(Error, Debug)]
pub enum DedupError {
    /// The strategy needs an embedding provider and none was injected.
    #[error("strategy {0:?} requires an embedding provider")]
    MissingEmbedder(DedupStrategy),

    /// The LLM strategy was selected without a resolver.
    #[error("llm strategy requires a resolver")]
    MissingResolver,

    /// The resolver failed or answered inconsistently.
    #[error("llm resolver error: {0}")]
    Resolver(String),

    /// A threshold outside `[0, 1]`.
    #[error("invalid threshold {name}: {value}")]
    InvalidThreshold { name: &'static str, value: f64 },

    #[error("embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
}
