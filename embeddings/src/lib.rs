//! # Embeddings
//!
//! This crate provides embedding generation and similarity for the ingestion
//! engine and the entity deduplicator.
//!
//! ## Features
//!
//! - **Embedding Generation**: Convert text to dense vectors through a provider
//! - **Similarity**: Cosine similarity with dimension checks
//! - **Caching**: Content-hash keyed cache in front of any provider
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Embeddings System                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  CachedProvider ──► EmbeddingProvider ──► Embedding             │
//! │       │                    │                  │                 │
//! │       ▼                    ▼                  ▼                 │
//! │  EmbeddingCache     HashingProvider    cosine_similarity        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod error;
pub mod provider;
pub mod similarity;

pub use cache::{CacheStats, CachedProvider, EmbeddingCache};
pub use error::{EmbeddingError, Result};
pub use provider::{EmbeddingProvider, HashingProvider, validate_batch};
pub use similarity::{cosine_similarity, normalize};

/// A dense vector embedding.
pub type Embedding = Vec<f32>;
