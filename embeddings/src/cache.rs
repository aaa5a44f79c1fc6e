//! Embedding cache keyed by content hash.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::Embedding;
use crate::error::Result;
use crate::provider::{EmbeddingProvider, validate_batch};

#[derive(Debug, Clone)]
struct CacheEntry {
    embedding: Embedding,

    /// Insertion tick, used for eviction.
    inserted: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    tick: u64,
    hits: u64,
    misses: u64,
}

/// Bounded in-memory cache for embeddings to avoid redundant provider calls.
///
/// Keys are the SHA-256 of model and text, so identical content embedded by
/// the same model is computed once.
#[derive(Debug)]
pub struct EmbeddingCache {
    state: RwLock<CacheState>,
    max_entries: usize,
}

impl EmbeddingCache {
    /// Create a cache holding at most `max_entries` vectors.
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            max_entries: max_entries.max(1),
        }
    }

    /// Compute the lookup key for a text.
    pub fn hash_key(text: &str, model: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(text.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Get an embedding from the cache.
    pub async fn get(&self, text: &str, model: &str) -> Option<Embedding> {
        let key = Self::hash_key(text, model);
        let mut state = self.state.write().await;
        match state.entries.get(&key).map(|e| e.embedding.clone()) {
            Some(embedding) => {
                state.hits += 1;
                Some(embedding)
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Put an embedding in the cache, evicting the oldest entry at capacity.
    pub async fn put(&self, text: &str, model: &str, embedding: Embedding) {
        let key = Self::hash_key(text, model);
        let mut state = self.state.write().await;

        if state.entries.len() >= self.max_entries
            && !state.entries.contains_key(&key)
            && let Some(oldest) = state
                .entries
                .iter()
                .min_by_key(|(_, e)| e.inserted)
                .map(|(k, _)| k.clone())
        {
            state.entries.remove(&oldest);
        }

        state.tick += 1;
        let inserted = state.tick;
        state.entries.insert(key, CacheEntry { embedding, inserted });
    }

    /// Clear the entire cache.
    pub async fn clear(&self) {
        self.state.write().await.entries.clear();
        info!("Cleared embedding cache");
    }

    /// Get cache statistics.
    pub async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        CacheStats {
            entries: state.entries.len(),
            max_entries: self.max_entries,
            hits: state.hits,
            misses: state.misses,
        }
    }
}

/// Statistics about the embedding cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of entries in cache.
    pub entries: usize,

    /// Maximum cache size.
    pub max_entries: usize,

    pub hits: u64,
    pub misses: u64,
}

/// A provider decorator that serves repeated texts from an [`EmbeddingCache`].
pub struct CachedProvider<P> {
    provider: P,
    cache: EmbeddingCache,
}

impl<P> CachedProvider<P>
where
    P: EmbeddingProvider,
{
    /// Create a new cached provider.
    pub fn new(provider: P, cache: EmbeddingCache) -> Self {
        Self { provider, cache }
    }

    /// Get the underlying cache.
    pub fn cache(&self) -> &EmbeddingCache {
        &self.cache
    }
}

#[async_trait]
impl<P> EmbeddingProvider for CachedProvider<P>
where
    P: EmbeddingProvider,
{
    fn name(&self) -> &str {
        self.provider.name()
    }

    fn model(&self) -> &str {
        self.provider.model()
    }

    fn dimension(&self) -> usize {
        self.provider.dimension()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        let model = self.provider.model();
        let mut vectors: Vec<Option<Embedding>> = Vec::with_capacity(texts.len());
        let mut missing = Vec::new();
        for (i, text) in texts.iter().enumerate() {
            let cached = self.cache.get(text, model).await;
            if cached.is_none() {
                missing.push(i);
            }
            vectors.push(cached);
        }

        if !missing.is_empty() {
            debug!(
                "Embedding cache miss for {} of {} texts",
                missing.len(),
                texts.len()
            );
            let inputs: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            let fresh = self.provider.embed_batch(&inputs).await?;
            validate_batch(&self.provider, inputs.len(), &fresh)?;
            for (i, embedding) in missing.into_iter().zip(fresh) {
                self.cache.put(&texts[i], model, embedding.clone()).await;
                vectors[i] = Some(embedding);
            }
        }

        Ok(vectors.into_iter().flatten().collect())
    }
}
