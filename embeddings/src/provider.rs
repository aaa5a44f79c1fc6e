//! Embedding providers.
//!
//! The [`EmbeddingProvider`] trait is the seam where remote models plug in.
//! [`HashingProvider`] is a deterministic local provider that needs no model.

use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::Embedding;
use crate::error::{EmbeddingError, Result};
use crate::similarity::normalize;

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Get the name of this provider.
    fn name(&self) -> &str;

    /// Model identifier. Cached vectors are keyed by it.
    fn model(&self) -> &str;

    /// Dimension of the vectors this provider returns.
    fn dimension(&self) -> usize;

    /// Embed every text, returning one vector per input in order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>>;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Embedding> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors.pop().ok_or_else(|| {
            EmbeddingError::InvalidResponse(format!("{} returned no vector", self.name()))
        })
    }
}

#[async_trait]
impl<P> EmbeddingProvider for Arc<P>
where
    P: EmbeddingProvider + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn model(&self) -> &str {
        (**self).model()
    }

    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        (**self).embed_batch(texts).await
    }
}

/// Check a provider response against its inputs.
pub fn validate_batch(provider: &dyn EmbeddingProvider, inputs: usize, vectors: &[Embedding]) -> Result<()> {
    if vectors.len() != inputs {
        return Err(EmbeddingError::InvalidResponse(format!(
            "{} returned {} vectors for {inputs} inputs",
            provider.name(),
            vectors.len()
        )));
    }
    let expected = provider.dimension();
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        return Err(EmbeddingError::DimensionMismatch {
            expected,
            actual: bad.len(),
        });
    }
    Ok(())
}

/// Feature-hashing embedder.
///
/// Lowercased word tokens are hashed into a fixed number of signed buckets
/// and the result is normalized to unit length. Identical texts always map
/// to identical vectors, and texts sharing words have positive similarity.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    dimension: usize,
    max_length: usize,
}

impl HashingProvider {
    /// Create a provider producing vectors of `dimension` buckets.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            max_length: 100_000,
        }
    }

    /// Reject texts longer than `max_length` characters.
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    fn embed_one(&self, text: &str) -> Result<Embedding> {
        let length = text.chars().count();
        if length > self.max_length {
            return Err(EmbeddingError::TextTooLong {
                length,
                max_length: self.max_length,
            });
        }

        let mut vector = vec![0.0f32; self.dimension];
        let tokens = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(str::to_lowercase);
        for token in tokens {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimension as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }
        normalize(&mut vector);
        Ok(vector)
    }
}

impl Default for HashingProvider {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl EmbeddingProvider for HashingProvider {
    fn name(&self) -> &str {
        "hashing"
    }

    fn model(&self) -> &str {
        "feature-hash-v1"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>> {
        debug!("Hashing {} texts into {} buckets", texts.len(), self.dimension);
        texts.iter().map(|text| self.embed_one(text)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::similarity::cosine_similarity;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_hashing_is_deterministic() {
        let provider = HashingProvider::new(64);
        let a = provider.embed("parse the graph").await.unwrap();
        let b = provider.embed("Parse the GRAPH").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_shared_words_are_similar() {
        let provider = HashingProvider::new(256);
        let vectors = provider
            .embed_batch(&[
                "graph storage engine".to_string(),
                "graph storage layer".to_string(),
            ])
            .await
            .unwrap();
        let sim = cosine_similarity(&vectors[0], &vectors[1]).unwrap();
        assert!(sim > 0.3, "similarity was {sim}");
    }

    #[tokio::test]
    async fn test_text_too_long() {
        let provider = HashingProvider::new(8).with_max_length(3);
        assert!(matches!(
            provider.embed("abcd").await,
            Err(EmbeddingError::TextTooLong { length: 4, .. })
        ));
    }

    #[test]
    fn test_validate_batch_counts() {
        let provider = HashingProvider::new(2);
        assert!(validate_batch(&provider, 1, &[vec![0.0, 1.0]]).is_ok());
        assert!(validate_batch(&provider, 2, &[vec![0.0, 1.0]]).is_err());
        assert!(validate_batch(&provider, 1, &[vec![1.0]]).is_err());
    }
}
