//! Content sources: where file bytes come from.

use std::collections::HashMap;
use std::io::ErrorKind;

use async_trait::async_trait;
use ragforge_graph_store::FileRecord;
use tokio::sync::RwLock;
use tracing::trace;

use crate::error::SourceError;

/// Reads the current text of a tracked file.
///
/// Implementations must report a vanished source as
/// [`SourceError::NotFound`] so the processor can remove it from the graph
/// instead of failing it.
#[async_trait]
pub trait ContentSource: Send + Sync {
    async fn read_content(&self, file: &FileRecord) -> Result<String, SourceError>;
}

/// Reads files from the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskSource;

#[async_trait]
impl ContentSource for DiskSource {
    async fn read_content(&self, file: &FileRecord) -> Result<String, SourceError> {
        trace!("Reading {}", file.path);
        let bytes = match tokio::fs::read(&file.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SourceError::NotFound(file.path.clone()));
            }
            Err(source) => {
                return Err(SourceError::Io {
                    path: file.path.clone(),
                    source,
                });
            }
        };
        String::from_utf8(bytes).map_err(|_| SourceError::InvalidEncoding(file.path.clone()))
    }
}

/// Files whose bytes live in memory rather than on disk, keyed by path.
#[derive(Debug, Default)]
pub struct VirtualSource {
    files: RwLock<HashMap<String, String>>,
}

impl VirtualSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a file.
    pub async fn insert(&self, path: impl Into<String>, content: impl Into<String>) {
        self.files.write().await.insert(path.into(), content.into());
    }

    /// Remove a file. Later reads report it as not found.
    pub async fn remove(&self, path: &str) -> bool {
        self.files.write().await.remove(path).is_some()
    }
}

#[async_trait]
impl ContentSource for VirtualSource {
    async fn read_content(&self, file: &FileRecord) -> Result<String, SourceError> {
        self.files
            .read()
            .await
            .get(&file.path)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(file.path.clone()))
    }
}
