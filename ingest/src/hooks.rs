//! Callbacks the ingestion core exposes to its host.

use async_trait::async_trait;
use ragforge_graph_store::IngestState;

/// Lets a host (an orphan-file watcher, a project manager) take part in
/// reference resolution without the core knowing the project topology.
///
/// Hook errors are the host's business: the core does not fail a file
/// because a hook misbehaved, so the methods return nothing.
#[async_trait]
pub trait IngestHooks: Send + Sync {
    /// A file reached `linked`.
    async fn on_file_linked(&self, _path: &str) {}

    /// A reference created a `mentioned` placeholder for `path`.
    async fn on_create_mentioned_file(&self, _path: &str, _importer: &str) {}

    /// State of a file the store does not track, as known to the host.
    async fn on_get_file_state(&self, _path: &str) -> Option<IngestState> {
        None
    }
}

/// Hooks that do nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHooks;

impl IngestHooks for NoopHooks {}
