//! Directory watcher implementation.

use std::path::Path;
use std::sync::Arc;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::DirectoryConfig;
use crate::error::{Result, WatcherError};
use crate::event::{FileEvent, FileEventKind, split_notify_event};

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Watches configured directories and emits [`FileEvent`]s for the files
/// they accept.
pub struct DirectoryWatcher {
    /// Watched directories, with canonical roots.
    configs: Arc<RwLock<Vec<DirectoryConfig>>>,

    /// Internal notify watcher; present while running.
    watcher: Option<RecommendedWatcher>,

    event_tx: mpsc::Sender<FileEvent>,

    /// Handed out once through [`take_events`](Self::take_events).
    event_rx: Option<mpsc::Receiver<FileEvent>>,
}

impl DirectoryWatcher {
    /// Create a new directory watcher.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Create a watcher whose event channel holds `capacity` pending events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (event_tx, event_rx) = mpsc::channel(capacity.max(1));
        Self {
            configs: Arc::new(RwLock::new(Vec::new())),
            watcher: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Add a directory to watch. Its root is canonicalized first so it
    /// compares equal to the paths notify reports.
    pub async fn add(&mut self, config: DirectoryConfig) -> Result<()> {
        let config = config.canonicalized()?;
        {
            let configs = self.configs.read().await;
            if configs.iter().any(|c| c.path == config.path) {
                return Err(WatcherError::AlreadyWatching(config.path.display().to_string()));
            }
        }

        if let Some(watcher) = self.watcher.as_mut() {
            watcher.watch(&config.path, recursive_mode(&config))?;
        }
        info!("Adding directory to watch: {}", config.path.display());
        self.configs.write().await.push(config);
        Ok(())
    }

    /// Remove a directory from watching.
    pub async fn remove(&mut self, path: &Path) -> Result<()> {
        let mut configs = self.configs.write().await;
        let Some(index) = configs
            .iter()
            .position(|c| c.path == path || path.canonicalize().is_ok_and(|p| p == c.path))
        else {
            return Err(WatcherError::DirectoryNotFound(path.display().to_string()));
        };
        let config = configs.remove(index);
        if let Some(watcher) = self.watcher.as_mut()
            && let Err(e) = watcher.unwatch(&config.path)
        {
            warn!("Failed to unwatch {}: {e}", config.path.display());
        }
        info!("Removed directory from watch: {}", config.path.display());
        Ok(())
    }

    /// Configured directories.
    pub async fn directories(&self) -> Vec<DirectoryConfig> {
        self.configs.read().await.clone()
    }

    /// The receiving end of the event channel. Available once.
    pub fn take_events(&mut self) -> Result<mpsc::Receiver<FileEvent>> {
        self.event_rx.take().ok_or(WatcherError::ReceiverTaken)
    }

    /// Start watching all configured directories.
    pub async fn start(&mut self) -> Result<()> {
        if self.watcher.is_some() {
            return Ok(());
        }

        let event_tx = self.event_tx.clone();
        let configs = self.configs.clone();
        let mut watcher = notify::recommended_watcher(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    // Runs on the notify thread, outside the async runtime.
                    let configs = configs.blocking_read();
                    for file_event in split_notify_event(event) {
                        if !accept_event(&configs, &file_event) {
                            continue;
                        }
                        if let Err(e) = event_tx.blocking_send(file_event) {
                            error!("Failed to send file event: {e}");
                        }
                    }
                }
                Err(e) => error!("Watch error: {e}"),
            },
        )?;

        for config in self.configs.read().await.iter() {
            match watcher.watch(&config.path, recursive_mode(config)) {
                Ok(()) => debug!("Started watching: {}", config.path.display()),
                Err(e) => warn!("Failed to watch {}: {e}", config.path.display()),
            }
        }

        self.watcher = Some(watcher);
        info!("Directory watcher started");
        Ok(())
    }

    /// Stop watching all directories. Pending events stay in the channel.
    pub async fn stop(&mut self) {
        let Some(mut watcher) = self.watcher.take() else {
            return;
        };
        for config in self.configs.read().await.iter() {
            if let Err(e) = watcher.unwatch(&config.path) {
                debug!("Unwatch of {} failed: {e}", config.path.display());
            }
        }
        info!("Directory watcher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }
}

impl Default for DirectoryWatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn recursive_mode(config: &DirectoryConfig) -> RecursiveMode {
    if config.max_depth.is_some_and(|depth| depth <= 1) {
        RecursiveMode::NonRecursive
    } else {
        RecursiveMode::Recursive
    }
}

/// Whether `event` concerns a file some directory accepts. Directories
/// themselves never produce events.
pub fn accept_event(configs: &[DirectoryConfig], event: &FileEvent) -> bool {
    if event.kind == FileEventKind::Other {
        return false;
    }
    if event.kind.is_upsert() && event.path.is_dir() {
        return false;
    }
    configs.iter().any(|c| c.accepts(&event.path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_add_directory() {
        let temp_dir = TempDir::new().unwrap();
        let mut watcher = DirectoryWatcher::new();

        watcher.add(DirectoryConfig::new(temp_dir.path())).await.unwrap();
        let dirs = watcher.directories().await;
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].path, temp_dir.path().canonicalize().unwrap());

        let duplicate = watcher.add(DirectoryConfig::new(temp_dir.path())).await;
        assert!(matches!(duplicate, Err(WatcherError::AlreadyWatching(_))));

        watcher.remove(temp_dir.path()).await.unwrap();
        assert!(watcher.directories().await.is_empty());
    }

    #[tokio::test]
    async fn test_add_nonexistent_directory() {
        let mut watcher = DirectoryWatcher::new();
        let result = watcher.add(DirectoryConfig::new("/nonexistent/path/12345")).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_receiver_taken_once() {
        let mut watcher = DirectoryWatcher::new();
        assert!(watcher.take_events().is_ok());
        assert!(matches!(watcher.take_events(), Err(WatcherError::ReceiverTaken)));
    }

    #[test]
    fn test_accept_event() {
        let configs = vec![DirectoryConfig::new("/watched").with_extensions(["md"])];

        let accepted = |kind, path: &str| accept_event(&configs, &FileEvent::new(kind, path));
        assert!(accepted(FileEventKind::Modified, "/watched/a.md"));
        assert!(accepted(FileEventKind::Deleted, "/watched/sub/b.md"));
        assert!(!accepted(FileEventKind::Modified, "/watched/a.rs"));
        assert!(!accepted(FileEventKind::Modified, "/elsewhere/a.md"));
        assert!(!accepted(FileEventKind::Other, "/watched/a.md"));
        assert!(!accepted(FileEventKind::Created, "/watched/.git/HEAD.md"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reports_created_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut watcher = DirectoryWatcher::new();
        watcher.add(DirectoryConfig::new(temp_dir.path())).await.unwrap();
        let mut events = watcher.take_events().unwrap();
        watcher.start().await.unwrap();
        assert!(watcher.is_running());

        let path = temp_dir.path().canonicalize().unwrap().join("note.md");
        std::fs::write(&path, "# Note").unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(event) = events.recv().await {
                if event.path == path && event.kind.is_upsert() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(seen);

        watcher.stop().await;
        assert!(!watcher.is_running());
    }
}
