//! Configuration for the ingestion engine.
//!
//! Loaded from TOML; every section is optional and durations are given in
//! milliseconds:
//!
//! ```toml
//! [loop]
//! idle_interval_ms = 2000
//!
//! [[directories]]
//! project_id = "docs"
//! path = "/srv/docs"
//! extensions = ["md"]
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use ragforge_directory_watcher::DirectoryConfig;
use ragforge_ingest::{EnrichmentConfig, LoopConfig, ProcessorConfig};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Configuration for the ingestion engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directories to scan and watch, each feeding one project.
    pub directories: Vec<WatchedDirectory>,

    pub processor: ProcessorConfig,

    #[serde(rename = "loop")]
    pub processing: LoopConfig,

    pub enrichment: EnrichmentConfig,

    pub watch: WatchConfig,

    /// Entries kept by the embedding cache; 0 disables it.
    pub embedding_cache_entries: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            directories: Vec::new(),
            processor: ProcessorConfig::default(),
            processing: LoopConfig::default(),
            enrichment: EnrichmentConfig::default(),
            watch: WatchConfig::default(),
            embedding_cache_entries: 10_000,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Add a directory for `project_id`.
    pub fn with_directory(mut self, project_id: impl Into<String>, directory: DirectoryConfig) -> Self {
        self.directories.push(WatchedDirectory {
            project_id: project_id.into(),
            directory,
        });
        self
    }

    pub fn with_processor(mut self, config: ProcessorConfig) -> Self {
        self.processor = config;
        self
    }

    pub fn with_loop(mut self, config: LoopConfig) -> Self {
        self.processing = config;
        self
    }

    pub fn with_enrichment(mut self, config: EnrichmentConfig) -> Self {
        self.enrichment = config;
        self
    }

    pub fn with_watch(mut self, config: WatchConfig) -> Self {
        self.watch = config;
        self
    }

    /// Reject configurations the engine cannot run.
    pub fn validate(&self) -> Result<()> {
        let mut roots = HashSet::new();
        for entry in &self.directories {
            if entry.project_id.trim().is_empty() {
                return Err(EngineError::Config(format!(
                    "directory {} has an empty project_id",
                    entry.directory.path.display()
                )));
            }
            if entry.directory.path.as_os_str().is_empty() {
                return Err(EngineError::Config(format!(
                    "project {} has a directory without a path",
                    entry.project_id
                )));
            }
            if !roots.insert(entry.directory.path.as_path()) {
                return Err(EngineError::Config(format!(
                    "directory {} is configured twice",
                    entry.directory.path.display()
                )));
            }
        }
        Ok(())
    }
}

/// A directory and the project its files belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedDirectory {
    pub project_id: String,

    #[serde(flatten)]
    pub directory: DirectoryConfig,
}

/// How file system changes reach the state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Watch directories for changes after the initial scan.
    pub enabled: bool,

    /// Mark every scanned file discovered on start.
    pub scan_on_start: bool,

    /// Quiet period used to coalesce bursts of events.
    pub debounce_ms: u64,

    /// Retry interval for changes to files that were in flight.
    pub deferred_retry_ms: u64,

    /// Pending events the watcher channel holds.
    pub event_buffer: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_on_start: true,
            debounce_ms: 50,
            deferred_retry_ms: 500,
            event_buffer: 1024,
        }
    }
}

impl WatchConfig {
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_scan_on_start(mut self, scan: bool) -> Self {
        self.scan_on_start = scan;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = u64::try_from(debounce.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn deferred_retry(&self) -> Duration {
        Duration::from_millis(self.deferred_retry_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.processor.concurrency, 10);
        assert_eq!(config.processing.idle_interval_ms, 1_000);
        assert_eq!(config.processing.max_retries, 3);
        assert!(config.watch.enabled);
    }

    #[test]
    fn test_parse_sections() {
        let config = EngineConfig::from_toml_str(
            r#"
            embedding_cache_entries = 0

            [processor]
            concurrency = 4
            track_changes = false

            [loop]
            batch_size = 25
            idle_interval_ms = 2000

            [watch]
            debounce_ms = 10

            [[directories]]
            project_id = "docs"
            path = "/srv/docs"
            extensions = ["md"]
            max_depth = 4

            [[directories]]
            project_id = "web"
            path = "/srv/web"
            "#,
        )
        .unwrap();

        assert_eq!(config.embedding_cache_entries, 0);
        assert_eq!(config.processor.concurrency, 4);
        assert!(!config.processor.track_changes);
        assert_eq!(config.processing.batch_size, 25);
        assert_eq!(config.processing.idle_interval(), Duration::from_secs(2));
        assert_eq!(config.watch.debounce(), Duration::from_millis(10));
        assert!(config.watch.scan_on_start);

        assert_eq!(config.directories.len(), 2);
        let docs = &config.directories[0];
        assert_eq!(docs.project_id, "docs");
        assert_eq!(docs.directory.path, PathBuf::from("/srv/docs"));
        assert_eq!(docs.directory.extensions, Some(vec!["md".to_string()]));
        assert_eq!(docs.directory.max_depth, Some(4));
        assert!(!config.directories[1].directory.exclude_patterns.is_empty());
    }

    #[test]
    fn test_rejects_invalid_directories() {
        let duplicate = r#"
            [[directories]]
            project_id = "a"
            path = "/srv/docs"

            [[directories]]
            project_id = "b"
            path = "/srv/docs"
        "#;
        assert!(matches!(
            EngineConfig::from_toml_str(duplicate),
            Err(EngineError::Config(_))
        ));

        let unnamed = "[[directories]]\nproject_id = \"\"\npath = \"/srv\"\n";
        assert!(matches!(
            EngineConfig::from_toml_str(unnamed),
            Err(EngineError::Config(_))
        ));

        assert!(matches!(
            EngineConfig::from_toml_str("[loop]\nbatch_size = \"many\"\n"),
            Err(EngineError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(&path, "[watch]\nenabled = false\n").unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert!(!config.watch.enabled);
        assert!(matches!(
            EngineConfig::load(dir.path().join("missing.toml")),
            Err(EngineError::Io(_))
        ));
    }
}
