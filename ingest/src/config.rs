//! Configuration for the ingestion components.
//!
//! Durations are stored in milliseconds so the structs round-trip through
//! TOML unchanged; accessors return [`Duration`].

use std::time::Duration;

use ragforge_dedup::DedupConfig;
use serde::{Deserialize, Serialize};

/// Configuration for the [`BatchIngestionProcessor`](crate::processor::BatchIngestionProcessor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Concurrent reads and per-file post-processing tasks in a batch.
    pub concurrency: usize,

    /// Deadline for reading one source.
    pub read_timeout_ms: u64,

    /// Deadline for one parse call (single file or whole batch).
    pub parse_timeout_ms: u64,

    /// Deadline for one store statement.
    pub store_timeout_ms: u64,

    /// Append a change record for every created, updated or deleted node.
    pub track_changes: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            read_timeout_ms: 30_000,
            parse_timeout_ms: 120_000,
            store_timeout_ms: 60_000,
            track_changes: true,
        }
    }
}

impl ProcessorConfig {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_track_changes(mut self, track_changes: bool) -> Self {
        self.track_changes = track_changes;
        self
    }

    pub fn with_parse_timeout(mut self, timeout: Duration) -> Self {
        self.parse_timeout_ms = millis(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = millis(timeout);
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout_ms = millis(timeout);
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn parse_timeout(&self) -> Duration {
        Duration::from_millis(self.parse_timeout_ms)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    /// Concurrency, never below one.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.max(1)
    }
}

/// Configuration for the [`ProcessingLoop`](crate::processing_loop::ProcessingLoop).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Files (or nodes) drained from each queue per iteration.
    pub batch_size: usize,

    /// Delay after an iteration that did work.
    pub busy_interval_ms: u64,

    /// First delay after an idle iteration.
    pub idle_interval_ms: u64,

    /// Cap on the idle delay.
    pub max_idle_interval_ms: u64,

    /// Multiplier applied per consecutive idle iteration.
    pub backoff_factor: f64,

    /// Run the recovery pass before the first iteration.
    pub recover_on_start: bool,

    /// Age after which a file in a transient state counts as stuck.
    pub stuck_threshold_ms: u64,

    /// Retry ceiling for files in `error`.
    pub max_retries: u32,

    /// How long `stop` waits for the in-flight iteration.
    pub stop_grace_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            busy_interval_ms: 100,
            idle_interval_ms: 1_000,
            max_idle_interval_ms: 30_000,
            backoff_factor: 1.5,
            recover_on_start: true,
            stuck_threshold_ms: 10 * 60 * 1_000,
            max_retries: 3,
            stop_grace_ms: 30_000,
        }
    }
}

impl LoopConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_intervals(mut self, busy: Duration, idle: Duration, max_idle: Duration) -> Self {
        self.busy_interval_ms = millis(busy);
        self.idle_interval_ms = millis(idle);
        self.max_idle_interval_ms = millis(max_idle);
        self
    }

    pub fn with_recover_on_start(mut self, recover: bool) -> Self {
        self.recover_on_start = recover;
        self
    }

    pub fn with_stuck_threshold(mut self, threshold: Duration) -> Self {
        self.stuck_threshold_ms = millis(threshold);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace_ms = millis(grace);
        self
    }

    pub fn busy_interval(&self) -> Duration {
        Duration::from_millis(self.busy_interval_ms)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_interval_ms)
    }

    pub fn max_idle_interval(&self) -> Duration {
        Duration::from_millis(self.max_idle_interval_ms)
    }

    pub fn stuck_threshold(&self) -> Duration {
        Duration::from_millis(self.stuck_threshold_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Batch size, never below one.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

/// Configuration for the [`EnrichmentPipeline`](crate::enrichment::EnrichmentPipeline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    /// Extracted entities below this confidence are dropped.
    pub min_confidence: f64,

    /// Texts per extractor or embedder call.
    pub batch_size: usize,

    /// Deadline for one extractor call.
    pub extract_timeout_ms: u64,

    /// Deadline for one embedder call.
    pub embed_timeout_ms: u64,

    /// Characters of node text sent to the extractor and embedder.
    pub max_text_chars: usize,

    pub dedup: DedupConfig,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.5,
            batch_size: 32,
            extract_timeout_ms: 120_000,
            embed_timeout_ms: 60_000,
            max_text_chars: 8_000,
            dedup: DedupConfig::default(),
        }
    }
}

impl EnrichmentConfig {
    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence;
        self
    }

    pub fn with_dedup(mut self, dedup: DedupConfig) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_millis(self.extract_timeout_ms)
    }

    pub fn embed_timeout(&self) -> Duration {
        Duration::from_millis(self.embed_timeout_ms)
    }

    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
