//! # Directory Watcher
//!
//! File system event source for the ingestion engine. It scans configured
//! directories once and then reports the files that change in them.
//!
//! ## Features
//!
//! - **Initial Scan**: Walk a directory and list the files to discover
//! - **Real-time Watching**: Monitor directories for file changes
//! - **Filtering**: Exclude patterns, extension allow-list and depth limit
//! - **Coalescing**: Collapse bursts of events on the same path
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Directory Watcher                            │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  DirectoryConfig ──► scan_directory ──► ScannedFile             │
//! │       │                                                         │
//! │       ▼                                                         │
//! │  DirectoryWatcher ──► accept_event ──► mpsc<FileEvent>          │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod event;
pub mod scanner;
pub mod watcher;

pub use config::DirectoryConfig;
pub use error::{Result, WatcherError};
pub use event::{FileEvent, FileEventKind, coalesce, split_notify_event};
pub use scanner::{ScannedFile, scan_directory};
pub use watcher::{DirectoryWatcher, accept_event};
