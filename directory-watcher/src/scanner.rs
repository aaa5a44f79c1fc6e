//! Initial directory scanning.

use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::DirectoryConfig;
use crate::error::{Result, WatcherError};

/// A file found by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScannedFile {
    pub path: PathBuf,

    /// File size in bytes.
    pub size: u64,

    /// When the file was last modified, if the platform reports it.
    pub modified: Option<DateTime<Utc>>,
}

/// Walk `config.path` and return every file the config accepts, sorted by
/// path. Excluded directories are pruned without being descended into.
/// Unreadable entries are logged and skipped.
pub fn scan_directory(config: &DirectoryConfig) -> Result<Vec<ScannedFile>> {
    if !config.path.is_dir() {
        return Err(WatcherError::DirectoryNotFound(config.path.display().to_string()));
    }
    let start = Instant::now();

    let walker = WalkDir::new(&config.path)
        .follow_links(config.follow_symlinks)
        .max_depth(config.max_depth.unwrap_or(usize::MAX))
        .sort_by_file_name();

    let mut files = Vec::new();
    let mut skipped = 0usize;
    // A trailing separator lets `*/dir/*` patterns match the directory itself.
    let entries = walker.into_iter().filter_entry(|entry| {
        entry.depth() == 0
            || !entry.file_type().is_dir()
            || !config.should_exclude(&entry.path().join(""))
    });
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {e}", config.path.display());
                skipped += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() && !(config.follow_symlinks && entry.path().is_file()) {
            continue;
        }
        if !config.accepts(entry.path()) {
            continue;
        }
        let metadata = entry.metadata().ok();
        files.push(ScannedFile {
            path: entry.into_path(),
            size: metadata.as_ref().map_or(0, std::fs::Metadata::len),
            modified: metadata
                .and_then(|m| m.modified().ok())
                .map(DateTime::<Utc>::from),
        });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    info!(
        "Scanned {} files under {} in {:?} ({skipped} skipped)",
        files.len(),
        config.path.display(),
        start.elapsed()
    );
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;
    use tempfile::TempDir;

    fn relative(root: &TempDir, files: &[ScannedFile]) -> Vec<String> {
        files
            .iter()
            .map(|f| {
                f.path
                    .strip_prefix(root.path())
                    .unwrap()
                    .to_string_lossy()
                    .replace('\\', "/")
            })
            .collect()
    }

    #[test]
    fn test_scan_filters_and_sorts() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("docs/deep")).unwrap();
        fs::create_dir_all(root.path().join("node_modules/pkg")).unwrap();
        fs::write(root.path().join("b.md"), "# B").unwrap();
        fs::write(root.path().join("a.ts"), "export {}").unwrap();
        fs::write(root.path().join("docs/guide.md"), "# Guide").unwrap();
        fs::write(root.path().join("docs/deep/notes.md"), "# Notes").unwrap();
        fs::write(root.path().join("node_modules/pkg/index.md"), "# Dep").unwrap();
        fs::write(root.path().join("scratch.tmp"), "x").unwrap();

        let config = DirectoryConfig::new(root.path());
        let files = scan_directory(&config).unwrap();
        assert_eq!(
            relative(&root, &files),
            vec!["a.ts", "b.md", "docs/deep/notes.md", "docs/guide.md"]
        );
        assert_eq!(files[1].size, 3);

        let config = DirectoryConfig::new(root.path())
            .with_extensions(["md"])
            .with_max_depth(2);
        let files = scan_directory(&config).unwrap();
        assert_eq!(relative(&root, &files), vec!["b.md", "docs/guide.md"]);
    }

    #[test]
    fn test_scan_missing_root() {
        let config = DirectoryConfig::new("/nonexistent/path/12345");
        assert!(matches!(
            scan_directory(&config),
            Err(WatcherError::DirectoryNotFound(_))
        ));
    }
}
