//! Configuration types for directory watching.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use wildmatch::WildMatch;

use crate::error::{Result, WatcherError};

/// Configuration for a watched directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Root of the tree.
    pub path: PathBuf,

    /// Wildcard patterns matched against the full path; `*` spans separators.
    pub exclude_patterns: Vec<String>,

    /// Only files with one of these extensions are reported. `None` accepts
    /// every extension.
    pub extensions: Option<Vec<String>>,

    /// Maximum depth below the root (None = unlimited).
    pub max_depth: Option<usize>,

    /// Whether to follow symbolic links.
    pub follow_symlinks: bool,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            exclude_patterns: Self::default_excludes(),
            extensions: None,
            max_depth: None,
            follow_symlinks: false,
        }
    }
}

impl DirectoryConfig {
    /// Create a new directory config.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// Add an exclude pattern.
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    /// Restrict reported files to these extensions (with or without the dot).
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = Some(extensions.into_iter().map(Into::into).collect());
        self
    }

    /// Set the maximum depth.
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Enable following symbolic links.
    pub fn follow_symlinks(mut self) -> Self {
        self.follow_symlinks = true;
        self
    }

    /// Resolve the root to an absolute, symlink-free directory path.
    pub fn canonicalized(mut self) -> Result<Self> {
        if !self.path.exists() {
            return Err(WatcherError::DirectoryNotFound(self.path.display().to_string()));
        }
        if !self.path.is_dir() {
            return Err(WatcherError::NotADirectory(self.path.display().to_string()));
        }
        self.path = self.path.canonicalize()?;
        Ok(self)
    }

    fn default_excludes() -> Vec<String> {
        [
            // Version control
            "*/.git/*",
            "*/.svn/*",
            "*/.hg/*",
            // Dependencies
            "*/node_modules/*",
            "*/target/*",
            "*/.venv/*",
            "*/venv/*",
            // Build artifacts
            "*/dist/*",
            "*/__pycache__/*",
            "*.pyc",
            // Editors
            "*/.idea/*",
            "*/.vscode/*",
            "*.swp",
            "*~",
            // System files
            "*/.DS_Store",
            "*/Thumbs.db",
            "*.tmp",
        ]
        .into_iter()
        .map(String::from)
        .collect()
    }

    /// Check if a path should be excluded.
    pub fn should_exclude(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        self.exclude_patterns
            .iter()
            .any(|pattern| WildMatch::new(pattern).matches(&path_str))
    }

    /// Whether the extension of `path` passes the allow-list.
    pub fn extension_allowed(&self, path: &Path) -> bool {
        let Some(allowed) = &self.extensions else {
            return true;
        };
        let Some(ext) = path.extension().and_then(std::ffi::OsStr::to_str) else {
            return false;
        };
        allowed
            .iter()
            .any(|a| a.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }

    /// Depth of `path` below the root, or `None` if it lies outside it.
    pub fn depth_of(&self, path: &Path) -> Option<usize> {
        path.strip_prefix(&self.path)
            .ok()
            .map(|rel| rel.components().count())
    }

    /// Whether a file at `path` belongs to this directory's file set.
    pub fn accepts(&self, path: &Path) -> bool {
        let Some(depth) = self.depth_of(path) else {
            return false;
        };
        depth > 0
            && self.max_depth.is_none_or(|max| depth <= max)
            && !self.should_exclude(path)
            && self.extension_allowed(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exclude_patterns() {
        let config = DirectoryConfig::new("/test");

        assert!(config.should_exclude(Path::new("/test/.git/config")));
        assert!(config.should_exclude(Path::new("/test/node_modules/package/index.js")));
        assert!(config.should_exclude(Path::new("/test/src/cache.pyc")));
        assert!(!config.should_exclude(Path::new("/test/src/main.rs")));
    }

    #[test]
    fn test_extension_allow_list() {
        let config = DirectoryConfig::new("/test").with_extensions([".md", "TS"]);

        assert!(config.accepts(Path::new("/test/docs/readme.MD")));
        assert!(config.accepts(Path::new("/test/src/app.ts")));
        assert!(!config.accepts(Path::new("/test/src/app.rs")));
        assert!(!config.accepts(Path::new("/test/Makefile")));
    }

    #[test]
    fn test_depth_limits() {
        let config = DirectoryConfig::new("/test").with_max_depth(2);

        assert_eq!(config.depth_of(Path::new("/test/a/b.md")), Some(2));
        assert_eq!(config.depth_of(Path::new("/elsewhere/b.md")), None);
        assert!(config.accepts(Path::new("/test/a/b.md")));
        assert!(!config.accepts(Path::new("/test/a/b/c.md")));
        assert!(!config.accepts(Path::new("/test")));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: DirectoryConfig =
            serde_json::from_str(r#"{"path": "/docs", "max_depth": 3}"#).unwrap();

        assert_eq!(config.path, PathBuf::from("/docs"));
        assert_eq!(config.max_depth, Some(3));
        assert_eq!(config.exclude_patterns, DirectoryConfig::default_excludes());
        assert!(!config.follow_symlinks);
    }

    #[test]
    fn test_canonicalize_missing_directory() {
        let result = DirectoryConfig::new("/nonexistent/path/12345").canonicalized();
        assert!(matches!(result, Err(WatcherError::DirectoryNotFound(_))));
    }
}
