//! Cross-file reference extraction and resolution.
//!
//! Extractors find references in file content (`import { x } from './y'`)
//! and resolve them to target paths. The [`ReferenceResolver`] turns the
//! resolved tuples into file-level edges:
//!
//! - `CONSUMES` when the target file is already linked.
//! - `PENDING_IMPORT` otherwise, creating a `mentioned` file for targets
//!   the store has never seen. Once the target links,
//!   [`ReferenceResolver::resolve_pending_imports`] rewrites the edge.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use ragforge_graph_store::{
    ContentStore, FILE_LABEL, FileRecord, PropertyMap, PropertyValue, RelationshipKey,
    RelationshipRow, rel,
};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use crate::error::{IngestError, Result};
use crate::hooks::{IngestHooks, NoopHooks};
use crate::state_machine::StateMachine;
use crate::timeout::with_timeout;

static FROM_CLAUSE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    compile(r#"(?m)^[ \t]*(?:import|export)\s+(?:type\s+)?([^;'"]*?)\s*from\s*['"]([^'"]+)['"]"#)
});

static SIDE_EFFECT: LazyLock<Option<Regex>> =
    LazyLock::new(|| compile(r#"(?m)^[ \t]*import\s*['"]([^'"]+)['"]"#));

fn compile(pattern: &str) -> Option<Regex> {
    Regex::new(pattern)
        .inspect_err(|e| error!("Import pattern {pattern} does not compile: {e}"))
        .ok()
}

/// A reference as written in the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Module specifier or path as written (`./util`).
    pub specifier: String,

    /// Imported names; `*` for namespace imports, empty for side-effect imports.
    pub symbols: Vec<String>,

    pub line: u32,
}

/// A reference resolved to a target path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedReference {
    pub from: String,
    pub to: String,
    pub symbols: Vec<String>,
}

/// Answers whether a candidate target path exists.
#[async_trait]
pub trait PathLookup: Send + Sync {
    async fn exists(&self, path: &str) -> bool;
}

/// Inputs available while resolving the references of one file.
pub struct ResolveContext<'a> {
    pub importer: &'a str,
    pub project_id: &'a str,
    pub lookup: &'a dyn PathLookup,
}

/// Language or format specific reference handling.
#[async_trait]
pub trait ReferenceExtractor: Send + Sync {
    fn supports(&self, _path: &str) -> bool {
        true
    }

    fn extract(&self, content: &str, path: &str) -> Vec<Reference>;

    async fn resolve(
        &self,
        references: &[Reference],
        context: &ResolveContext<'_>,
    ) -> Result<Vec<ResolvedReference>>;
}

/// Relative ES module imports and re-exports.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportExtractor;

impl ImportExtractor {
    const SOURCE_EXTENSIONS: [&'static str; 6] = [".ts", ".tsx", ".js", ".jsx", ".mjs", ".cjs"];

    const CANDIDATE_SUFFIXES: [&'static str; 7] =
        [".ts", ".tsx", ".js", ".jsx", ".mjs", "/index.ts", "/index.js"];

    pub fn new() -> Self {
        Self
    }

    fn is_relative(specifier: &str) -> bool {
        specifier.starts_with("./") || specifier.starts_with("../")
    }

    fn has_source_extension(path: &str) -> bool {
        Self::SOURCE_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
    }

    /// Names bound by an import clause such as `a, { b as c, d }`.
    fn parse_symbols(clause: &str) -> Vec<String> {
        clause
            .split(',')
            .map(|part| part.trim().trim_matches(|c| c == '{' || c == '}').trim())
            .filter(|part| !part.is_empty())
            .filter_map(|part| {
                let mut words = part.split_whitespace();
                let first = words.next()?;
                let name = if first == "type" { words.next().unwrap_or(first) } else { first };
                Some(name.to_string())
            })
            .collect()
    }

    fn line_of(content: &str, offset: usize) -> u32 {
        let line = content[..offset].matches('\n').count() + 1;
        u32::try_from(line).unwrap_or(u32::MAX)
    }
}

#[async_trait]
impl ReferenceExtractor for ImportExtractor {
    fn supports(&self, path: &str) -> bool {
        Self::has_source_extension(path)
    }

    fn extract(&self, content: &str, path: &str) -> Vec<Reference> {
        let mut references = Vec::new();
        if let Some(re) = FROM_CLAUSE.as_ref() {
            for cap in re.captures_iter(content) {
                let (Some(whole), Some(clause), Some(specifier)) = (cap.get(0), cap.get(1), cap.get(2))
                else {
                    continue;
                };
                if !Self::is_relative(specifier.as_str()) {
                    continue;
                }
                references.push(Reference {
                    specifier: specifier.as_str().to_string(),
                    symbols: Self::parse_symbols(clause.as_str()),
                    line: Self::line_of(content, whole.start()),
                });
            }
        }
        if let Some(re) = SIDE_EFFECT.as_ref() {
            for cap in re.captures_iter(content) {
                let (Some(whole), Some(specifier)) = (cap.get(0), cap.get(1)) else {
                    continue;
                };
                if Self::is_relative(specifier.as_str()) {
                    references.push(Reference {
                        specifier: specifier.as_str().to_string(),
                        symbols: Vec::new(),
                        line: Self::line_of(content, whole.start()),
                    });
                }
            }
        }
        references.sort_by_key(|r| r.line);
        trace!("Extracted {} references from {path}", references.len());
        references
    }

    async fn resolve(
        &self,
        references: &[Reference],
        context: &ResolveContext<'_>,
    ) -> Result<Vec<ResolvedReference>> {
        let directory = parent_dir(context.importer);
        let importer_ext = Self::SOURCE_EXTENSIONS
            .iter()
            .find(|ext| context.importer.ends_with(*ext))
            .copied()
            .unwrap_or(".ts");

        let mut resolved = Vec::with_capacity(references.len());
        for reference in references {
            let base = normalize_path(&format!("{directory}/{}", reference.specifier));
            let target = if Self::has_source_extension(&base) || context.lookup.exists(&base).await {
                base
            } else {
                let mut found = None;
                for suffix in Self::CANDIDATE_SUFFIXES {
                    let candidate = format!("{base}{suffix}");
                    if context.lookup.exists(&candidate).await {
                        found = Some(candidate);
                        break;
                    }
                }
                // Not ingested yet: assume the importer's own extension.
                found.unwrap_or_else(|| format!("{base}{importer_ext}"))
            };
            resolved.push(ResolvedReference {
                from: context.importer.to_string(),
                to: target,
                symbols: reference.symbols.clone(),
            });
        }
        Ok(resolved)
    }
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(dir, _)| dir)
}

/// Lexically resolve `.` and `..` segments.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|p| *p != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute { format!("/{joined}") } else { joined }
}

/// Looks in the store, then the host, then the local filesystem. Each lookup
/// that outlives `timeout` counts as a miss.
struct FileLookup<'a> {
    store: &'a dyn ContentStore,
    hooks: &'a dyn IngestHooks,
    project_id: &'a str,
    timeout: Duration,
}

#[async_trait]
impl PathLookup for FileLookup<'_> {
    async fn exists(&self, path: &str) -> bool {
        let lookup = self.store.get_file_by_path(self.project_id, path);
        match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(Some(_))) => return true,
            Ok(_) => {}
            Err(_) => warn!("Store lookup of {path} timed out after {:?}", self.timeout),
        }
        if let Ok(Some(_)) = tokio::time::timeout(self.timeout, self.hooks.on_get_file_state(path)).await {
            return true;
        }
        matches!(
            tokio::time::timeout(self.timeout, tokio::fs::try_exists(path)).await,
            Ok(Ok(true))
        )
    }
}

/// Counts from one [`ReferenceResolver::link_references`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkSummary {
    pub consumes: usize,
    pub pending: usize,
    pub mentioned_created: usize,

    /// Placeholders dropped because this file was their last importer.
    pub placeholders_pruned: usize,
}

/// Writes file-level reference edges.
#[derive(Clone)]
pub struct ReferenceResolver {
    extractors: Vec<Arc<dyn ReferenceExtractor>>,
    machine: StateMachine,
    hooks: Arc<dyn IngestHooks>,
}

impl ReferenceResolver {
    pub fn new(machine: StateMachine) -> Self {
        Self {
            extractors: Vec::new(),
            machine,
            hooks: Arc::new(NoopHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn IngestHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn ReferenceExtractor>) -> Self {
        self.extractors.push(extractor);
        self
    }

    fn store(&self) -> &Arc<dyn ContentStore> {
        self.machine.store()
    }

    /// Extract and resolve the references of `file`. Files no extractor
    /// supports have none.
    pub async fn extract_and_resolve(
        &self,
        file: &FileRecord,
        content: &str,
    ) -> Result<Vec<ResolvedReference>> {
        let Some(extractor) = self.extractors.iter().find(|e| e.supports(&file.path)) else {
            return Ok(Vec::new());
        };
        let references = extractor.extract(content, &file.path);
        if references.is_empty() {
            return Ok(Vec::new());
        }
        let lookup = FileLookup {
            store: self.store().as_ref(),
            hooks: self.hooks.as_ref(),
            project_id: &file.project_id,
            timeout: self.machine.store_timeout(),
        };
        let context = ResolveContext {
            importer: &file.path,
            project_id: &file.project_id,
            lookup: &lookup,
        };
        extractor.resolve(&references, &context).await
    }

    /// Replace the outgoing reference edges of `file` with `references`.
    pub async fn link_references(
        &self,
        file: &FileRecord,
        references: &[ResolvedReference],
    ) -> Result<LinkSummary> {
        let store = self.store();
        let timeout = self.machine.store_timeout();
        let previous: Vec<_> = with_timeout(
            "pending imports",
            timeout,
            store.relationships_from(file.id, rel::PENDING_IMPORT),
        )
        .await?
        .into_iter()
        .map(|edge| edge.to)
        .collect();
        with_timeout(
            "clear references",
            timeout,
            store.delete_relationships_from(file.id, &[rel::CONSUMES, rel::PENDING_IMPORT]),
        )
        .await?;

        let mut by_target: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for reference in references.iter().filter(|r| r.to != file.path) {
            let symbols = by_target.entry(reference.to.as_str()).or_default();
            for symbol in &reference.symbols {
                if !symbols.contains(symbol) {
                    symbols.push(symbol.clone());
                }
            }
        }

        let mut summary = LinkSummary::default();
        let mut consumes = Vec::new();
        let mut pending = Vec::new();
        for (target, symbols) in by_target {
            let existing = with_timeout(
                "get file by path",
                timeout,
                store.get_file_by_path(&file.project_id, target),
            )
            .await?;
            let record = match existing {
                Some(record) => record,
                None => {
                    let (record, created) = self.machine.mark_mentioned(target, &file.project_id).await?;
                    if created {
                        summary.mentioned_created += 1;
                        self.hooks.on_create_mentioned_file(target, &file.path).await;
                    }
                    record
                }
            };

            let mut properties = PropertyMap::new();
            properties.insert("symbols".to_string(), PropertyValue::from(symbols));
            let row = RelationshipRow {
                from: file.id,
                to: record.id,
                properties,
            };
            if record.state.is_linked() {
                consumes.push(row);
            } else {
                pending.push(row);
            }
        }

        let key = |rel_type: &str| {
            RelationshipKey::new(rel_type, Some(FILE_LABEL.to_string()), Some(FILE_LABEL.to_string()))
        };
        let current: HashSet<_> = consumes.iter().chain(&pending).map(|row| row.to).collect();
        if !consumes.is_empty() {
            summary.consumes = with_timeout(
                "merge consumes",
                timeout,
                store.merge_relationships(&key(rel::CONSUMES), &consumes),
            )
            .await?;
        }
        if !pending.is_empty() {
            summary.pending = with_timeout(
                "merge pending imports",
                timeout,
                store.merge_relationships(&key(rel::PENDING_IMPORT), &pending),
            )
            .await?;
        }

        let stale: Vec<_> = previous.into_iter().filter(|to| !current.contains(to)).collect();
        if !stale.is_empty() {
            let pruned =
                with_timeout("prune placeholders", timeout, store.prune_placeholders(&stale)).await?;
            summary.placeholders_pruned = pruned.len();
        }
        debug!(
            "Linked references of {}: {} consumes, {} pending",
            file.path, summary.consumes, summary.pending
        );
        Ok(summary)
    }

    /// Extract, resolve and link in one call.
    pub async fn process(&self, file: &FileRecord, content: &str) -> Result<LinkSummary> {
        let references = self
            .extract_and_resolve(file, content)
            .await
            .map_err(|e| match e {
                IngestError::References(_) => e,
                other => IngestError::References(other.to_string()),
            })?;
        self.link_references(file, &references)
            .await
            .map_err(|e| IngestError::References(e.to_string()))
    }

    /// Rewrite incoming `PENDING_IMPORT` edges of a now linked file into
    /// `CONSUMES`. Returns the number converted.
    pub async fn resolve_pending_imports(&self, file: &FileRecord) -> Result<usize> {
        let store = self.store();
        let timeout = self.machine.store_timeout();
        let incoming = with_timeout(
            "pending imports",
            timeout,
            store.relationships_to(file.id, rel::PENDING_IMPORT),
        )
        .await?;
        if incoming.is_empty() {
            return Ok(0);
        }

        let rows: Vec<RelationshipRow> = incoming
            .iter()
            .map(|edge| RelationshipRow {
                from: edge.from,
                to: edge.to,
                properties: edge.properties.clone(),
            })
            .collect();
        let key = RelationshipKey::new(
            rel::CONSUMES,
            Some(FILE_LABEL.to_string()),
            Some(FILE_LABEL.to_string()),
        );
        with_timeout("merge consumes", timeout, store.merge_relationships(&key, &rows)).await?;
        for edge in &incoming {
            with_timeout(
                "delete pending import",
                timeout,
                store.delete_relationship(edge.from, rel::PENDING_IMPORT, edge.to),
            )
            .await?;
        }
        debug!("Resolved {} pending imports of {}", incoming.len(), file.path);
        Ok(incoming.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::file_id;
    use pretty_assertions::assert_eq;
    use ragforge_graph_store::{IngestState, MemoryStore};
    use std::collections::HashSet;

    struct KnownPaths(HashSet<String>);

    #[async_trait]
    impl PathLookup for KnownPaths {
        async fn exists(&self, path: &str) -> bool {
            self.0.contains(path)
        }
    }

    #[test]
    fn test_extract_imports() {
        let content = "import { a, b as c } from './util';\nimport React from 'react';\nimport './side.css';\nexport * from \"../shared/types\";\nimport type { T } from './types';\n";
        let refs = ImportExtractor::new().extract(content, "/src/app/main.ts");
        assert_eq!(
            refs,
            vec![
                Reference {
                    specifier: "./util".to_string(),
                    symbols: vec!["a".to_string(), "b".to_string()],
                    line: 1,
                },
                Reference {
                    specifier: "./side.css".to_string(),
                    symbols: Vec::new(),
                    line: 3,
                },
                Reference {
                    specifier: "../shared/types".to_string(),
                    symbols: vec!["*".to_string()],
                    line: 4,
                },
                Reference {
                    specifier: "./types".to_string(),
                    symbols: vec!["T".to_string()],
                    line: 5,
                },
            ]
        );
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/src/app/../lib/./x"), "/src/lib/x");
        assert_eq!(normalize_path("/../a"), "/a");
        assert_eq!(normalize_path("a/../../b"), "../b");
    }

    #[tokio::test]
    async fn test_resolve_tries_extensions_then_falls_back() {
        let lookup = KnownPaths(["/src/lib/index.ts".to_string()].into_iter().collect());
        let context = ResolveContext {
            importer: "/src/app/main.tsx",
            project_id: "p",
            lookup: &lookup,
        };
        let refs = vec![
            Reference {
                specifier: "../lib".to_string(),
                symbols: Vec::new(),
                line: 1,
            },
            Reference {
                specifier: "./later".to_string(),
                symbols: Vec::new(),
                line: 2,
            },
        ];
        let resolved = ImportExtractor::new().resolve(&refs, &context).await.unwrap();
        let targets: Vec<&str> = resolved.iter().map(|r| r.to.as_str()).collect();
        assert_eq!(targets, vec!["/src/lib/index.ts", "/src/app/later.tsx"]);
    }

    #[tokio::test]
    async fn test_pending_import_resolves_when_target_links() {
        let store = Arc::new(MemoryStore::new());
        let machine = StateMachine::new(store.clone());
        let resolver = ReferenceResolver::new(machine.clone())
            .with_extractor(Arc::new(ImportExtractor::new()));

        let b = machine.mark_discovered("/p/b.ts", "p").await.unwrap().file().clone();
        let summary = resolver
            .process(&b, "import { c } from './c';\n")
            .await
            .unwrap();
        assert_eq!(
            summary,
            LinkSummary {
                consumes: 0,
                pending: 1,
                mentioned_created: 1,
                placeholders_pruned: 0,
            }
        );

        let c = store.get_file_by_path("p", "/p/c.ts").await.unwrap().unwrap();
        assert_eq!(c.state, IngestState::Mentioned);
        assert_eq!(store.relationships_of_type(rel::PENDING_IMPORT).await.len(), 1);

        // c.ts gets ingested and linked.
        machine.mark_discovered("/p/c.ts", "p").await.unwrap();
        for state in [IngestState::Parsing, IngestState::Parsed, IngestState::Linked] {
            machine.transition(c.id, state, Default::default()).await.unwrap();
        }
        assert_eq!(resolver.resolve_pending_imports(&c).await.unwrap(), 1);

        assert!(store.relationships_of_type(rel::PENDING_IMPORT).await.is_empty());
        let consumes = store.relationships_of_type(rel::CONSUMES).await;
        assert_eq!(consumes.len(), 1);
        assert_eq!((consumes[0].from, consumes[0].to), (b.id, c.id));
    }

    #[tokio::test]
    async fn test_relinking_drops_stale_references() {
        let store = Arc::new(MemoryStore::new());
        let machine = StateMachine::new(store.clone());
        let resolver = ReferenceResolver::new(machine.clone())
            .with_extractor(Arc::new(ImportExtractor::new()));
        let a = machine.mark_discovered("/p/a.ts", "p").await.unwrap().file().clone();

        resolver.process(&a, "import { x } from './x';\n").await.unwrap();
        assert!(store.get_file_by_path("p", "/p/x.ts").await.unwrap().is_some());
        let summary = resolver.process(&a, "import { y } from './y';\n").await.unwrap();
        assert_eq!(summary.placeholders_pruned, 1);

        let pending = store.relationships_of_type(rel::PENDING_IMPORT).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].to, file_id("p", "/p/y.ts"));
        assert!(store.get_file_by_path("p", "/p/x.ts").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mentioned_file_survives_while_another_file_imports_it() {
        let store = Arc::new(MemoryStore::new());
        let machine = StateMachine::new(store.clone());
        let resolver = ReferenceResolver::new(machine.clone())
            .with_extractor(Arc::new(ImportExtractor::new()));
        let a = machine.mark_discovered("/p/a.ts", "p").await.unwrap().file().clone();
        let b = machine.mark_discovered("/p/b.ts", "p").await.unwrap().file().clone();

        resolver.process(&a, "import { x } from './x';\n").await.unwrap();
        resolver.process(&b, "import { x } from './x';\n").await.unwrap();
        let summary = resolver.process(&a, "const nothing = 1;\n").await.unwrap();
        assert_eq!(summary.placeholders_pruned, 0);
        assert!(store.get_file_by_path("p", "/p/x.ts").await.unwrap().is_some());

        resolver.process(&b, "const nothing = 1;\n").await.unwrap();
        assert!(store.get_file_by_path("p", "/p/x.ts").await.unwrap().is_none());
    }

    #[test]
    fn test_import_patterns_compile() {
        assert!(FROM_CLAUSE.is_some());
        assert!(SIDE_EFFECT.is_some());
    }
}
