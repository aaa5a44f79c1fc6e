//! Parsed content nodes and their normalization.
//!
//! Parsers emit [`ParsedNode`]s: one variant per node kind, each with typed
//! fields plus an `extra` map for parser-specific metadata. Before writing,
//! every node is reduced to a [`NormalizedContent`] triple whose hash decides
//! whether the stored node needs rewriting.

use std::collections::HashMap;
use std::sync::Arc;

use ragforge_graph_store::{PropertyMap, PropertyValue};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::content_hash;

/// Node label names.
pub mod label {
    pub const SCOPE: &str = "Scope";
    pub const SECTION: &str = "Section";
    pub const MEDIA: &str = "Media";
    pub const DIRECTORY: &str = "Directory";
    pub const EXTERNAL_LIBRARY: &str = "ExternalLibrary";
}

/// The `{name, content, description}` triple every node reduces to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedContent {
    pub name: String,

    /// Absent for container nodes.
    pub content: Option<String>,

    pub description: Option<String>,
}

impl NormalizedContent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: None,
            description: None,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_description(mut self, description: Option<String>) -> Self {
        self.description = description;
        self
    }

    /// Hash of the triple. Changes iff one of the three fields changes.
    pub fn hash(&self) -> String {
        // Length prefixes keep field boundaries unambiguous.
        let field = |value: Option<&str>| match value {
            Some(v) => format!("{}:{v}", v.len()),
            None => "-".to_string(),
        };
        content_hash(&format!(
            "{}|{}|{}",
            field(Some(&self.name)),
            field(self.content.as_deref()),
            field(self.description.as_deref())
        ))
    }

    /// Text handed to extractors and embedders.
    pub fn text(&self) -> String {
        let mut parts = vec![self.name.as_str()];
        if let Some(description) = &self.description {
            parts.push(description);
        }
        if let Some(content) = &self.content {
            parts.push(content);
        }
        parts.join("\n\n")
    }
}

/// A code scope (function, class, method, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeNode {
    pub uuid: Uuid,
    pub file: String,
    pub name: String,

    /// `function`, `class`, `method`, ...
    pub kind: String,
    pub signature: Option<String>,
    pub source: String,
    pub docstring: Option<String>,
    pub start_line: u32,
    pub end_line: u32,

    #[serde(default)]
    pub extra: PropertyMap,
}

/// A document section under one heading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectionNode {
    pub uuid: Uuid,
    pub file: String,
    pub title: String,

    /// Heading depth; 0 for text before the first heading.
    pub level: u8,
    pub content: String,
    pub start_line: u32,

    #[serde(default)]
    pub extra: PropertyMap,
}

/// An image, video or other binary asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaNode {
    pub uuid: Uuid,
    pub file: String,
    pub media_type: String,
    pub title: Option<String>,

    /// Caption or generated description.
    pub description: Option<String>,

    #[serde(default)]
    pub extra: PropertyMap,
}

/// A directory. Shared by every file below it, so not owned by one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryNode {
    pub uuid: Uuid,
    pub path: String,

    #[serde(default)]
    pub extra: PropertyMap,
}

/// A third-party package referenced by source files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalLibraryNode {
    pub uuid: Uuid,
    pub name: String,
    pub version: Option<String>,

    #[serde(default)]
    pub extra: PropertyMap,
}

/// A node emitted by a parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node_type", rename_all = "snake_case")]
pub enum ParsedNode {
    Scope(ScopeNode),
    Section(SectionNode),
    Media(MediaNode),
    Directory(DirectoryNode),
    ExternalLibrary(ExternalLibraryNode),
}

impl ParsedNode {
    /// Every label a parsed node can carry.
    pub const LABELS: [&'static str; 5] = [
        label::SCOPE,
        label::SECTION,
        label::MEDIA,
        label::DIRECTORY,
        label::EXTERNAL_LIBRARY,
    ];

    pub fn uuid(&self) -> Uuid {
        match self {
            Self::Scope(n) => n.uuid,
            Self::Section(n) => n.uuid,
            Self::Media(n) => n.uuid,
            Self::Directory(n) => n.uuid,
            Self::ExternalLibrary(n) => n.uuid,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Scope(_) => label::SCOPE,
            Self::Section(_) => label::SECTION,
            Self::Media(_) => label::MEDIA,
            Self::Directory(_) => label::DIRECTORY,
            Self::ExternalLibrary(_) => label::EXTERNAL_LIBRARY,
        }
    }

    /// Path of the owning file; `None` for global nodes.
    pub fn owner_file(&self) -> Option<&str> {
        match self {
            Self::Scope(n) => Some(&n.file),
            Self::Section(n) => Some(&n.file),
            Self::Media(n) => Some(&n.file),
            Self::Directory(_) | Self::ExternalLibrary(_) => None,
        }
    }

    pub fn extra(&self) -> &PropertyMap {
        match self {
            Self::Scope(n) => &n.extra,
            Self::Section(n) => &n.extra,
            Self::Media(n) => &n.extra,
            Self::Directory(n) => &n.extra,
            Self::ExternalLibrary(n) => &n.extra,
        }
    }

    /// Reduce the node to its normalized triple.
    pub fn normalize(&self) -> NormalizedContent {
        match self {
            Self::Scope(n) => NormalizedContent::new(&n.name)
                .with_content(&n.source)
                .with_description(n.docstring.clone()),
            Self::Section(n) => NormalizedContent::new(&n.title).with_content(&n.content),
            Self::Media(n) => NormalizedContent {
                name: n.title.clone().unwrap_or_else(|| file_name(&n.file).to_string()),
                content: None,
                description: n.description.clone(),
            },
            Self::Directory(n) => NormalizedContent::new(file_name(&n.path)),
            Self::ExternalLibrary(n) => NormalizedContent::new(&n.name)
                .with_description(n.version.as_ref().map(|v| format!("version {v}"))),
        }
    }

    /// Typed fields plus `extra`, as stored on the graph node. Typed fields
    /// win over `extra` entries with the same key.
    pub fn properties(&self) -> PropertyMap {
        let mut props = self.extra().clone();
        let mut set = |key: &str, value: PropertyValue| {
            props.insert(key.to_string(), value);
        };
        match self {
            Self::Scope(n) => {
                set("file", n.file.as_str().into());
                set("kind", n.kind.as_str().into());
                set("signature", n.signature.clone().into());
                set("start_line", n.start_line.into());
                set("end_line", n.end_line.into());
            }
            Self::Section(n) => {
                set("file", n.file.as_str().into());
                set("level", u32::from(n.level).into());
                set("start_line", n.start_line.into());
            }
            Self::Media(n) => {
                set("file", n.file.as_str().into());
                set("media_type", n.media_type.as_str().into());
            }
            Self::Directory(n) => {
                set("path", n.path.as_str().into());
            }
            Self::ExternalLibrary(n) => {
                set("version", n.version.clone().into());
            }
        }
        props
    }
}

fn file_name(path: &str) -> &str {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(path)
}

/// Reduces a node to its normalized triple.
pub trait FieldExtractor: Send + Sync {
    fn extract(&self, node: &ParsedNode) -> NormalizedContent;
}

/// Uses each variant's own normalization.
#[derive(Debug, Clone, Copy, Default)]
pub struct VariantExtractor;

impl FieldExtractor for VariantExtractor {
    fn extract(&self, node: &ParsedNode) -> NormalizedContent {
        node.normalize()
    }
}

/// Label → extractor map, built once and handed to the processor.
#[derive(Clone)]
pub struct ExtractorRegistry {
    extractors: HashMap<String, Arc<dyn FieldExtractor>>,
    fallback: Arc<dyn FieldExtractor>,
}

impl ExtractorRegistry {
    /// Registry where every label uses [`VariantExtractor`].
    pub fn new() -> Self {
        Self {
            extractors: HashMap::new(),
            fallback: Arc::new(VariantExtractor),
        }
    }

    /// Override the extractor for one label.
    pub fn with_extractor(mut self, label: impl Into<String>, extractor: Arc<dyn FieldExtractor>) -> Self {
        self.extractors.insert(label.into(), extractor);
        self
    }

    pub fn normalize(&self, node: &ParsedNode) -> NormalizedContent {
        self.extractors
            .get(node.label())
            .unwrap_or(&self.fallback)
            .extract(node)
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::node_id;
    use pretty_assertions::assert_eq;

    fn scope(source: &str) -> ParsedNode {
        ParsedNode::Scope(ScopeNode {
            uuid: node_id("p", "/a.ts", "function:foo"),
            file: "/a.ts".to_string(),
            name: "foo".to_string(),
            kind: "function".to_string(),
            signature: Some("foo()".to_string()),
            source: source.to_string(),
            docstring: None,
            start_line: 1,
            end_line: 3,
            extra: PropertyMap::new(),
        })
    }

    struct UpperName;

    impl FieldExtractor for UpperName {
        fn extract(&self, node: &ParsedNode) -> NormalizedContent {
            let mut normalized = node.normalize();
            normalized.name = normalized.name.to_uppercase();
            normalized
        }
    }

    #[test]
    fn test_hash_tracks_content() {
        let a = scope("function foo() { return 1 }").normalize();
        let b = scope("function foo() { return 1 }").normalize();
        let c = scope("function foo() { return 2 }").normalize();
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_hash_separates_fields() {
        let a = NormalizedContent::new("ab").with_content("c");
        let b = NormalizedContent::new("a").with_content("bc");
        let c = NormalizedContent::new("ab");
        assert_ne!(a.hash(), b.hash());
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn test_global_nodes_have_no_owner() {
        let dir = ParsedNode::Directory(DirectoryNode {
            uuid: node_id("p", "/src", "directory"),
            path: "/src/".to_string(),
            extra: PropertyMap::new(),
        });
        assert_eq!(dir.owner_file(), None);
        assert_eq!(dir.normalize().name, "src");
        assert_eq!(scope("x").owner_file(), Some("/a.ts"));
    }

    #[test]
    fn test_registry_override() {
        let registry = ExtractorRegistry::new().with_extractor(label::SCOPE, Arc::new(UpperName));
        assert_eq!(registry.normalize(&scope("x")).name, "FOO");
        assert_eq!(ExtractorRegistry::default().normalize(&scope("x")).name, "foo");
    }

    #[test]
    fn test_properties_merge_extra() {
        let mut node = scope("x");
        if let ParsedNode::Scope(s) = &mut node {
            s.extra.insert("language".into(), "typescript".into());
            s.extra.insert("kind".into(), "bogus".into());
        }
        let props = node.properties();
        assert_eq!(props["language"], PropertyValue::from("typescript"));
        assert_eq!(props["kind"], PropertyValue::from("function"));
        assert_eq!(props["start_line"], PropertyValue::Int(1));
    }
}
