//! Parser interface and the built-in Markdown parser.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ragforge_graph_store::{PropertyMap, PropertyValue, rel};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::identity::node_id;
use crate::node::{ParsedNode, SectionNode, label};

/// One file handed to a parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub content: String,
}

/// Input of a parse call: one file, or many for the batch path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSpec {
    pub project_id: String,
    pub files: Vec<SourceFile>,
}

impl SourceSpec {
    pub fn single(project_id: impl Into<String>, path: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            files: vec![SourceFile {
                path: path.into(),
                content: content.into(),
            }],
        }
    }
}

/// A relationship emitted by a parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedRelationship {
    pub rel_type: String,
    pub from: Uuid,
    pub to: Uuid,

    #[serde(default)]
    pub properties: PropertyMap,

    /// Label of the target, used to create a placeholder when it does not
    /// exist yet.
    #[serde(default)]
    pub target_label: Option<String>,

    /// Minimal identity for that placeholder.
    #[serde(default)]
    pub target_props: Option<PropertyMap>,
}

impl ParsedRelationship {
    pub fn new(rel_type: impl Into<String>, from: Uuid, to: Uuid) -> Self {
        Self {
            rel_type: rel_type.into(),
            from,
            to,
            properties: PropertyMap::new(),
            target_label: None,
            target_props: None,
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Describe the target so a placeholder can stand in for it.
    pub fn with_target(mut self, label: impl Into<String>, props: PropertyMap) -> Self {
        self.target_label = Some(label.into());
        self.target_props = Some(props);
        self
    }
}

/// Nodes and relationships produced by one parse call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseResult {
    pub nodes: Vec<ParsedNode>,
    pub relationships: Vec<ParsedRelationship>,
}

impl ParseResult {
    pub fn extend(&mut self, other: ParseResult) {
        self.nodes.extend(other.nodes);
        self.relationships.extend(other.relationships);
    }
}

/// Turns raw file content into nodes and relationships.
///
/// A single call may cover many files; the processor relies on that for
/// its batch path.
#[async_trait]
pub trait Parser: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this parser handles `path`.
    fn supports(&self, _path: &str) -> bool {
        true
    }

    async fn parse(&self, spec: &SourceSpec) -> Result<ParseResult>;
}

/// Routes each file to the first parser that supports it. Files no parser
/// supports produce no nodes.
#[derive(Clone, Default)]
pub struct CompositeParser {
    parsers: Vec<Arc<dyn Parser>>,
}

impl CompositeParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parser(mut self, parser: Arc<dyn Parser>) -> Self {
        self.parsers.push(parser);
        self
    }
}

#[async_trait]
impl Parser for CompositeParser {
    fn name(&self) -> &str {
        "composite"
    }

    fn supports(&self, path: &str) -> bool {
        self.parsers.iter().any(|p| p.supports(path))
    }

    async fn parse(&self, spec: &SourceSpec) -> Result<ParseResult> {
        let mut routed: Vec<Vec<SourceFile>> = vec![Vec::new(); self.parsers.len()];
        for file in &spec.files {
            if let Some(index) = self.parsers.iter().position(|p| p.supports(&file.path)) {
                routed[index].push(file.clone());
            }
        }

        let mut result = ParseResult::default();
        for (parser, files) in self.parsers.iter().zip(routed) {
            if files.is_empty() {
                continue;
            }
            let sub = SourceSpec {
                project_id: spec.project_id.clone(),
                files,
            };
            result.extend(parser.parse(&sub).await?);
        }
        Ok(result)
    }
}

/// Splits Markdown documents into one `Section` node per heading, with
/// `CONTAINS` edges from each heading to its subheadings.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkdownParser;

impl MarkdownParser {
    const EXTENSIONS: [&'static str; 3] = [".md", ".markdown", ".mdx"];

    fn detect_header_level(line: &str) -> Option<u8> {
        let trimmed = line.trim();
        if !trimmed.starts_with('#') {
            return None;
        }

        let level = trimmed.chars().take_while(|c| *c == '#').count();
        if level <= 6 {
            let rest = &trimmed[level..];
            if rest.starts_with(' ') || rest.is_empty() {
                return u8::try_from(level).ok();
            }
        }
        None
    }

    fn parse_file(project_id: &str, file: &SourceFile) -> ParseResult {
        let mut builder = SectionBuilder::new(project_id, &file.path);
        let mut in_fence = false;

        for (index, line) in file.content.lines().enumerate() {
            let line_number = u32::try_from(index + 1).unwrap_or(u32::MAX);
            let trimmed = line.trim_start();
            if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
                in_fence = !in_fence;
            }
            match Self::detect_header_level(line).filter(|_| !in_fence) {
                Some(level) => {
                    let title = line.trim().trim_start_matches('#').trim().to_string();
                    builder.open(level, title, line_number);
                }
                None => builder.push_line(line, line_number),
            }
        }
        builder.finish()
    }
}

#[async_trait]
impl Parser for MarkdownParser {
    fn name(&self) -> &str {
        "markdown"
    }

    fn supports(&self, path: &str) -> bool {
        let lower = path.to_lowercase();
        Self::EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
    }

    async fn parse(&self, spec: &SourceSpec) -> Result<ParseResult> {
        let mut result = ParseResult::default();
        for file in &spec.files {
            result.extend(Self::parse_file(&spec.project_id, file));
        }
        Ok(result)
    }
}

struct OpenSection {
    uuid: Uuid,
    title: String,
    level: u8,
    start_line: u32,
    lines: Vec<String>,
}

/// Accumulates sections of one document.
struct SectionBuilder<'a> {
    project_id: &'a str,
    path: &'a str,
    stack: Vec<(u8, Uuid, String)>,
    current: Option<OpenSection>,
    seen: HashMap<String, usize>,
    result: ParseResult,
}

impl<'a> SectionBuilder<'a> {
    fn new(project_id: &'a str, path: &'a str) -> Self {
        Self {
            project_id,
            path,
            stack: Vec::new(),
            current: None,
            seen: HashMap::new(),
            result: ParseResult::default(),
        }
    }

    /// Heading path signature, numbered when a path repeats in the document.
    fn signature(&mut self, title: &str) -> String {
        let mut parts: Vec<&str> = self.stack.iter().map(|(_, _, t)| t.as_str()).collect();
        parts.push(title);
        let base = format!("section:{}", parts.join("/"));
        let count = self.seen.entry(base.clone()).or_insert(0);
        *count += 1;
        if *count == 1 { base } else { format!("{base}#{count}") }
    }

    fn open(&mut self, level: u8, title: String, line: u32) {
        self.close();
        while self.stack.last().is_some_and(|(l, _, _)| *l >= level) {
            self.stack.pop();
        }
        let signature = self.signature(&title);
        let uuid = node_id(self.project_id, self.path, &signature);

        if let Some((_, parent, _)) = self.stack.last() {
            let mut target = PropertyMap::new();
            target.insert("file".to_string(), self.path.into());
            target.insert("name".to_string(), title.as_str().into());
            self.result.relationships.push(
                ParsedRelationship::new(rel::CONTAINS, *parent, uuid)
                    .with_target(label::SECTION, target),
            );
        }

        self.stack.push((level, uuid, title.clone()));
        self.current = Some(OpenSection {
            uuid,
            title,
            level,
            start_line: line,
            lines: Vec::new(),
        });
    }

    fn push_line(&mut self, line: &str, line_number: u32) {
        if self.current.is_none() {
            if line.trim().is_empty() {
                return;
            }
            let title = self
                .path
                .rsplit('/')
                .next()
                .unwrap_or(self.path)
                .to_string();
            self.current = Some(OpenSection {
                uuid: node_id(self.project_id, self.path, "section:"),
                title,
                level: 0,
                start_line: line_number,
                lines: Vec::new(),
            });
        }
        if let Some(section) = &mut self.current {
            section.lines.push(line.to_string());
        }
    }

    fn close(&mut self) {
        let Some(section) = self.current.take() else {
            return;
        };
        let content = section.lines.join("\n").trim().to_string();
        self.result.nodes.push(ParsedNode::Section(SectionNode {
            uuid: section.uuid,
            file: self.path.to_string(),
            title: section.title,
            level: section.level,
            content,
            start_line: section.start_line,
            extra: PropertyMap::new(),
        }));
    }

    fn finish(mut self) -> ParseResult {
        self.close();
        self.result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sections(result: &ParseResult) -> Vec<(String, u8, String)> {
        result
            .nodes
            .iter()
            .filter_map(|n| match n {
                ParsedNode::Section(s) => Some((s.title.clone(), s.level, s.content.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_markdown_sections_and_containment() {
        let doc = "Intro text\n\n# Guide\nWelcome.\n\n## Install\nRun it.\n\n```sh\n# not a heading\n```\n## Usage\nUse it.\n# Appendix\n";
        let result = MarkdownParser
            .parse(&SourceSpec::single("p", "/docs/guide.md", doc))
            .await
            .unwrap();

        assert_eq!(
            sections(&result),
            vec![
                ("guide.md".to_string(), 0, "Intro text".to_string()),
                ("Guide".to_string(), 1, "Welcome.".to_string()),
                (
                    "Install".to_string(),
                    2,
                    "Run it.\n\n```sh\n# not a heading\n```".to_string()
                ),
                ("Usage".to_string(), 2, "Use it.".to_string()),
                ("Appendix".to_string(), 1, String::new()),
            ]
        );

        let guide = result.nodes[1].uuid();
        let children: Vec<Uuid> = result
            .relationships
            .iter()
            .filter(|r| r.from == guide)
            .map(|r| r.to)
            .collect();
        assert_eq!(children, vec![result.nodes[2].uuid(), result.nodes[3].uuid()]);
        assert!(result.relationships.iter().all(|r| r.rel_type == rel::CONTAINS));
    }

    #[tokio::test]
    async fn test_uuids_stable_across_body_edits() {
        let before = MarkdownParser
            .parse(&SourceSpec::single("p", "/a.md", "# A\none\n# B\ntwo\n"))
            .await
            .unwrap();
        let after = MarkdownParser
            .parse(&SourceSpec::single("p", "/a.md", "# A\nchanged\n# B\ntwo\n"))
            .await
            .unwrap();
        let ids = |r: &ParseResult| r.nodes.iter().map(ParsedNode::uuid).collect::<Vec<_>>();
        assert_eq!(ids(&before), ids(&after));
    }

    #[tokio::test]
    async fn test_repeated_headings_get_distinct_ids() {
        let result = MarkdownParser
            .parse(&SourceSpec::single("p", "/a.md", "# Notes\nx\n# Notes\ny\n"))
            .await
            .unwrap();
        assert_ne!(result.nodes[0].uuid(), result.nodes[1].uuid());
    }

    #[test]
    fn test_header_detection() {
        assert_eq!(MarkdownParser::detect_header_level("# Title"), Some(1));
        assert_eq!(MarkdownParser::detect_header_level("### Sub"), Some(3));
        assert_eq!(MarkdownParser::detect_header_level("#hashtag"), None);
        assert_eq!(MarkdownParser::detect_header_level("####### seven"), None);
        assert!(MarkdownParser.supports("/a/README.MD"));
        assert!(!MarkdownParser.supports("/a/main.rs"));
    }

    #[tokio::test]
    async fn test_composite_routes_by_support() {
        let parser = CompositeParser::new().with_parser(Arc::new(MarkdownParser));
        let spec = SourceSpec {
            project_id: "p".to_string(),
            files: vec![
                SourceFile {
                    path: "/a.md".to_string(),
                    content: "# A\n".to_string(),
                },
                SourceFile {
                    path: "/b.bin".to_string(),
                    content: "# B\n".to_string(),
                },
            ],
        };
        let result = parser.parse(&spec).await.unwrap();
        assert_eq!(result.nodes.len(), 1);
        assert!(!parser.supports("/b.bin"));
    }
}
