//! Entities and relations produced by an extraction service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A named entity pulled from content, before deduplication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedEntity {
    /// Entity text as it appeared in the content.
    pub name: String,

    /// Entity type (person, organization, technology, ...).
    #[serde(rename = "type")]
    pub entity_type: String,

    /// Confidence score in `[0, 1]`.
    #[serde(default)]
    pub confidence: Option<f64>,

    /// Character span `[start, end)` in the source text.
    #[serde(default)]
    pub span: Option<(usize, usize)>,

    /// Additional extractor-specific properties.
    #[serde(default)]
    pub properties: Option<BTreeMap<String, serde_json::Value>>,
}

impl ExtractedEntity {
    /// Create an entity with no confidence, span or properties.
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
            confidence: None,
            span: None,
            properties: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_span(mut self, start: usize, end: usize) -> Self {
        self.span = Some((start, end));
        self
    }

    /// Name used for comparisons: trimmed, lowercased, inner whitespace collapsed.
    pub fn normalized_name(&self) -> String {
        normalize_name(&self.name)
    }
}

/// Normalize an entity name for comparison.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// A relation between two extracted entities, referenced by name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedRelation {
    pub subject: String,
    pub predicate: String,
    pub object: String,

    #[serde(default)]
    pub confidence: Option<f64>,
}

impl ExtractedRelation {
    pub fn new(
        subject: impl Into<String>,
        predicate: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            predicate: predicate.into(),
            object: object.into(),
            confidence: None,
        }
    }
}

/// Extraction output for a single text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractionResult {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,

    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,

    #[serde(default)]
    pub processing_time_ms: f64,
}

impl ExtractionResult {
    /// Drop entities (and relations) whose confidence is below `min`.
    /// Missing confidence counts as certain.
    pub fn retain_confident(&mut self, min: f64) {
        self.entities
            .retain(|e| e.confidence.is_none_or(|c| c >= min));
        self.relations
            .retain(|r| r.confidence.is_none_or(|c| c >= min));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Nvidia   Corp "), "nvidia corp");
        assert_eq!(ExtractedEntity::new("NVIDIA", "org").normalized_name(), "nvidia");
    }

    #[test]
    fn test_deserialize_service_payload() {
        let json = r#"{
            "entities": [
                {"name": "Rust", "type": "technology", "confidence": 0.93, "span": [0, 4]},
                {"name": "Mozilla", "type": "organization"}
            ],
            "relations": [{"subject": "Mozilla", "predicate": "created", "object": "Rust"}],
            "processing_time_ms": 12.5
        }"#;
        let result: ExtractionResult = serde_json::from_str(json).unwrap();
        assert_eq!(result.entities[0].span, Some((0, 4)));
        assert_eq!(result.entities[1].entity_type, "organization");
        assert_eq!(result.relations[0].predicate, "created");
    }

    #[test]
    fn test_retain_confident() {
        let mut result = ExtractionResult {
            entities: vec![
                ExtractedEntity::new("a", "t").with_confidence(0.4),
                ExtractedEntity::new("b", "t").with_confidence(0.6),
                ExtractedEntity::new("c", "t"),
            ],
            relations: vec![],
            processing_time_ms: 0.0,
        };
        result.retain_confident(0.5);
        let names: Vec<&str> = result.entities.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }
}
