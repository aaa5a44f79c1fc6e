//! Post-link stages: entity extraction and embedding.
//!
//! ```text
//! linked ──► entities ──► embedding ──► embedded
//!    │           └──────────────────────►  ▲
//!    └─────────────────────────────────────┘  (nothing configured, or unchanged)
//! ```
//!
//! Only content nodes still in `linked` are sent to the extractor and the
//! embedder; nodes an earlier pass already embedded keep their vectors.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use ragforge_dedup::{EntityDeduplicator, ExtractedEntity, ExtractionResult};
use ragforge_embeddings::{EmbeddingProvider, validate_batch};
use ragforge_graph_store::{
    ENTITY_LABEL, ErrorStage, FileRecord, IngestState, NodeRecord, NodeRow, PropertyMap,
    PropertyValue, RelationshipKey, RelationshipRow, rel,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EnrichmentConfig;
use crate::error::{IngestError, Result};
use crate::identity::entity_id;
use crate::state_machine::{StateMachine, TransitionOptions, TransitionOutcome};
use crate::timeout::with_timeout;

/// Named-entity extraction service.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    fn name(&self) -> &str;

    /// Extract entities and relations from every text, returning one result
    /// per input in order.
    async fn extract_batch(&self, texts: &[String]) -> Result<Vec<ExtractionResult>>;
}

/// What happened to one file in the enrichment pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnrichOutcome {
    Embedded {
        entities: usize,
        mentions: usize,
        related: usize,
        embedded_nodes: usize,
    },

    /// Content matched the last enrichment; nodes were left alone.
    AlreadyEmbedded,

    /// The file was not `linked` when the pass tried to claim it.
    Skipped { current: Option<IngestState> },

    Failed { stage: ErrorStage, message: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct EntityCounts {
    entities: usize,
    mentions: usize,
    related: usize,
}

/// Drives linked files through entity extraction and embedding.
#[derive(Clone)]
pub struct EnrichmentPipeline {
    machine: StateMachine,
    extractor: Option<Arc<dyn EntityExtractor>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    deduplicator: Arc<EntityDeduplicator>,
    config: EnrichmentConfig,
}

impl EnrichmentPipeline {
    pub fn new(machine: StateMachine, config: EnrichmentConfig) -> Self {
        let deduplicator = Arc::new(EntityDeduplicator::new(config.dedup.clone()));
        Self {
            machine,
            extractor: None,
            embedder: None,
            deduplicator,
            config,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn EntityExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    /// Embed content nodes with `embedder`. The deduplicator uses it too.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.deduplicator = Arc::new(
            EntityDeduplicator::new(self.config.dedup.clone()).with_embedder(embedder.clone()),
        );
        self.embedder = Some(embedder);
        self
    }

    /// Replace the deduplicator, for example to inject an LLM resolver.
    pub fn with_deduplicator(mut self, deduplicator: EntityDeduplicator) -> Self {
        self.deduplicator = Arc::new(deduplicator);
        self
    }

    /// Enrich files one after another. Failures are recorded on the file.
    pub async fn enrich_files(&self, files: &[FileRecord]) -> Result<Vec<(Uuid, EnrichOutcome)>> {
        let mut outcomes = Vec::with_capacity(files.len());
        for file in files {
            outcomes.push((file.id, self.enrich_file(file).await?));
        }
        let embedded = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, EnrichOutcome::Embedded { .. }))
            .count();
        if embedded > 0 {
            info!("Enriched {embedded} of {} linked files", files.len());
        }
        Ok(outcomes)
    }

    /// Move one linked file to `embedded`.
    pub async fn enrich_file(&self, file: &FileRecord) -> Result<EnrichOutcome> {
        if file.content_hash.is_some() && file.embedded_content_hash == file.content_hash {
            let outcome = self
                .machine
                .transition(
                    file.id,
                    IngestState::Embedded,
                    TransitionOptions::default().expecting(&[IngestState::Linked]),
                )
                .await?;
            return Ok(if outcome.applied() {
                debug!("{} unchanged since last enrichment", file.path);
                EnrichOutcome::AlreadyEmbedded
            } else {
                skipped(outcome)
            });
        }

        let mut current = IngestState::Linked;
        let mut counts = EntityCounts::default();
        if let Some(extractor) = &self.extractor {
            let claim = self
                .machine
                .transition(
                    file.id,
                    IngestState::Entities,
                    TransitionOptions::default().expecting(&[current]),
                )
                .await?;
            if !claim.applied() {
                return Ok(skipped(claim));
            }
            current = IngestState::Entities;
            match self.extract_file_entities(file, extractor.as_ref()).await {
                Ok(extracted) => counts = extracted,
                Err(e) => return self.fail(file, ErrorStage::Entities, &e).await,
            }
        }

        let mut embedded_nodes = 0;
        if let Some(embedder) = &self.embedder {
            let claim = self
                .machine
                .transition(
                    file.id,
                    IngestState::Embedding,
                    TransitionOptions::default().expecting(&[current]),
                )
                .await?;
            if !claim.applied() {
                return Ok(skipped(claim));
            }
            current = IngestState::Embedding;
            let nodes = match self.linked_nodes(file).await {
                Ok(nodes) => nodes,
                Err(e) => return self.fail(file, ErrorStage::Embed, &e).await,
            };
            match self.embed_nodes(&nodes, embedder.as_ref()).await {
                Ok(count) => embedded_nodes = count,
                Err(e) => return self.fail(file, ErrorStage::Embed, &e).await,
            }
        } else {
            let nodes = self.linked_nodes(file).await?;
            let uuids: Vec<Uuid> = nodes.iter().map(|n| n.uuid).collect();
            if !uuids.is_empty() {
                with_timeout(
                    "set node states",
                    self.machine.store_timeout(),
                    self.machine.store().set_node_states(&uuids, IngestState::Embedded),
                )
                .await?;
            }
        }

        let mut options = TransitionOptions::default().expecting(&[current]);
        if let Some(hash) = &file.content_hash {
            options = options.with_embedded_content_hash(hash.clone());
        }
        let done = self
            .machine
            .transition(file.id, IngestState::Embedded, options)
            .await?;
        if !done.applied() {
            return Ok(skipped(done));
        }
        Ok(EnrichOutcome::Embedded {
            entities: counts.entities,
            mentions: counts.mentions,
            related: counts.related,
            embedded_nodes,
        })
    }

    /// Embed content nodes left in `linked` by a re-parse of a file that is
    /// itself already `embedded`. Returns the number of nodes handled.
    pub async fn enrich_linked_nodes(&self, limit: usize) -> Result<usize> {
        let store = self.machine.store();
        let timeout = self.machine.store_timeout();
        let ready = with_timeout(
            "linked nodes",
            timeout,
            store.nodes_in_state(IngestState::Linked, Some(IngestState::Embedded), limit),
        )
        .await?;
        if ready.is_empty() {
            return Ok(0);
        }

        let handled = match &self.embedder {
            Some(embedder) => self.embed_nodes(&ready, embedder.as_ref()).await?,
            None => {
                let uuids: Vec<Uuid> = ready.iter().map(|n| n.uuid).collect();
                with_timeout(
                    "set node states",
                    timeout,
                    store.set_node_states(&uuids, IngestState::Embedded),
                )
                .await?
            }
        };
        debug!("Node-level pass handled {handled} linked nodes");
        Ok(handled)
    }

    async fn fail(&self, file: &FileRecord, stage: ErrorStage, error: &IngestError) -> Result<EnrichOutcome> {
        let message = error.to_string();
        self.machine.fail(file.id, stage, message.clone()).await?;
        Ok(EnrichOutcome::Failed { stage, message })
    }

    async fn linked_nodes(&self, file: &FileRecord) -> Result<Vec<NodeRecord>> {
        let nodes = with_timeout(
            "file nodes",
            self.machine.store_timeout(),
            self.machine.store().file_nodes(file.id),
        )
        .await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.state == Some(IngestState::Linked))
            .collect())
    }

    fn text_of(&self, node: &NodeRecord) -> String {
        let text = node_text(node);
        match text.char_indices().nth(self.config.max_text_chars) {
            Some((end, _)) => text[..end].to_string(),
            None => text,
        }
    }

    async fn extract_file_entities(
        &self,
        file: &FileRecord,
        extractor: &dyn EntityExtractor,
    ) -> Result<EntityCounts> {
        let nodes = self.linked_nodes(file).await?;
        if nodes.is_empty() {
            return Ok(EntityCounts::default());
        }

        let mut results = Vec::with_capacity(nodes.len());
        for batch in nodes.chunks(self.config.effective_batch_size()) {
            let texts: Vec<String> = batch.iter().map(|n| self.text_of(n)).collect();
            let extracted = with_timeout(
                "extract entities",
                self.config.extract_timeout(),
                extractor.extract_batch(&texts),
            )
            .await?;
            if extracted.len() != texts.len() {
                return Err(IngestError::Entities(format!(
                    "{} returned {} results for {} texts",
                    extractor.name(),
                    extracted.len(),
                    texts.len()
                )));
            }
            results.extend(extracted);
        }
        for result in &mut results {
            result.retain_confident(self.config.min_confidence);
        }

        let all: Vec<ExtractedEntity> = results
            .iter()
            .flat_map(|r| r.entities.iter().cloned())
            .collect();
        let deduped = self.deduplicator.deduplicate(&all).await?;
        let canonical: HashMap<&str, &ExtractedEntity> = deduped
            .entities
            .iter()
            .map(|e| (e.name.as_str(), e))
            .collect();
        let uuid_of = |name: &str| {
            let name = deduped.canonical_name(name);
            canonical
                .get(name)
                .map(|entity| entity_id(&entity.entity_type, &entity.name))
        };

        let store = self.machine.store();
        let timeout = self.machine.store_timeout();
        let rows: Vec<NodeRow> = deduped
            .entities
            .iter()
            .map(|entity| NodeRow {
                uuid: entity_id(&entity.entity_type, &entity.name),
                properties: entity_properties(entity),
                content_hash: None,
                state: None,
            })
            .collect();
        if !rows.is_empty() {
            with_timeout("merge entities", timeout, store.merge_nodes(ENTITY_LABEL, &rows)).await?;
        }

        let mut mentions: BTreeMap<RelationshipKey, Vec<RelationshipRow>> = BTreeMap::new();
        for (node, result) in nodes.iter().zip(&results) {
            with_timeout(
                "clear mentions",
                timeout,
                store.delete_relationships_from(node.uuid, &[rel::MENTIONS]),
            )
            .await?;
            let mut seen = Vec::new();
            for entity in &result.entities {
                let Some(target) = uuid_of(&entity.name) else {
                    continue;
                };
                if seen.contains(&target) {
                    continue;
                }
                seen.push(target);
                let mut properties = PropertyMap::new();
                properties.insert("mention".to_string(), entity.name.as_str().into());
                if let Some(confidence) = entity.confidence {
                    properties.insert("confidence".to_string(), confidence.into());
                }
                let key = RelationshipKey::new(
                    rel::MENTIONS,
                    Some(node.label.clone()),
                    Some(ENTITY_LABEL.to_string()),
                );
                mentions.entry(key).or_default().push(RelationshipRow {
                    from: node.uuid,
                    to: target,
                    properties,
                });
            }
        }
        let mut mention_count = 0;
        for (key, rows) in mentions {
            mention_count +=
                with_timeout("merge mentions", timeout, store.merge_relationships(&key, &rows)).await?;
        }

        let relations: Vec<_> = results.iter().flat_map(|r| r.relations.iter().cloned()).collect();
        let related_rows: Vec<RelationshipRow> = deduped
            .canonicalize_relations(&relations)
            .into_iter()
            .filter_map(|relation| {
                let from = uuid_of(&relation.subject)?;
                let to = uuid_of(&relation.object)?;
                let mut properties = PropertyMap::new();
                properties.insert("predicate".to_string(), relation.predicate.into());
                if let Some(confidence) = relation.confidence {
                    properties.insert("confidence".to_string(), confidence.into());
                }
                Some(RelationshipRow {
                    from,
                    to,
                    properties,
                })
            })
            .collect();
        let related = if related_rows.is_empty() {
            0
        } else {
            let key = RelationshipKey::new(
                rel::RELATED_TO,
                Some(ENTITY_LABEL.to_string()),
                Some(ENTITY_LABEL.to_string()),
            );
            with_timeout(
                "merge entity relations",
                timeout,
                store.merge_relationships(&key, &related_rows),
            )
            .await?
        };

        if deduped.merged > 0 {
            debug!("{}: merged {} duplicate entities", file.path, deduped.merged);
        }
        Ok(EntityCounts {
            entities: rows.len(),
            mentions: mention_count,
            related,
        })
    }

    async fn embed_nodes(&self, nodes: &[NodeRecord], embedder: &dyn EmbeddingProvider) -> Result<usize> {
        let store = self.machine.store();
        let mut stored = 0;
        for batch in nodes.chunks(self.config.effective_batch_size()) {
            let texts: Vec<String> = batch.iter().map(|n| self.text_of(n)).collect();
            let vectors = with_timeout(
                "embed",
                self.config.embed_timeout(),
                embedder.embed_batch(&texts),
            )
            .await?;
            validate_batch(embedder, texts.len(), &vectors)?;
            let pairs: Vec<(Uuid, Vec<f32>)> = batch.iter().map(|n| n.uuid).zip(vectors).collect();
            stored += with_timeout(
                "store embeddings",
                self.machine.store_timeout(),
                store.store_embeddings(&pairs),
            )
            .await?;
        }
        if stored < nodes.len() {
            warn!("Stored {stored} of {} embeddings; the rest vanished", nodes.len());
        }
        Ok(stored)
    }
}

fn skipped(outcome: TransitionOutcome) -> EnrichOutcome {
    EnrichOutcome::Skipped {
        current: match outcome {
            TransitionOutcome::Rejected { current } => Some(current),
            TransitionOutcome::Applied { .. } | TransitionOutcome::Missing => None,
        },
    }
}

/// Text sent to the extractor and the embedder.
fn node_text(node: &NodeRecord) -> String {
    ["name", "description", "content"]
        .into_iter()
        .filter_map(|key| node.properties.get(key).and_then(PropertyValue::as_str))
        .filter(|text| !text.is_empty())
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn entity_properties(entity: &ExtractedEntity) -> PropertyMap {
    let mut properties = PropertyMap::new();
    properties.insert("name".to_string(), entity.name.as_str().into());
    properties.insert("entity_type".to_string(), entity.entity_type.as_str().into());
    if let Some(confidence) = entity.confidence {
        properties.insert("confidence".to_string(), confidence.into());
    }
    properties
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{file_id, node_id};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use ragforge_dedup::ExtractedRelation;
    use ragforge_embeddings::HashingProvider;
    use ragforge_graph_store::{ContentStore, FileIdentity, MemoryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Tags every capitalized word as a `thing`, and relates consecutive ones.
    #[derive(Default)]
    struct CapitalWords {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EntityExtractor for CapitalWords {
        fn name(&self) -> &str {
            "capital-words"
        }

        async fn extract_batch(&self, texts: &[String]) -> Result<Vec<ExtractionResult>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|text| {
                    let words: Vec<&str> = text
                        .split(|c: char| !c.is_alphanumeric())
                        .filter(|w| w.chars().next().is_some_and(char::is_uppercase))
                        .collect();
                    ExtractionResult {
                        entities: words
                            .iter()
                            .map(|w| ExtractedEntity::new(*w, "thing").with_confidence(0.9))
                            .collect(),
                        relations: words
                            .windows(2)
                            .map(|pair| ExtractedRelation::new(pair[0], "next_to", pair[1]))
                            .collect(),
                        processing_time_ms: 0.0,
                    }
                })
                .collect())
        }
    }

    struct Broken;

    #[async_trait]
    impl EntityExtractor for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        async fn extract_batch(&self, _texts: &[String]) -> Result<Vec<ExtractionResult>> {
            Err(IngestError::Entities("service unavailable".to_string()))
        }
    }

    async fn linked_file(store: &Arc<MemoryStore>, content: &str) -> FileRecord {
        let identity = FileIdentity {
            id: file_id("p", "/a.md"),
            path: "/a.md".to_string(),
            project_id: "p".to_string(),
        };
        store
            .create_file_if_absent(&identity, IngestState::Discovered, Utc::now())
            .await
            .unwrap();
        let machine = StateMachine::new(store.clone());
        for state in [IngestState::Parsing, IngestState::Parsed, IngestState::Linked] {
            let options = if state == IngestState::Linked {
                TransitionOptions::default().with_content_hash("h1")
            } else {
                TransitionOptions::default()
            };
            machine.transition(identity.id, state, options).await.unwrap();
        }

        let node = node_id("p", "/a.md", "section:Intro");
        let mut properties = PropertyMap::new();
        properties.insert("name".to_string(), "Intro".into());
        properties.insert("content".to_string(), content.into());
        store
            .merge_nodes(
                "Section",
                &[NodeRow {
                    uuid: node,
                    properties,
                    content_hash: Some("n1".to_string()),
                    state: Some(IngestState::Linked),
                }],
            )
            .await
            .unwrap();
        store
            .merge_relationships(
                &RelationshipKey::new(rel::DEFINED_IN, Some("Section".to_string()), Some("File".to_string())),
                &[RelationshipRow {
                    from: node,
                    to: identity.id,
                    properties: PropertyMap::new(),
                }],
            )
            .await
            .unwrap();
        store.get_file(identity.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_full_enrichment() {
        let store = Arc::new(MemoryStore::new());
        let file = linked_file(&store, "Rust and Tokio power Ragforge").await;
        let pipeline = EnrichmentPipeline::new(StateMachine::new(store.clone()), EnrichmentConfig::default())
            .with_extractor(Arc::new(CapitalWords::default()))
            .with_embedder(Arc::new(HashingProvider::new(16)));

        let outcome = pipeline.enrich_file(&file).await.unwrap();
        // "Intro" (the node name) plus three capitalized words in the content.
        assert_eq!(
            outcome,
            EnrichOutcome::Embedded {
                entities: 4,
                mentions: 4,
                related: 3,
                embedded_nodes: 1,
            }
        );

        let stored = store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(stored.state, IngestState::Embedded);
        assert_eq!(stored.embedded_content_hash.as_deref(), Some("h1"));
        let node = node_id("p", "/a.md", "section:Intro");
        assert!(store.embedding(node).await.is_some());
        assert_eq!(store.node(node).await.unwrap().state, Some(IngestState::Embedded));
        assert!(store.node(entity_id("thing", "Tokio")).await.is_some());
    }

    #[tokio::test]
    async fn test_unchanged_file_skips_work() {
        let store = Arc::new(MemoryStore::new());
        let file = linked_file(&store, "Alpha").await;
        let extractor = Arc::new(CapitalWords::default());
        let pipeline = EnrichmentPipeline::new(StateMachine::new(store.clone()), EnrichmentConfig::default())
            .with_extractor(extractor.clone());
        pipeline.enrich_file(&file).await.unwrap();

        // Relink with the same content hash.
        let machine = StateMachine::new(store.clone());
        for state in [
            IngestState::Discovered,
            IngestState::Parsing,
            IngestState::Parsed,
            IngestState::Linked,
        ] {
            machine
                .transition(file.id, state, TransitionOptions::default())
                .await
                .unwrap();
        }
        let relinked = store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(pipeline.enrich_file(&relinked).await.unwrap(), EnrichOutcome::AlreadyEmbedded);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_extractor_failure_records_entities_stage() {
        let store = Arc::new(MemoryStore::new());
        let file = linked_file(&store, "Alpha").await;
        let pipeline = EnrichmentPipeline::new(StateMachine::new(store.clone()), EnrichmentConfig::default())
            .with_extractor(Arc::new(Broken));

        let outcome = pipeline.enrich_file(&file).await.unwrap();
        assert!(matches!(
            outcome,
            EnrichOutcome::Failed {
                stage: ErrorStage::Entities,
                ..
            }
        ));
        let stored = store.get_file(file.id).await.unwrap().unwrap();
        assert_eq!(stored.state, IngestState::Error);
        assert_eq!(stored.error_type, Some(ErrorStage::Entities));
        assert_eq!(stored.retry_count, 1);
    }

    #[tokio::test]
    async fn test_linked_nodes_of_embedded_files() {
        let store = Arc::new(MemoryStore::new());
        let file = linked_file(&store, "Alpha").await;
        let pipeline = EnrichmentPipeline::new(StateMachine::new(store.clone()), EnrichmentConfig::default());
        pipeline.enrich_file(&file).await.unwrap();

        // A re-parse rewrote one node while the file stayed embedded.
        let node = node_id("p", "/a.md", "section:Intro");
        store.set_node_states(&[node], IngestState::Linked).await.unwrap();

        let pipeline = pipeline.with_embedder(Arc::new(HashingProvider::new(8)));
        assert_eq!(pipeline.enrich_linked_nodes(10).await.unwrap(), 1);
        assert_eq!(store.node(node).await.unwrap().state, Some(IngestState::Embedded));
        assert_eq!(store.embedding(node).await.unwrap().len(), 8);
    }

    #[tokio::test]
    async fn test_linked_nodes_of_unfinished_files_do_not_crowd_out_the_batch() {
        let store = Arc::new(MemoryStore::new());
        let file = linked_file(&store, "Alpha").await;
        let pipeline = EnrichmentPipeline::new(StateMachine::new(store.clone()), EnrichmentConfig::default());
        pipeline.enrich_file(&file).await.unwrap();
        let node = node_id("p", "/a.md", "section:Intro");
        store.set_node_states(&[node], IngestState::Linked).await.unwrap();

        // A second file still waiting for enrichment owns the lowest ids.
        let pending_file = FileIdentity {
            id: file_id("p", "/b.md"),
            path: "/b.md".to_string(),
            project_id: "p".to_string(),
        };
        store
            .create_file_if_absent(&pending_file, IngestState::Linked, Utc::now())
            .await
            .unwrap();
        let waiting = [Uuid::from_u128(1), Uuid::from_u128(2)];
        let rows: Vec<NodeRow> = waiting
            .iter()
            .map(|uuid| NodeRow {
                uuid: *uuid,
                properties: PropertyMap::new(),
                content_hash: None,
                state: Some(IngestState::Linked),
            })
            .collect();
        store.merge_nodes("Section", &rows).await.unwrap();
        let owned: Vec<RelationshipRow> = waiting
            .iter()
            .map(|uuid| RelationshipRow {
                from: *uuid,
                to: pending_file.id,
                properties: PropertyMap::new(),
            })
            .collect();
        store
            .merge_relationships(
                &RelationshipKey::new(rel::DEFINED_IN, Some("Section".to_string()), Some("File".to_string())),
                &owned,
            )
            .await
            .unwrap();

        let pipeline = pipeline.with_embedder(Arc::new(HashingProvider::new(8)));
        assert_eq!(pipeline.enrich_linked_nodes(2).await.unwrap(), 1);
        assert_eq!(store.node(node).await.unwrap().state, Some(IngestState::Embedded));
        for uuid in waiting {
            assert_eq!(store.node(uuid).await.unwrap().state, Some(IngestState::Linked));
        }
    }

    #[test]
    fn test_node_text_skips_missing_fields() {
        let mut properties = PropertyMap::new();
        properties.insert("name".to_string(), "Intro".into());
        properties.insert("description".to_string(), PropertyValue::Null);
        properties.insert("content".to_string(), "body".into());
        let node = NodeRecord {
            uuid: Uuid::nil(),
            label: "Section".to_string(),
            properties,
            content_hash: None,
            state: None,
            pending: false,
        };
        assert_eq!(node_text(&node), "Intro\n\nbody");
    }
}
