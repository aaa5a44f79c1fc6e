//! Batched graph mutation: node merges, relationship merges, placeholders
//! and orphan cleanup.
//!
//! Every write is grouped so the store sees one statement per label (nodes)
//! or per `(type, from-label, to-label)` key (relationships). Endpoint
//! labels come from the batch itself, then from indexed lookups; only uuids
//! that no lookup finds fall back to a label-less match.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ragforge_graph_store::{
    ChangeKind, ContentStore, ENTITY_LABEL, FILE_LABEL, IngestState, MergeSummary, NodeRecord,
    NodeRow, PlaceholderRow, PropertyMap, PropertyValue, RelationshipKey, RelationshipRow, rel,
};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::changes::ContentDelta;
use crate::error::Result;
use crate::node::{ExtractorRegistry, NormalizedContent, ParsedNode};
use crate::parser::ParsedRelationship;
use crate::timeout::with_timeout;

/// A parsed node ready to be merged.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedNode {
    pub uuid: Uuid,
    pub label: &'static str,

    /// Owning file; `None` for global nodes.
    pub owner: Option<Uuid>,

    pub properties: PropertyMap,
    pub normalized: NormalizedContent,

    /// Hash of `normalized`.
    pub hash: String,
}

/// Counts from [`GraphWriter::write_nodes`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeWriteSummary {
    pub merged: MergeSummary,

    /// Nodes skipped because their stored hash already matched.
    pub unchanged: usize,

    /// Created and updated file-owned nodes, for change tracking.
    pub deltas: Vec<ContentDelta>,
}

/// Counts from [`GraphWriter::write_relationships`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelationshipWriteSummary {
    pub merged: usize,
    pub placeholders: usize,

    /// Rows that fell back to a label-less endpoint match.
    pub unlabeled: usize,

    /// Relationship groups whose merge failed and was skipped.
    pub failed_groups: usize,
}

/// Result of an orphan sweep over one file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrphanCleanup {
    pub deleted: Vec<Uuid>,
    pub deltas: Vec<ContentDelta>,
}

#[derive(Clone)]
pub struct GraphWriter {
    store: Arc<dyn ContentStore>,
    extractors: ExtractorRegistry,
    store_timeout: Duration,
}

impl GraphWriter {
    pub fn new(store: Arc<dyn ContentStore>, extractors: ExtractorRegistry, store_timeout: Duration) -> Self {
        Self {
            store,
            extractors,
            store_timeout,
        }
    }

    /// Normalize a parsed node and attach its content hash.
    pub fn prepare(&self, node: &ParsedNode, owner: Option<Uuid>) -> PreparedNode {
        let normalized = self.extractors.normalize(node);
        let hash = normalized.hash();
        let mut properties = node.properties();
        properties.insert("name".to_string(), normalized.name.as_str().into());
        properties.insert("content".to_string(), normalized.content.clone().into());
        properties.insert("description".to_string(), normalized.description.clone().into());
        PreparedNode {
            uuid: node.uuid(),
            label: node.label(),
            owner,
            properties,
            normalized,
            hash,
        }
    }

    /// Merge new or changed nodes, one statement per label, and attach
    /// file-owned ones to their file. Nodes whose stored hash matches are
    /// left untouched.
    pub async fn write_nodes(&self, nodes: &[PreparedNode]) -> Result<NodeWriteSummary> {
        let mut summary = NodeWriteSummary::default();
        if nodes.is_empty() {
            return Ok(summary);
        }

        let uuids: Vec<Uuid> = nodes.iter().map(|n| n.uuid).collect();
        let existing: HashMap<Uuid, NodeRecord> =
            with_timeout("get nodes", self.store_timeout, self.store.get_nodes(&uuids))
                .await?
                .into_iter()
                .map(|record| (record.uuid, record))
                .collect();

        let mut by_label: BTreeMap<&str, Vec<NodeRow>> = BTreeMap::new();
        let mut defined_in: BTreeMap<&str, Vec<RelationshipRow>> = BTreeMap::new();
        for node in nodes {
            let previous = existing.get(&node.uuid).filter(|p| !p.pending);
            if previous.is_some_and(|p| p.label == node.label && p.content_hash.as_deref() == Some(node.hash.as_str())) {
                summary.unchanged += 1;
                continue;
            }

            by_label.entry(node.label).or_default().push(NodeRow {
                uuid: node.uuid,
                properties: node.properties.clone(),
                content_hash: Some(node.hash.clone()),
                state: node.owner.map(|_| IngestState::Linked),
            });

            let Some(owner) = node.owner else {
                continue;
            };
            defined_in.entry(node.label).or_default().push(RelationshipRow {
                from: node.uuid,
                to: owner,
                properties: PropertyMap::new(),
            });
            summary.deltas.push(ContentDelta {
                entity_id: node.uuid,
                file_id: owner,
                kind: if previous.is_some() {
                    ChangeKind::Updated
                } else {
                    ChangeKind::Created
                },
                old_text: previous.and_then(stored_content),
                new_text: node.normalized.content.clone(),
                old_hash: previous.and_then(|p| p.content_hash.clone()),
                new_hash: Some(node.hash.clone()),
            });
        }

        for (label, rows) in &by_label {
            let merged = with_timeout(
                "merge nodes",
                self.store_timeout,
                self.store.merge_nodes(label, rows),
            )
            .await?;
            summary.merged.absorb(merged);
        }
        for (label, rows) in defined_in {
            let key = RelationshipKey::new(
                rel::DEFINED_IN,
                Some(label.to_string()),
                Some(FILE_LABEL.to_string()),
            );
            with_timeout(
                "merge relationships",
                self.store_timeout,
                self.store.merge_relationships(&key, &rows),
            )
            .await?;
        }

        debug!(
            "Wrote nodes: {} created, {} updated, {} reconciled, {} unchanged",
            summary.merged.created, summary.merged.updated, summary.merged.reconciled, summary.unchanged
        );
        Ok(summary)
    }

    /// Find labels for uuids the batch does not know by probing each
    /// candidate label with an indexed lookup.
    async fn lookup_labels(
        &self,
        labels: &mut HashMap<Uuid, String>,
        unresolved: Vec<Uuid>,
        candidates: &[String],
    ) {
        let mut remaining = unresolved;
        for label in candidates {
            if remaining.is_empty() {
                break;
            }
            match with_timeout(
                "find labeled",
                self.store_timeout,
                self.store.find_labeled(label, &remaining),
            )
            .await
            {
                Ok(found) => {
                    if found.is_empty() {
                        continue;
                    }
                    let found: HashSet<Uuid> = found.into_iter().collect();
                    remaining.retain(|uuid| !found.contains(uuid));
                    labels.extend(found.into_iter().map(|uuid| (uuid, label.clone())));
                }
                Err(e) => warn!("Label lookup for {label} failed: {e}"),
            }
        }
    }

    /// Merge relationships, one statement per `(type, from-label, to-label)`
    /// key, creating pending placeholders for missing targets first.
    ///
    /// Failed groups are logged and skipped: nodes already written stay.
    pub async fn write_relationships(
        &self,
        relationships: &[ParsedRelationship],
        known: &HashMap<Uuid, String>,
    ) -> RelationshipWriteSummary {
        let mut summary = RelationshipWriteSummary::default();
        if relationships.is_empty() {
            return summary;
        }

        let mut labels = known.clone();
        let unresolved: BTreeSet<Uuid> = relationships
            .iter()
            .flat_map(|r| [r.from, r.to])
            .filter(|uuid| !labels.contains_key(uuid))
            .collect();
        if !unresolved.is_empty() {
            let mut candidates: Vec<String> = Vec::new();
            let hinted = relationships.iter().filter_map(|r| r.target_label.clone());
            let fixed = ParsedNode::LABELS
                .into_iter()
                .chain([FILE_LABEL, ENTITY_LABEL])
                .map(str::to_string);
            for label in hinted.chain(fixed) {
                if !candidates.contains(&label) {
                    candidates.push(label);
                }
            }
            self.lookup_labels(&mut labels, unresolved.into_iter().collect(), &candidates)
                .await;
        }

        let mut placeholders: BTreeMap<Uuid, PlaceholderRow> = BTreeMap::new();
        for relationship in relationships {
            if labels.contains_key(&relationship.to) {
                continue;
            }
            if let Some(label) = &relationship.target_label {
                placeholders.entry(relationship.to).or_insert_with(|| PlaceholderRow {
                    uuid: relationship.to,
                    label: label.clone(),
                    properties: relationship.target_props.clone().unwrap_or_default(),
                });
            }
        }
        if !placeholders.is_empty() {
            let rows: Vec<PlaceholderRow> = placeholders.into_values().collect();
            match with_timeout(
                "create placeholders",
                self.store_timeout,
                self.store.create_placeholders(&rows),
            )
            .await
            {
                Ok(created) => {
                    summary.placeholders = created;
                    labels.extend(rows.into_iter().map(|row| (row.uuid, row.label)));
                }
                Err(e) => warn!("Creating {} placeholders failed: {e}", rows.len()),
            }
        }

        let mut groups: BTreeMap<RelationshipKey, Vec<RelationshipRow>> = BTreeMap::new();
        for relationship in relationships {
            let key = RelationshipKey::new(
                relationship.rel_type.as_str(),
                labels.get(&relationship.from).cloned(),
                labels.get(&relationship.to).cloned(),
            );
            groups.entry(key).or_default().push(RelationshipRow {
                from: relationship.from,
                to: relationship.to,
                properties: relationship.properties.clone(),
            });
        }

        for (key, rows) in groups {
            if !key.is_fully_labeled() {
                summary.unlabeled += rows.len();
                warn!("Unlabeled endpoint match for {key}: {} rows", rows.len());
            }
            match with_timeout(
                "merge relationships",
                self.store_timeout,
                self.store.merge_relationships(&key, &rows),
            )
            .await
            {
                Ok(merged) => {
                    trace!("Merged {merged}/{} {key} relationships", rows.len());
                    summary.merged += merged;
                }
                Err(e) => {
                    summary.failed_groups += 1;
                    warn!("Skipping {} {key} relationships: {e}", rows.len());
                }
            }
        }
        summary
    }

    /// Delete every node attached to `file_id` that is not in `keep`.
    /// With `capture`, the deleted nodes are returned as deltas.
    pub async fn delete_orphans(
        &self,
        file_id: Uuid,
        keep: &HashSet<Uuid>,
        capture: bool,
    ) -> Result<OrphanCleanup> {
        let previous: HashMap<Uuid, NodeRecord> = if capture {
            with_timeout("file nodes", self.store_timeout, self.store.file_nodes(file_id))
                .await?
                .into_iter()
                .map(|record| (record.uuid, record))
                .collect()
        } else {
            HashMap::new()
        };

        let deleted = with_timeout(
            "delete orphans",
            self.store_timeout,
            self.store.delete_orphans(file_id, keep),
        )
        .await?;
        if !deleted.is_empty() {
            debug!("Deleted {} orphan nodes of file {file_id}", deleted.len());
        }

        let deltas = deleted
            .iter()
            .filter_map(|uuid| previous.get(uuid))
            .map(|record| ContentDelta {
                entity_id: record.uuid,
                file_id,
                kind: ChangeKind::Deleted,
                old_text: stored_content(record),
                new_text: None,
                old_hash: record.content_hash.clone(),
                new_hash: None,
            })
            .collect();
        Ok(OrphanCleanup { deleted, deltas })
    }
}

fn stored_content(record: &NodeRecord) -> Option<String> {
    record
        .properties
        .get("content")
        .and_then(PropertyValue::as_str)
        .map(str::to_string)
}
