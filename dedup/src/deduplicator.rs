//! Layered entity deduplication.
//!
//! Entities are clustered with a union-find over pairwise matches. Which
//! pairs match depends on the [`DedupStrategy`]; the canonical entity of a
//! cluster is chosen afterwards, so the result never depends on comparison
//! order.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use ordered_float::OrderedFloat;
use ragforge_embeddings::{Embedding, EmbeddingProvider, cosine_similarity};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::entity::{ExtractedEntity, ExtractedRelation};
use crate::error::{DedupError, Result};
use crate::levenshtein::similarity_at_least;

/// How candidate duplicates are detected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    /// Normalized Levenshtein similarity.
    #[default]
    Fuzzy,
    /// Cosine similarity of name embeddings.
    Embedding,
    /// Relaxed fuzzy candidates confirmed by an LLM resolver.
    Llm,
    /// Fuzzy candidates re-scored with embeddings.
    Hybrid,
}

/// Configuration for the deduplicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    pub strategy: DedupStrategy,

    /// Minimum Levenshtein similarity for the fuzzy strategy.
    pub fuzzy_threshold: f64,

    /// Minimum cosine (or hybrid) score for the embedding-based strategies.
    pub embedding_threshold: f64,

    /// Relaxed fuzzy threshold producing LLM candidates.
    pub llm_candidate_threshold: f64,

    /// Fuzzy threshold producing hybrid candidates.
    pub hybrid_candidate_threshold: f64,

    /// Weight of the fuzzy score in the hybrid combination.
    pub hybrid_fuzzy_weight: f64,

    /// Only compare entities of the same type.
    pub same_type_only: bool,

    /// Entity types whose names carry no semantic signal (prices, dates, ...).
    /// Embedding-based strategies fall back to fuzzy matching for them.
    pub skip_embedding_types: Vec<String>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            strategy: DedupStrategy::Fuzzy,
            fuzzy_threshold: 0.85,
            embedding_threshold: 0.9,
            llm_candidate_threshold: 0.6,
            hybrid_candidate_threshold: 0.7,
            hybrid_fuzzy_weight: 0.4,
            same_type_only: true,
            skip_embedding_types: [
                "price", "date", "quantity", "amount", "currency", "size", "duration",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl DedupConfig {
    pub fn with_strategy(mut self, strategy: DedupStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_fuzzy_threshold(mut self, threshold: f64) -> Self {
        self.fuzzy_threshold = threshold;
        self
    }

    pub fn with_embedding_threshold(mut self, threshold: f64) -> Self {
        self.embedding_threshold = threshold;
        self
    }

    pub fn with_same_type_only(mut self, same_type_only: bool) -> Self {
        self.same_type_only = same_type_only;
        self
    }

    /// Check every threshold lies in `[0, 1]`.
    pub fn validate(&self) -> Result<()> {
        let thresholds = [
            ("fuzzy_threshold", self.fuzzy_threshold),
            ("embedding_threshold", self.embedding_threshold),
            ("llm_candidate_threshold", self.llm_candidate_threshold),
            ("hybrid_candidate_threshold", self.hybrid_candidate_threshold),
            ("hybrid_fuzzy_weight", self.hybrid_fuzzy_weight),
        ];
        for (name, value) in thresholds {
            if !(0.0..=1.0).contains(&value) {
                return Err(DedupError::InvalidThreshold { name, value });
            }
        }
        Ok(())
    }

    fn skips_embedding(&self, entity_type: &str) -> bool {
        self.skip_embedding_types
            .iter()
            .any(|t| t.eq_ignore_ascii_case(entity_type))
    }
}

/// Verdict of an [`LlmResolver`] on one candidate pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmDecision {
    pub same_entity: bool,

    /// Preferred name for the merged entity, if the resolver has one.
    pub canonical_name: Option<String>,
}

/// Final same/different judge for the LLM strategy.
#[async_trait]
pub trait LlmResolver: Send + Sync {
    /// Decide every candidate pair, returning one decision per pair in order.
    async fn resolve(
        &self,
        candidates: &[(ExtractedEntity, ExtractedEntity)],
    ) -> Result<Vec<LlmDecision>>;
}

/// Output of [`EntityDeduplicator::deduplicate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DedupResult {
    /// One entity per cluster, in order of first occurrence.
    pub entities: Vec<ExtractedEntity>,

    /// Every input name mapped to its canonical name.
    pub canonical: HashMap<String, String>,

    /// Number of input entities folded into another.
    pub merged: usize,
}

impl DedupResult {
    /// Canonical name for `name`, or `name` itself when unknown.
    pub fn canonical_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.canonical.get(name).map_or(name, String::as_str)
    }

    /// Rewrite relation endpoints onto canonical names, dropping self-loops
    /// and duplicate (subject, predicate, object) triples.
    pub fn canonicalize_relations(&self, relations: &[ExtractedRelation]) -> Vec<ExtractedRelation> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for relation in relations {
            let subject = self.canonical_name(&relation.subject).to_string();
            let object = self.canonical_name(&relation.object).to_string();
            if subject == object {
                continue;
            }
            if !seen.insert((subject.clone(), relation.predicate.clone(), object.clone())) {
                continue;
            }
            out.push(ExtractedRelation {
                subject,
                predicate: relation.predicate.clone(),
                object,
                confidence: relation.confidence,
            });
        }
        out
    }
}

struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, i: usize) -> usize {
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut node = i;
        while self.parent[node] != root {
            let next = self.parent[node];
            self.parent[node] = root;
            node = next;
        }
        root
    }

    /// Join two sets, keeping the smaller index as root.
    fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        let (root, child) = if ra < rb { (ra, rb) } else { (rb, ra) };
        self.parent[child] = root;
        true
    }
}

/// Collapses near-duplicate extracted entities.
pub struct EntityDeduplicator {
    config: DedupConfig,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    resolver: Option<Arc<dyn LlmResolver>>,
}

impl EntityDeduplicator {
    /// Create a deduplicator without collaborators.
    pub fn new(config: DedupConfig) -> Self {
        Self {
            config,
            embedder: None,
            resolver: None,
        }
    }

    /// Inject the provider used by the embedding and hybrid strategies.
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Inject the resolver used by the LLM strategy.
    pub fn with_resolver(mut self, resolver: Arc<dyn LlmResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Deduplicate `entities` into canonical entities and a name mapping.
    pub async fn deduplicate(&self, entities: &[ExtractedEntity]) -> Result<DedupResult> {
        self.config.validate()?;
        if entities.is_empty() {
            return Ok(DedupResult::default());
        }

        let normalized: Vec<String> = entities.iter().map(ExtractedEntity::normalized_name).collect();
        let mut clusters = UnionFind::new(entities.len());
        let groups = self.groups(entities);

        // Identical normalized names always merge.
        for members in groups.values() {
            let mut first_by_name: HashMap<&str, usize> = HashMap::new();
            for &i in members {
                match first_by_name.get(normalized[i].as_str()) {
                    Some(&first) => {
                        clusters.union(first, i);
                    }
                    None => {
                        first_by_name.insert(normalized[i].as_str(), i);
                    }
                }
            }
        }

        let mut suggestions: HashMap<usize, String> = HashMap::new();
        match self.config.strategy {
            DedupStrategy::Fuzzy => {
                for members in groups.values() {
                    self.fuzzy_pass(members, &normalized, self.config.fuzzy_threshold, &mut clusters);
                }
            }
            DedupStrategy::Embedding => {
                let vectors = self.embed_names(entities, &normalized).await?;
                for members in groups.values() {
                    self.embedding_pass(entities, members, &normalized, &vectors, &mut clusters)?;
                }
            }
            DedupStrategy::Hybrid => {
                let vectors = self.embed_names(entities, &normalized).await?;
                for members in groups.values() {
                    self.embedding_pass(entities, members, &normalized, &vectors, &mut clusters)?;
                    self.hybrid_pass(entities, members, &normalized, &vectors, &mut clusters)?;
                }
            }
            DedupStrategy::Llm => {
                self.llm_pass(entities, &groups, &normalized, &mut clusters, &mut suggestions)
                    .await?;
            }
        }

        Ok(self.collect(entities, &mut clusters, &suggestions))
    }

    /// Comparison groups: by type when same-type grouping is on, else one group.
    fn groups(&self, entities: &[ExtractedEntity]) -> BTreeMap<String, Vec<usize>> {
        let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for (i, entity) in entities.iter().enumerate() {
            let key = if self.config.same_type_only {
                entity.entity_type.to_lowercase()
            } else {
                String::new()
            };
            groups.entry(key).or_default().push(i);
        }
        groups
    }

    fn fuzzy_pass(
        &self,
        members: &[usize],
        normalized: &[String],
        threshold: f64,
        clusters: &mut UnionFind,
    ) {
        for (pos, &i) in members.iter().enumerate() {
            for &j in &members[pos + 1..] {
                if similarity_at_least(&normalized[i], &normalized[j], threshold).is_some() {
                    clusters.union(i, j);
                }
            }
        }
    }

    fn embeddable(&self, entity: &ExtractedEntity) -> bool {
        !self.config.skips_embedding(&entity.entity_type)
    }

    /// Embed each distinct normalized name once.
    async fn embed_names(
        &self,
        entities: &[ExtractedEntity],
        normalized: &[String],
    ) -> Result<HashMap<String, Embedding>> {
        let embedder = self
            .embedder
            .as_ref()
            .ok_or(DedupError::MissingEmbedder(self.config.strategy))?;

        let mut names: Vec<String> = entities
            .iter()
            .zip(normalized)
            .filter(|(entity, _)| self.embeddable(entity))
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        names.dedup();
        if names.is_empty() {
            return Ok(HashMap::new());
        }

        debug!("Embedding {} distinct entity names with {}", names.len(), embedder.name());
        let vectors = embedder.embed_batch(&names).await?;
        ragforge_embeddings::validate_batch(embedder.as_ref(), names.len(), &vectors)?;
        Ok(names.into_iter().zip(vectors).collect())
    }

    fn cosine(
        vectors: &HashMap<String, Embedding>,
        a: &str,
        b: &str,
    ) -> Result<Option<f64>> {
        match (vectors.get(a), vectors.get(b)) {
            (Some(va), Some(vb)) => Ok(Some(f64::from(cosine_similarity(va, vb)?))),
            _ => Ok(None),
        }
    }

    fn embedding_pass(
        &self,
        entities: &[ExtractedEntity],
        members: &[usize],
        normalized: &[String],
        vectors: &HashMap<String, Embedding>,
        clusters: &mut UnionFind,
    ) -> Result<()> {
        let (semantic, lexical): (Vec<usize>, Vec<usize>) =
            members.iter().copied().partition(|&i| self.embeddable(&entities[i]));

        self.fuzzy_pass(&lexical, normalized, self.config.fuzzy_threshold, clusters);

        for (pos, &i) in semantic.iter().enumerate() {
            for &j in &semantic[pos + 1..] {
                let score = Self::cosine(vectors, &normalized[i], &normalized[j])?;
                if score.is_some_and(|s| s >= self.config.embedding_threshold) {
                    clusters.union(i, j);
                }
            }
        }
        Ok(())
    }

    fn hybrid_pass(
        &self,
        entities: &[ExtractedEntity],
        members: &[usize],
        normalized: &[String],
        vectors: &HashMap<String, Embedding>,
        clusters: &mut UnionFind,
    ) -> Result<()> {
        let fuzzy_weight = self.config.hybrid_fuzzy_weight;
        for (pos, &i) in members.iter().enumerate() {
            for &j in &members[pos + 1..] {
                if !self.embeddable(&entities[i]) || !self.embeddable(&entities[j]) {
                    continue;
                }
                let Some(fuzzy) = similarity_at_least(
                    &normalized[i],
                    &normalized[j],
                    self.config.hybrid_candidate_threshold,
                ) else {
                    continue;
                };
                let Some(semantic) = Self::cosine(vectors, &normalized[i], &normalized[j])? else {
                    continue;
                };
                let combined = fuzzy_weight * fuzzy + (1.0 - fuzzy_weight) * semantic;
                if combined >= self.config.embedding_threshold {
                    clusters.union(i, j);
                }
            }
        }
        Ok(())
    }

    async fn llm_pass(
        &self,
        entities: &[ExtractedEntity],
        groups: &BTreeMap<String, Vec<usize>>,
        normalized: &[String],
        clusters: &mut UnionFind,
        suggestions: &mut HashMap<usize, String>,
    ) -> Result<()> {
        let resolver = self.resolver.as_ref().ok_or(DedupError::MissingResolver)?;

        let mut pairs = Vec::new();
        for members in groups.values() {
            for (pos, &i) in members.iter().enumerate() {
                for &j in &members[pos + 1..] {
                    if clusters.find(i) == clusters.find(j) {
                        continue;
                    }
                    if similarity_at_least(
                        &normalized[i],
                        &normalized[j],
                        self.config.llm_candidate_threshold,
                    )
                    .is_some()
                    {
                        pairs.push((i, j));
                    }
                }
            }
        }
        if pairs.is_empty() {
            return Ok(());
        }

        let candidates: Vec<(ExtractedEntity, ExtractedEntity)> = pairs
            .iter()
            .map(|&(i, j)| (entities[i].clone(), entities[j].clone()))
            .collect();
        let decisions = resolver.resolve(&candidates).await?;
        if decisions.len() != pairs.len() {
            return Err(DedupError::Resolver(format!(
                "expected {} decisions, got {}",
                pairs.len(),
                decisions.len()
            )));
        }

        for ((i, j), decision) in pairs.into_iter().zip(decisions) {
            if !decision.same_entity {
                continue;
            }
            clusters.union(i, j);
            if let Some(name) = decision.canonical_name {
                let owner = if entities[j].name == name { j } else { i };
                suggestions.insert(owner, name);
            }
        }
        Ok(())
    }

    fn collect(
        &self,
        entities: &[ExtractedEntity],
        clusters: &mut UnionFind,
        suggestions: &HashMap<usize, String>,
    ) -> DedupResult {
        let mut members: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for i in 0..entities.len() {
            members.entry(clusters.find(i)).or_default().push(i);
        }

        let mut result = DedupResult::default();
        for (_, cluster) in members {
            let chosen = cluster
                .iter()
                .copied()
                .max_by_key(|&i| {
                    let entity = &entities[i];
                    (
                        OrderedFloat(entity.confidence.unwrap_or(f64::NEG_INFINITY)),
                        entity.name.chars().count(),
                        Reverse(i),
                    )
                })
                .unwrap_or(cluster[0]);

            let mut canonical = entities[chosen].clone();
            if let Some(name) = cluster.iter().find_map(|i| suggestions.get(i)) {
                canonical.name = name.clone();
            }
            if cluster.len() > 1 {
                debug!(
                    "Merged {} entities into {:?} ({})",
                    cluster.len(),
                    canonical.name,
                    canonical.entity_type
                );
            }

            for &i in &cluster {
                let name = &entities[i].name;
                if let Some(previous) = result.canonical.get(name)
                    && *previous != canonical.name
                {
                    warn!(
                        "Entity name {name:?} maps to both {previous:?} and {:?}",
                        canonical.name
                    );
                    continue;
                }
                result.canonical.insert(name.clone(), canonical.name.clone());
            }
            result.merged += cluster.len() - 1;
            result.entities.push(canonical);
        }
        result
    }
}
