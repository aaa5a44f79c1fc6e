//! # Entity Deduplication
//!
//! Post-extraction pass that collapses near-duplicate named entities.
//!
//! - **Entities**: `ExtractedEntity`, `ExtractedRelation` and `ExtractionResult`
//!   as returned by an extraction service
//! - **Strategies**: fuzzy (Levenshtein), embedding (cosine), LLM-confirmed
//!   and hybrid
//! - **Canonicalization**: a canonical-name mapping applied to relations
//!
//! ```text
//! ExtractedEntity[] ──► group by type ──► union-find over matches
//!                                               │
//!                                               ▼
//!                     DedupResult { entities, canonical name map }
//! ```

pub mod deduplicator;
pub mod entity;
pub mod error;
pub mod levenshtein;

pub use deduplicator::{
    DedupConfig, DedupResult, DedupStrategy, EntityDeduplicator, LlmDecision, LlmResolver,
};
pub use entity::{ExtractedEntity, ExtractedRelation, ExtractionResult, normalize_name};
pub use error::{DedupError, Result};
