//! # Content Graph Store
//!
//! Storage boundary of the ingestion engine. It provides:
//!
//! - **ContentStore**: The async trait every backend implements
//! - **Model**: File records, lifecycle states, node and relationship rows
//! - **MemoryStore**: A complete in-memory backend used by tests and embedders
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        ContentStore                             │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  File ◄──DEFINED_IN── Scope / Section / Media ──HAS_CHUNK──►    │
//! │   │                        │                   EmbeddingChunk   │
//! │   ├──CONSUMES──► File      └──MENTIONS──► Entity                │
//! │   └──PENDING_IMPORT──► File                  │                  │
//! │                                              └──RELATED_TO──►   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

pub mod error;
pub mod memory;
pub mod model;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::{MemoryStore, StoreMetrics};
pub use model::{
    CHUNK_LABEL, Change, ChangeKind, DiscoverOutcome, ENTITY_LABEL, ErrorStage, FILE_LABEL,
    FileIdentity, FileRecord, IngestState, MergeSummary, NodeRecord, NodeRow, PlaceholderRow,
    PropertyMap, PropertyValue, RelationshipKey, RelationshipRecord, RelationshipRow,
    RetryUpdate, StateUpdate, TransitionGuard, TransitionRecord, rel,
};
pub use store::ContentStore;
