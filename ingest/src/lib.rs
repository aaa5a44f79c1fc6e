//! # Incremental Ingestion
//!
//! This crate turns source files into content-graph mutations and keeps the
//! graph in step as files change:
//!
//! - **StateMachine**: Guarded per-file lifecycle transitions
//! - **BatchIngestionProcessor**: Read, hash, parse and write files in batches
//! - **ReferenceResolver**: Import edges between files, including forward references
//! - **EnrichmentPipeline**: Entity extraction and embedding of linked content
//! - **ProcessingLoop**: The scheduler that drains the queues
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        ProcessingLoop                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  discovered ──► BatchIngestionProcessor ──► linked              │
//! │                   │        │         │                          │
//! │                   ▼        ▼         ▼                          │
//! │             Parser   GraphWriter  ReferenceResolver             │
//! │                                                                 │
//! │  linked ──► EnrichmentPipeline ──► embedded                     │
//! │                   │        │                                    │
//! │                   ▼        ▼                                    │
//! │        EntityExtractor  EmbeddingProvider                       │
//! │        + Deduplicator                                           │
//! │                                                                 │
//! │  every transition ──► StateMachine ──► ContentStore             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ragforge_ingest::{BatchIngestionProcessor, DiskSource, MarkdownParser, ProcessingLoop};
//!
//! let machine = StateMachine::new(store);
//! let processor = BatchIngestionProcessor::new(
//!     machine.clone(),
//!     Arc::new(DiskSource),
//!     Arc::new(MarkdownParser),
//!     ProcessorConfig::default(),
//! );
//! let processing = ProcessingLoop::new(processor, None, LoopConfig::default());
//! processing.start().await?;
//!
//! machine.mark_discovered("/docs/intro.md", "docs").await?;
//! processing.trigger_processing();
//! ```

pub mod changes;
pub mod config;
pub mod enrichment;
pub mod error;
pub mod graph_writer;
pub mod hooks;
pub mod identity;
pub mod node;
pub mod parser;
pub mod processing_loop;
pub mod processor;
pub mod references;
pub mod source;
pub mod state_machine;
pub mod timeout;

pub use changes::{ContentDelta, TextPatch, diff_text};
pub use config::{EnrichmentConfig, LoopConfig, ProcessorConfig};
pub use enrichment::{EnrichOutcome, EnrichmentPipeline, EntityExtractor};
pub use error::{IngestError, Result, SourceError};
pub use graph_writer::{GraphWriter, NodeWriteSummary, PreparedNode, RelationshipWriteSummary};
pub use hooks::{IngestHooks, NoopHooks};
pub use identity::{content_hash, entity_id, file_id, node_id};
pub use node::{
    DirectoryNode, ExternalLibraryNode, ExtractorRegistry, FieldExtractor, MediaNode,
    NormalizedContent, ParsedNode, ScopeNode, SectionNode, VariantExtractor,
};
pub use parser::{
    CompositeParser, MarkdownParser, ParseResult, ParsedRelationship, Parser, SourceFile,
    SourceSpec,
};
pub use processing_loop::{Backoff, IterationReport, LoopStatus, ProcessingLoop, RecoveryReport};
pub use processor::{BatchIngestionProcessor, BatchReport, FileOutcome, FileReport};
pub use references::{
    ImportExtractor, LinkSummary, Reference, ReferenceExtractor, ReferenceResolver,
    ResolvedReference,
};
pub use source::{ContentSource, DiskSource, VirtualSource};
pub use state_machine::{
    BatchTransition, Progress, StateMachine, StateStats, TransitionOptions, TransitionOutcome,
    can_transition,
};
