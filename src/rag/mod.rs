//! Retrieval-augmented generation.
//!
//! - `chunker` / `document`: turning uploads into indexable chunks
//! - `index` / `snapshot`: the embedding index and its on-disk form
//! - `retriever` / `context_builder` / `synthesizer`: the question pipeline
//! - `engine`: `RagEngine`, which wires all of the above

pub mod chunker;
pub mod context_builder;
pub mod document;
pub mod embedding;
pub mod engine;
pub mod index;
pub mod passage;
pub mod retriever;
pub mod snapshot;
pub mod synthesizer;

pub use chunker::{Chunk, Chunker};
pub use context_builder::{ContextAssembler, ContextBundle};
pub use document::{Document, DocumentId};
pub use embedding::{Embedder, HashingEmbedder};
pub use engine::{EngineStatus, IngestReport, RagEngine};
pub use index::{DistanceMetric, EmbeddingIndex};
pub use passage::{Passage, SourceKind};
pub use retriever::{HybridRetriever, RankDecay, Retrieval, RetrievalSettings};
pub use synthesizer::{Answer, AnswerSynthesizer, Citation};
