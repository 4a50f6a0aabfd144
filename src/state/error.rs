use thiserror::Error;

use crate::core::errors::RagError;

#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("Failed to prepare embedding index: {0}")]
    Index(#[source] RagError),

    #[error("Failed to initialize web search: {0}")]
    WebSearch(#[source] RagError),

    #[error("Failed to initialize RAG engine: {0}")]
    Engine(#[source] RagError),
}
