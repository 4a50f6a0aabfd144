use async_trait::async_trait;

use super::types::ChatRequest;
use crate::core::errors::RagError;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// return the provider name (e.g. "openai")
    fn name(&self) -> &str;

    /// chat completion (non-streaming)
    ///
    /// Errors are [`RagError::Generation`]; `transient` marks failures worth
    /// retrying (timeouts, transport errors, 429 and 5xx responses).
    async fn chat(&self, request: ChatRequest, model_id: &str) -> Result<String, RagError>;
}
