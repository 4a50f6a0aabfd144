//! OpenAI-compatible HTTP provider (OpenAI, LM Studio, vLLM, llama.cpp server).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde_json::{json, Value};

use super::provider::LlmProvider;
use super::types::ChatRequest;
use crate::core::errors::RagError;
use crate::rag::embedding::Embedder;

fn endpoint(base_url: &str, path: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let base = base.strip_suffix("/v1").unwrap_or(base);
    format!("{}/v1/{}", base, path)
}

fn authorize(builder: RequestBuilder, api_key: Option<&str>) -> RequestBuilder {
    match api_key {
        Some(key) if !key.is_empty() => builder.bearer_auth(key),
        _ => builder,
    }
}

fn is_transient_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

#[derive(Clone)]
pub struct OpenAiProvider {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

impl OpenAiProvider {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn chat(&self, request: ChatRequest, model_id: &str) -> Result<String, RagError> {
        let url = endpoint(&self.base_url, "chat/completions");

        let mut body = json!({
            "model": model_id,
            "messages": request.messages,
            "stream": false,
        });

        if let Some(obj) = body.as_object_mut() {
            if let Some(t) = request.temperature { obj.insert("temperature".to_string(), json!(t)); }
            if let Some(t) = request.max_tokens { obj.insert("max_tokens".to_string(), json!(t)); }
        }

        let res = authorize(self.client.post(&url), self.api_key.as_deref())
            .json(&body)
            .send()
            .await
            .map_err(|err| RagError::transient_generation(format!("chat request failed: {}", err)))?;

        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            let message = format!("chat error {}: {}", status, text);
            return Err(if is_transient_status(status) {
                RagError::transient_generation(message)
            } else {
                RagError::generation(message)
            });
        }

        let payload: Value = res
            .json()
            .await
            .map_err(|err| RagError::generation(format!("malformed chat response: {}", err)))?;

        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RagError::generation("chat response has no message content"))
    }
}

/// Embeddings through `/v1/embeddings`, one text per request.
#[derive(Clone)]
pub struct OpenAiEmbedder {
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    client: Client,
}

impl OpenAiEmbedder {
    /// Every request is abandoned after `timeout`.
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        dimension: usize,
        timeout: Duration,
    ) -> Result<Self, RagError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(RagError::internal)?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            dimension,
            client,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
        let url = endpoint(&self.base_url, "embeddings");

        let body = json!({
            "model": self.model,
            "input": text,
        });

        let res = authorize(self.client.post(&url), self.api_key.as_deref())
            .json(&body)
            .send()
            .await
            .map_err(|err| RagError::Embedding(format!("embedding request failed: {}", err)))?;

        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(RagError::Embedding(format!(
                "embedding error {}: {}",
                status, text
            )));
        }

        let payload: Value = res
            .json()
            .await
            .map_err(|err| RagError::Embedding(format!("malformed embedding response: {}", err)))?;

        parse_embedding(&payload)
    }
}

fn parse_embedding(payload: &Value) -> Result<Vec<f32>, RagError> {
    let values = payload["data"][0]["embedding"]
        .as_array()
        .ok_or_else(|| RagError::Embedding("embedding response has no vector".to_string()))?;

    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| RagError::Embedding("embedding contains a non-number".to_string()))
        })
        .collect()
}
