//! Typed application configuration.
//!
//! Every section has serde defaults so a partial (or missing) YAML file still
//! yields a complete [`AppConfig`]. Values are checked once by
//! [`super::validation::validate_config`] and never mutated afterwards.

use serde::{Deserialize, Serialize};

use super::defaults::*;
use crate::rag::index::DistanceMetric;
use crate::rag::retriever::RankDecay;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub rag: RagConfig,
    pub web_search: WebSearchConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub server: ServerConfig,
}

/// Options controlling chunking, retrieval, context packing and synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    /// Maximum chunk length in characters
    pub chunk_size: usize,
    /// Characters shared between adjacent chunks
    pub chunk_overlap: usize,
    /// Weight of local scores in the blend, web gets `1 - w`
    pub retrieval_weight: f64,
    /// Passages kept after fusion
    pub top_n: usize,
    /// Candidates requested from the local index
    pub local_k: usize,
    /// Character budget of the assembled context
    pub context_budget: usize,
    /// Jaccard similarity at which two passages count as duplicates
    pub dedup_threshold: f64,
    pub rank_decay: RankDecay,
    pub persona_text: String,
    /// Cached answers, 0 disables the cache
    pub answer_cache_size: usize,
    /// Seconds an answer built from web results stays cached
    pub web_answer_ttl_secs: u64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            retrieval_weight: DEFAULT_RETRIEVAL_WEIGHT,
            top_n: DEFAULT_TOP_N,
            local_k: DEFAULT_LOCAL_K,
            context_budget: DEFAULT_CONTEXT_BUDGET,
            dedup_threshold: DEFAULT_DEDUP_THRESHOLD,
            rank_decay: RankDecay::default(),
            persona_text: DEFAULT_PERSONA.to_string(),
            answer_cache_size: DEFAULT_ANSWER_CACHE_SIZE,
            web_answer_ttl_secs: DEFAULT_WEB_ANSWER_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchProviderKind {
    #[default]
    Google,
    Brave,
    Duckduckgo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSearchConfig {
    pub enabled: bool,
    pub provider: SearchProviderKind,
    pub max_results: usize,
    pub timeout_secs: u64,
    /// Ask the model to rewrite the question before searching
    pub rewrite_query: bool,
    pub google_api_key: Option<String>,
    pub google_engine_id: Option<String>,
    pub brave_api_key: Option<String>,
}

impl Default for WebSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            provider: SearchProviderKind::default(),
            max_results: DEFAULT_WEB_MAX_RESULTS,
            timeout_secs: DEFAULT_WEB_TIMEOUT_SECS,
            rewrite_query: false,
            google_api_key: None,
            google_engine_id: None,
            brave_api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<i32>,
    pub timeout_secs: u64,
    /// Extra attempts after a transient failure
    pub max_retries: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_LLM_BASE_URL.to_string(),
            api_key: None,
            model: DEFAULT_LLM_MODEL.to_string(),
            temperature: Some(0.2),
            max_tokens: None,
            timeout_secs: DEFAULT_LLM_TIMEOUT_SECS,
            max_retries: DEFAULT_LLM_MAX_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    #[default]
    Openai,
    /// Deterministic local feature hashing, no network
    Hashing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    /// Falls back to `llm.base_url`
    pub base_url: Option<String>,
    /// Falls back to `llm.api_key`
    pub api_key: Option<String>,
    pub model: String,
    pub dimension: usize,
    /// Concurrent embedding requests during ingestion
    pub concurrency: usize,
    /// Per-request limit for embedding calls
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::default(),
            base_url: None,
            api_key: None,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimension: DEFAULT_EMBEDDING_DIMENSION,
            concurrency: DEFAULT_EMBEDDING_CONCURRENCY,
            timeout_secs: DEFAULT_EMBEDDING_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub metric: DistanceMetric,
    /// Persist the snapshot after every ingestion or removal
    pub autosave: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            metric: DistanceMetric::default(),
            autosave: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Browser origins allowed by CORS, local dev origins when empty
    pub cors_allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_SERVER_HOST.to_string(),
            port: DEFAULT_SERVER_PORT,
            cors_allowed_origins: Vec::new(),
        }
    }
}
