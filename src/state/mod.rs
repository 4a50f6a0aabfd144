use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::config::{AppConfig, AppPaths, ConfigService, EmbeddingProviderKind};
use crate::core::errors::RagError;
use crate::llm::{LlmProvider, OpenAiEmbedder, OpenAiProvider};
use crate::rag::embedding::{Embedder, HashingEmbedder};
use crate::rag::{EmbeddingIndex, RagEngine};
use crate::search::build_web_search;

pub mod error;

use error::InitializationError;

/// Application state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub paths: Arc<AppPaths>,
    pub config_service: ConfigService,
    pub config: Arc<AppConfig>,
    pub engine: Arc<RagEngine>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    /// Builds providers and the engine from a validated config.
    ///
    /// A snapshot at `paths.index_path` is loaded when present; a corrupt or
    /// incompatible snapshot aborts startup instead of being overwritten.
    pub async fn initialize(
        paths: Arc<AppPaths>,
        config: AppConfig,
    ) -> Result<Arc<Self>, InitializationError> {
        let config = Arc::new(config);
        let config_service = ConfigService::new(paths.clone());

        let embedder = build_embedder(&config).map_err(InitializationError::Index)?;
        let index = load_or_create_index(&paths, &config, embedder)
            .await
            .map_err(InitializationError::Index)?;

        let llm: Arc<dyn LlmProvider> = Arc::new(OpenAiProvider::new(
            config.llm.base_url.clone(),
            config.llm.api_key.clone(),
        ));
        let web = build_web_search(&config.web_search).map_err(InitializationError::WebSearch)?;

        let engine = RagEngine::new(config.clone(), Arc::new(index), llm, web)
            .map_err(InitializationError::Engine)?
            .with_snapshot_path(paths.index_path.clone());

        Ok(Self::from_parts(paths, config_service, config, Arc::new(engine)))
    }

    pub fn from_parts(
        paths: Arc<AppPaths>,
        config_service: ConfigService,
        config: Arc<AppConfig>,
        engine: Arc<RagEngine>,
    ) -> Arc<Self> {
        Arc::new(AppState {
            paths,
            config_service,
            config,
            engine,
            started_at: Utc::now(),
        })
    }
}

fn build_embedder(config: &AppConfig) -> Result<Arc<dyn Embedder>, RagError> {
    let embedding = &config.embedding;
    Ok(match embedding.provider {
        EmbeddingProviderKind::Hashing => Arc::new(HashingEmbedder::new(embedding.dimension)),
        EmbeddingProviderKind::Openai => Arc::new(OpenAiEmbedder::new(
            embedding
                .base_url
                .clone()
                .unwrap_or_else(|| config.llm.base_url.clone()),
            embedding
                .api_key
                .clone()
                .or_else(|| config.llm.api_key.clone()),
            embedding.model.clone(),
            embedding.dimension,
            Duration::from_secs(embedding.timeout_secs),
        )?),
    })
}

async fn load_or_create_index(
    paths: &AppPaths,
    config: &AppConfig,
    embedder: Arc<dyn Embedder>,
) -> Result<EmbeddingIndex, RagError> {
    let concurrency = config.embedding.concurrency;
    let timeout = Duration::from_secs(config.embedding.timeout_secs);
    let metric = config.index.metric;

    match EmbeddingIndex::load(&paths.index_path, embedder.clone(), metric).await {
        Ok(index) => Ok(index
            .with_concurrency(concurrency)
            .with_embed_timeout(timeout)),
        Err(RagError::NotFound(_)) => {
            tracing::info!(
                "No index snapshot at {}, starting empty",
                paths.index_path.display()
            );
            Ok(EmbeddingIndex::new(embedder, metric)
                .with_concurrency(concurrency)
                .with_embed_timeout(timeout))
        }
        Err(err) => Err(err),
    }
}
