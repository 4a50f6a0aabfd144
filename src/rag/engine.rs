//! RAG engine.
//!
//! Owns the full pipeline behind one question:
//! retrieval (index + web) -> context assembly -> answer synthesis,
//! plus document ingestion and snapshot persistence for the index.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::Instrument;
use uuid::Uuid;

use super::chunker::Chunker;
use super::context_builder::ContextAssembler;
use super::document::{Document, DocumentId};
use super::index::{DocumentSummary, EmbeddingIndex, IndexStats};
use super::retriever::{HybridRetriever, RetrievalSettings};
use super::snapshot::SnapshotMeta;
use super::synthesizer::{Answer, AnswerSynthesizer};
use crate::core::config::{validate_rag_config, AppConfig, RagConfig};
use crate::core::errors::RagError;
use crate::llm::LlmProvider;
use crate::search::WebSearch;

/// Outcome of ingesting one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub document_id: DocumentId,
    pub origin: String,
    pub chunks: usize,
    /// Chunks sent to the embedding model
    pub embedded: usize,
    /// Chunks whose vectors were already indexed
    pub reused: usize,
    /// Stale chunks of an earlier version of the document
    pub removed: usize,
    /// Page count of a paginated source
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub index: IndexStats,
    pub llm_provider: String,
    pub llm_model: String,
    pub web_search: bool,
    pub snapshot_path: Option<PathBuf>,
    pub autosave: bool,
    pub cached_answers: usize,
    pub custom_persona: bool,
}

/// Normalized question, index version and persona generation.
type CacheKey = (String, u64, u64);

struct CachedAnswer {
    answer: Answer,
    expires_at: Option<Instant>,
}

/// Bounded answer cache, oldest entry evicted first.
struct AnswerCache {
    capacity: usize,
    order: VecDeque<CacheKey>,
    entries: HashMap<CacheKey, CachedAnswer>,
}

impl AnswerCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn get(&self, key: &CacheKey) -> Option<Answer> {
        let cached = self.entries.get(key)?;
        match cached.expires_at {
            Some(deadline) if Instant::now() >= deadline => None,
            _ => Some(cached.answer.clone()),
        }
    }

    /// `ttl` of `None` keeps the answer until it is evicted.
    fn insert(&mut self, key: CacheKey, answer: Answer, ttl: Option<Duration>) {
        if self.capacity == 0 || ttl.is_some_and(|ttl| ttl.is_zero()) {
            return;
        }
        let cached = CachedAnswer {
            answer,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        if self.entries.insert(key.clone(), cached).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.entries.remove(&evicted);
            }
        }
    }

    fn clear(&mut self) {
        self.order.clear();
        self.entries.clear();
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Runtime persona override. `generation` changes on every update.
#[derive(Default)]
struct PersonaState {
    text: Option<String>,
    generation: u64,
}

pub struct RagEngine {
    config: Arc<AppConfig>,
    chunker: Chunker,
    index: Arc<EmbeddingIndex>,
    retriever: HybridRetriever,
    settings: RetrievalSettings,
    assembler: ContextAssembler,
    synthesizer: AnswerSynthesizer,
    persona: RwLock<PersonaState>,
    cache: Mutex<AnswerCache>,
    snapshot_path: Option<PathBuf>,
}

impl RagEngine {
    /// Wires the pipeline. Fails with a configuration error before any
    /// document or question is processed.
    pub fn new(
        config: Arc<AppConfig>,
        index: Arc<EmbeddingIndex>,
        llm: Arc<dyn LlmProvider>,
        web: Option<Arc<dyn WebSearch>>,
    ) -> Result<Self, RagError> {
        validate_rag_config(&config.rag)?;
        let chunker = Chunker::new(config.rag.chunk_size, config.rag.chunk_overlap)?;

        let mut retriever = HybridRetriever::new(index.clone(), web);
        if config.web_search.rewrite_query {
            retriever = retriever.with_query_rewriter(
                llm.clone(),
                config.llm.model.clone(),
                Duration::from_secs(config.llm.timeout_secs),
            );
        }

        Ok(Self {
            chunker,
            settings: RetrievalSettings::from_config(&config.rag, &config.web_search),
            assembler: ContextAssembler::new(
                config.rag.context_budget,
                config.rag.dedup_threshold,
            ),
            synthesizer: AnswerSynthesizer::new(llm, &config.llm),
            cache: Mutex::new(AnswerCache::new(config.rag.answer_cache_size)),
            persona: RwLock::new(PersonaState::default()),
            index,
            retriever,
            snapshot_path: None,
            config,
        })
    }

    /// Snapshot file used by [`RagEngine::persist`] and autosave.
    pub fn with_snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<EmbeddingIndex> {
        &self.index
    }

    /// Chunks and indexes `document`, replacing any earlier version of it.
    pub async fn ingest(&self, document: Document) -> Result<IngestReport, RagError> {
        if document.text.trim().is_empty() {
            return Err(RagError::InvalidArgument(format!(
                "document {} has no text",
                document.origin
            )));
        }

        let chunks: Vec<_> = self.chunker.chunks(&document).collect();
        let chunk_count = chunks.len();
        let report = self.index.replace_document(&document.id, chunks).await?;

        tracing::info!(
            "Ingested {} ({}): {} chunks, {} embedded, {} reused, {} removed",
            document.origin,
            document.id,
            chunk_count,
            report.embedded,
            report.reused,
            report.removed
        );
        self.autosave().await;

        Ok(IngestReport {
            document_id: document.id,
            origin: document.origin,
            chunks: chunk_count,
            embedded: report.embedded,
            reused: report.reused,
            removed: report.removed,
            pages: document.total_pages,
        })
    }

    /// Loads an uploaded file and ingests it.
    pub async fn ingest_bytes(&self, filename: &str, bytes: &[u8]) -> Result<IngestReport, RagError> {
        let document = Document::from_upload(filename, bytes)?;
        self.ingest(document).await
    }

    pub async fn remove_document(&self, id: &DocumentId) -> Result<usize, RagError> {
        let removed = self.index.remove(id).await?;
        if removed == 0 {
            return Err(RagError::NotFound(format!("document {}", id)));
        }
        tracing::info!("Removed document {} ({} chunks)", id, removed);
        self.autosave().await;
        Ok(removed)
    }

    pub async fn documents(&self) -> Vec<DocumentSummary> {
        self.index.documents().await
    }

    /// Answers `question` with the configured options.
    ///
    /// Successful answers are cached per index version and persona, so any
    /// ingestion, removal or persona change invalidates them. Answers that
    /// used live web search expire after `web_answer_ttl_secs`, and answers
    /// produced while web search was failing are not cached at all.
    pub async fn answer(&self, question: &str) -> Result<Answer, RagError> {
        let question = checked_question(question)?;
        let (persona, generation) = self.persona_with_generation().await;
        let key = (
            normalize_question(question),
            self.index.version().await,
            generation,
        );

        if let Some(hit) = self.cache.lock().await.get(&key) {
            tracing::debug!("Answer cache hit for {:?}", key.0);
            return Ok(hit);
        }

        let answer = self
            .run(question, &self.settings, &self.assembler, &persona)
            .await?;

        if answer.web_degraded {
            tracing::debug!("Not caching answer built without web results");
        } else {
            let ttl = self
                .retriever
                .has_web_search()
                .then(|| Duration::from_secs(self.config.rag.web_answer_ttl_secs));
            self.cache.lock().await.insert(key, answer.clone(), ttl);
        }
        Ok(answer)
    }

    /// Answers `question` with per-call options. Bypasses the answer cache.
    pub async fn answer_with(&self, question: &str, rag: &RagConfig) -> Result<Answer, RagError> {
        let question = checked_question(question)?;
        validate_rag_config(rag)?;

        let settings = RetrievalSettings::from_config(rag, &self.config.web_search);
        let assembler = ContextAssembler::new(rag.context_budget, rag.dedup_threshold);
        self.run(question, &settings, &assembler, &rag.persona_text)
            .await
    }

    async fn run(
        &self,
        question: &str,
        settings: &RetrievalSettings,
        assembler: &ContextAssembler,
        persona: &str,
    ) -> Result<Answer, RagError> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("answer", %request_id);

        async move {
            tracing::info!("Answering question ({} chars)", question.chars().count());

            let retrieval = self.retriever.retrieve(question, settings).await?;
            let context = assembler.assemble(retrieval.passages);
            let mut answer = self
                .synthesizer
                .synthesize(question, &context, persona)
                .await
                .map_err(|err| {
                    tracing::error!("Generation failed: {}", err);
                    err
                })?;
            answer.web_degraded = retrieval.web_degraded;

            tracing::info!(
                grounded = answer.grounded,
                citations = answer.citations.len(),
                web_degraded = answer.web_degraded,
                "Answer ready"
            );
            Ok(answer)
        }
        .instrument(span)
        .await
    }

    pub async fn persona(&self) -> String {
        self.persona_with_generation().await.0
    }

    async fn persona_with_generation(&self) -> (String, u64) {
        let state = self.persona.read().await;
        let text = state
            .text
            .clone()
            .unwrap_or_else(|| self.config.rag.persona_text.clone());
        (text, state.generation)
    }

    /// Overrides the configured persona until [`RagEngine::reset_persona`].
    pub async fn set_persona(&self, persona: impl Into<String>) -> Result<(), RagError> {
        let persona = persona.into();
        if persona.trim().is_empty() {
            return Err(RagError::InvalidArgument(
                "persona must not be empty".to_string(),
            ));
        }
        self.replace_persona(Some(persona)).await;
        tracing::info!("Persona updated");
        Ok(())
    }

    pub async fn reset_persona(&self) {
        self.replace_persona(None).await;
        tracing::info!("Persona reset to configured default");
    }

    async fn replace_persona(&self, text: Option<String>) {
        {
            let mut state = self.persona.write().await;
            state.text = text;
            state.generation += 1;
        }
        self.cache.lock().await.clear();
    }

    /// Writes the index to the configured snapshot path.
    pub async fn persist(&self) -> Result<SnapshotMeta, RagError> {
        let Some(path) = &self.snapshot_path else {
            return Err(RagError::Configuration(
                "no snapshot path configured".to_string(),
            ));
        };
        self.index.persist(path).await
    }

    async fn autosave(&self) {
        if !self.config.index.autosave || self.snapshot_path.is_none() {
            return;
        }
        if let Err(err) = self.persist().await {
            tracing::warn!("Autosave of index snapshot failed: {}", err);
        }
    }

    pub async fn status(&self) -> EngineStatus {
        EngineStatus {
            index: self.index.stats().await,
            llm_provider: self.synthesizer.llm().name().to_string(),
            llm_model: self.synthesizer.model().to_string(),
            web_search: self.retriever.has_web_search(),
            snapshot_path: self.snapshot_path.clone(),
            autosave: self.config.index.autosave,
            cached_answers: self.cache.lock().await.len(),
            custom_persona: self.persona.read().await.text.is_some(),
        }
    }
}

fn checked_question(question: &str) -> Result<&str, RagError> {
    let question = question.trim();
    if question.is_empty() {
        return Err(RagError::InvalidArgument(
            "question must not be empty".to_string(),
        ));
    }
    Ok(question)
}

/// Case and whitespace insensitive cache key.
fn normalize_question(question: &str) -> String {
    question
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
