//! Hybrid retrieval: local index and web search fanned out for one question,
//! scored on a common scale and merged into a single ranked list.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::index::{DistanceMetric, EmbeddingIndex, Neighbor};
use super::passage::Passage;
use crate::core::config::{RagConfig, WebSearchConfig};
use crate::core::errors::RagError;
use crate::llm::{ChatMessage, ChatRequest, LlmProvider};
use crate::search::{SearchResult, WebSearch};

/// Turns a web result's provider rank (0 is best) into a raw score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RankDecay {
    /// `1 / (1 + rank)`
    #[default]
    Reciprocal,
    /// `factor ^ rank`, with `0 < factor < 1`
    Exponential { factor: f64 },
}

impl RankDecay {
    pub fn score(&self, rank: usize) -> f64 {
        match self {
            RankDecay::Reciprocal => 1.0 / (1.0 + rank as f64),
            RankDecay::Exponential { factor } => factor.powi(rank.min(i32::MAX as usize) as i32),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalSettings {
    pub retrieval_weight: f64,
    pub top_n: usize,
    pub local_k: usize,
    pub web_max_results: usize,
    pub web_timeout: Duration,
    pub rank_decay: RankDecay,
    pub rewrite_query: bool,
}

impl RetrievalSettings {
    pub fn from_config(rag: &RagConfig, web: &WebSearchConfig) -> Self {
        Self {
            retrieval_weight: rag.retrieval_weight,
            top_n: rag.top_n,
            local_k: rag.local_k,
            web_max_results: web.max_results,
            web_timeout: Duration::from_secs(web.timeout_secs),
            rank_decay: rag.rank_decay,
            rewrite_query: web.rewrite_query,
        }
    }
}

/// Ranked passages for one question.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Retrieval {
    pub passages: Vec<Passage>,
    /// Web search was configured but failed or timed out
    pub web_degraded: bool,
    /// Query actually sent to the web provider
    pub web_query: Option<String>,
}

struct QueryRewriter {
    llm: Arc<dyn LlmProvider>,
    model: String,
    timeout: Duration,
}

pub struct HybridRetriever {
    index: Arc<EmbeddingIndex>,
    web: Option<Arc<dyn WebSearch>>,
    rewriter: Option<QueryRewriter>,
}

impl HybridRetriever {
    pub fn new(index: Arc<EmbeddingIndex>, web: Option<Arc<dyn WebSearch>>) -> Self {
        Self {
            index,
            web,
            rewriter: None,
        }
    }

    /// Lets the language model rephrase questions before they go to the web
    /// provider. Only used when [`RetrievalSettings::rewrite_query`] is set.
    pub fn with_query_rewriter(
        mut self,
        llm: Arc<dyn LlmProvider>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        self.rewriter = Some(QueryRewriter {
            llm,
            model: model.into(),
            timeout,
        });
        self
    }

    pub fn has_web_search(&self) -> bool {
        self.web.is_some()
    }

    /// Queries the index and the web provider concurrently and fuses the results.
    ///
    /// A failing or slow web provider never fails the call: the result is
    /// local-only with `web_degraded` set. Failures of the local branch
    /// (embedding the question, dimension mismatch) are returned.
    pub async fn retrieve(
        &self,
        question: &str,
        settings: &RetrievalSettings,
    ) -> Result<Retrieval, RagError> {
        if question.trim().is_empty() {
            return Err(RagError::InvalidArgument(
                "question must not be empty".to_string(),
            ));
        }

        let local = self.index.query_text(question, settings.local_k.max(1));
        let web = self.search_web(question, settings);
        let (local, web) = tokio::join!(local, web);

        let local = local?;
        let (web_results, web_degraded, web_query) = match web {
            WebOutcome::Disabled => (Vec::new(), false, None),
            WebOutcome::Results { query, results } => (results, false, Some(query)),
            WebOutcome::Failed { query, error } => {
                tracing::warn!("Web search degraded for query {:?}: {}", query, error);
                (Vec::new(), true, Some(query))
            }
        };

        let passages = fuse(&local, self.index.metric(), &web_results, settings);
        tracing::debug!(
            local = local.len(),
            web = web_results.len(),
            kept = passages.len(),
            web_degraded,
            "Fused retrieval results"
        );

        Ok(Retrieval {
            passages,
            web_degraded,
            web_query,
        })
    }

    async fn search_web(&self, question: &str, settings: &RetrievalSettings) -> WebOutcome {
        let Some(web) = &self.web else {
            return WebOutcome::Disabled;
        };
        if settings.web_max_results == 0 {
            return WebOutcome::Disabled;
        }

        let query = if settings.rewrite_query {
            self.rewrite(question).await
        } else {
            question.to_string()
        };

        match tokio::time::timeout(
            settings.web_timeout,
            web.search(&query, settings.web_max_results),
        )
        .await
        {
            Ok(Ok(results)) => WebOutcome::Results { query, results },
            Ok(Err(error)) => WebOutcome::Failed { query, error },
            Err(_) => WebOutcome::Failed {
                error: RagError::SearchUnavailable(format!(
                    "{} did not answer within {:?}",
                    web.name(),
                    settings.web_timeout
                )),
                query,
            },
        }
    }

    async fn rewrite(&self, question: &str) -> String {
        let Some(rewriter) = &self.rewriter else {
            return question.to_string();
        };

        let request = ChatRequest::new(vec![ChatMessage::user(format!(
            "Rewrite this query for web search to find the most relevant information. \
             Reply with the query only.\n\nQuery: {}",
            question
        ))]);

        match tokio::time::timeout(rewriter.timeout, rewriter.llm.chat(request, &rewriter.model)).await
        {
            Ok(Ok(text)) => {
                let rewritten = text.trim().trim_matches('"').trim();
                if rewritten.is_empty() {
                    question.to_string()
                } else {
                    tracing::debug!("Rewrote web query {:?} -> {:?}", question, rewritten);
                    rewritten.to_string()
                }
            }
            Ok(Err(err)) => {
                tracing::warn!("Query rewrite failed, using the raw question: {}", err);
                question.to_string()
            }
            Err(_) => {
                tracing::warn!("Query rewrite timed out, using the raw question");
                question.to_string()
            }
        }
    }
}

enum WebOutcome {
    Disabled,
    Results {
        query: String,
        results: Vec<SearchResult>,
    },
    Failed {
        query: String,
        error: RagError,
    },
}

/// Scores both families on `[0, 1]`, blends them with `retrieval_weight` and
/// keeps the best `top_n`.
///
/// Order: blended score descending, then local before web, then input order
/// (local neighbors by distance and chunk id, web results by provider rank).
pub fn fuse(
    local: &[Neighbor],
    metric: DistanceMetric,
    web: &[SearchResult],
    settings: &RetrievalSettings,
) -> Vec<Passage> {
    let weight = settings.retrieval_weight.clamp(0.0, 1.0);

    let local_raw: Vec<f64> = local
        .iter()
        .map(|n| 1.0 - f64::from(metric.normalize(n.distance)))
        .collect();
    let mut web_sorted: Vec<&SearchResult> = web.iter().collect();
    web_sorted.sort_by_key(|r| r.rank);
    let web_raw: Vec<f64> = web_sorted
        .iter()
        .map(|r| settings.rank_decay.score(r.rank))
        .collect();

    let mut passages: Vec<Passage> = Vec::with_capacity(local.len() + web.len());
    passages.extend(
        local
            .iter()
            .zip(min_max(&local_raw))
            .map(|(n, s)| Passage::local(&n.entry, s * weight)),
    );
    passages.extend(
        web_sorted
            .iter()
            .zip(min_max(&web_raw))
            .map(|(r, s)| Passage::web(r, s * (1.0 - weight))),
    );

    // stable: equal keys keep input order
    passages.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.kind.cmp(&b.kind))
    });
    passages.truncate(settings.top_n);
    passages
}

/// Min-max normalization; a family of equal scores maps to 1.0.
fn min_max(scores: &[f64]) -> Vec<f64> {
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let span = max - min;
    scores
        .iter()
        .map(|s| {
            if span <= f64::EPSILON {
                1.0
            } else {
                (s - min) / span
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::rag::chunker::chunk;
    use crate::rag::document::Document;
    use crate::rag::embedding::HashingEmbedder;
    use crate::rag::passage::SourceKind;

    enum Behavior {
        Answer(Vec<SearchResult>),
        Fail,
        Hang,
    }

    struct FakeSearch {
        behavior: Behavior,
        queries: std::sync::Mutex<Vec<String>>,
    }

    impl FakeSearch {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                queries: std::sync::Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl WebSearch for FakeSearch {
        fn name(&self) -> &str {
            "fake"
        }

        async fn search(
            &self,
            query: &str,
            max_results: usize,
        ) -> Result<Vec<SearchResult>, RagError> {
            self.queries.lock().unwrap().push(query.to_string());
            match &self.behavior {
                Behavior::Answer(results) => Ok(results.iter().take(max_results).cloned().collect()),
                Behavior::Fail => Err(RagError::SearchUnavailable("quota exceeded".to_string())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(Vec::new())
                }
            }
        }
    }

    struct FakeRewriter {
        reply: Result<String, ()>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for FakeRewriter {
        fn name(&self) -> &str {
            "fake"
        }

        async fn chat(&self, _request: ChatRequest, _model_id: &str) -> Result<String, RagError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply
                .clone()
                .map_err(|_| RagError::transient_generation("model offline"))
        }
    }

    fn result(rank: usize, url: &str) -> SearchResult {
        SearchResult {
            title: format!("Result {}", rank),
            url: url.to_string(),
            snippet: format!("snippet number {}", rank),
            rank,
        }
    }

    fn settings() -> RetrievalSettings {
        RetrievalSettings::from_config(&RagConfig::default(), &WebSearchConfig::default())
    }

    async fn seeded_index(texts: &[(&str, &str)]) -> Arc<EmbeddingIndex> {
        let index = Arc::new(EmbeddingIndex::new(
            Arc::new(HashingEmbedder::new(64)),
            DistanceMetric::Cosine,
        ));
        for (origin, text) in texts {
            let doc = Document::new(*origin, *text);
            let chunks: Vec<_> = chunk(&doc, 200, 20).unwrap().collect();
            index.add(chunks).await.unwrap();
        }
        index
    }

    fn neighbors_for(distances: &[f32]) -> Vec<Neighbor> {
        let doc = Document::new("notes.txt", "placeholder text");
        distances
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let mut c = chunk(&doc, 100, 10).unwrap().next().unwrap();
                c.id = format!("{}#{:05}", doc.id, i);
                Neighbor {
                    entry: Arc::new(crate::rag::index::IndexEntry {
                        chunk: c,
                        vector: vec![0.0; 4],
                    }),
                    distance: *d,
                }
            })
            .collect()
    }

    #[test]
    fn decay_functions_decrease_with_rank() {
        for decay in [
            RankDecay::Reciprocal,
            RankDecay::Exponential { factor: 0.5 },
        ] {
            let scores: Vec<f64> = (0..6).map(|r| decay.score(r)).collect();
            assert_eq!(scores[0], 1.0);
            assert!(scores.windows(2).all(|w| w[0] > w[1]), "{:?}", decay);
        }
        assert_eq!(RankDecay::Reciprocal.score(1), 0.5);
        assert_eq!(RankDecay::Exponential { factor: 0.5 }.score(2), 0.25);
    }

    #[test]
    fn equal_scores_normalize_to_one() {
        assert_eq!(min_max(&[0.3, 0.3]), vec![1.0, 1.0]);
        assert_eq!(min_max(&[0.0, 0.5, 1.0]), vec![0.0, 0.5, 1.0]);
        assert!(min_max(&[]).is_empty());
    }

    #[test]
    fn fused_list_is_sorted_and_truncated() {
        let local = neighbors_for(&[0.1, 0.4, 0.9]);
        let web = vec![result(0, "https://a"), result(1, "https://b"), result(2, "https://c")];
        let mut s = settings();
        s.top_n = 4;

        let passages = fuse(&local, DistanceMetric::Cosine, &web, &s);
        assert_eq!(passages.len(), 4);
        assert!(passages.windows(2).all(|w| w[0].score >= w[1].score));
        assert!(passages.iter().all(|p| (0.0..=1.0).contains(&p.score)));
    }

    #[test]
    fn ties_put_local_before_web() {
        let local = neighbors_for(&[0.2]);
        let web = vec![result(0, "https://a")];
        let mut s = settings();
        s.retrieval_weight = 0.5;

        let passages = fuse(&local, DistanceMetric::Cosine, &web, &s);
        assert_eq!(passages[0].score, passages[1].score);
        assert_eq!(passages[0].kind, SourceKind::Local);
        assert_eq!(passages[1].kind, SourceKind::Web);
    }

    #[test]
    fn weight_extremes_zero_out_one_family() {
        let local = neighbors_for(&[0.1, 0.3]);
        let web = vec![result(0, "https://a"), result(1, "https://b")];

        let mut s = settings();
        s.retrieval_weight = 1.0;
        let passages = fuse(&local, DistanceMetric::Cosine, &web, &s);
        assert_eq!(passages[0].kind, SourceKind::Local);
        assert!(passages
            .iter()
            .filter(|p| p.kind == SourceKind::Web)
            .all(|p| p.score == 0.0));

        s.retrieval_weight = 0.0;
        let passages = fuse(&local, DistanceMetric::Cosine, &web, &s);
        assert_eq!(passages[0].kind, SourceKind::Web);
        assert_eq!(passages[0].source_id, "https://a");
        assert!(passages
            .iter()
            .filter(|p| p.kind == SourceKind::Local)
            .all(|p| p.score == 0.0));
    }

    #[test]
    fn web_results_follow_provider_rank() {
        let web = vec![result(2, "https://c"), result(0, "https://a"), result(1, "https://b")];
        let mut s = settings();
        s.retrieval_weight = 0.0;
        let passages = fuse(&[], DistanceMetric::Cosine, &web, &s);
        let urls: Vec<_> = passages.iter().map(|p| p.source_id.as_str()).collect();
        assert_eq!(urls, vec!["https://a", "https://b", "https://c"]);
    }

    #[tokio::test]
    async fn failing_web_search_degrades_to_local_only() {
        let index = seeded_index(&[("handbook.txt", "Employees receive 25 vacation days per year.")]).await;
        let retriever = HybridRetriever::new(index, Some(FakeSearch::new(Behavior::Fail)));

        let retrieval = retriever.retrieve("vacation days", &settings()).await.unwrap();
        assert!(retrieval.web_degraded);
        assert!(!retrieval.passages.is_empty());
        assert!(retrieval.passages.iter().all(|p| p.kind == SourceKind::Local));
    }

    #[tokio::test]
    async fn slow_web_search_times_out() {
        let index = seeded_index(&[("handbook.txt", "Employees receive 25 vacation days per year.")]).await;
        let retriever = HybridRetriever::new(index, Some(FakeSearch::new(Behavior::Hang)));
        let mut s = settings();
        s.web_timeout = Duration::from_millis(50);

        let started = std::time::Instant::now();
        let retrieval = retriever.retrieve("vacation days", &s).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(retrieval.web_degraded);
        assert!(!retrieval.passages.is_empty());
    }

    #[tokio::test]
    async fn empty_index_returns_web_only() {
        let index = seeded_index(&[]).await;
        let search = FakeSearch::new(Behavior::Answer(vec![
            result(0, "https://a"),
            result(1, "https://b"),
        ]));
        let retriever = HybridRetriever::new(index, Some(search));

        let retrieval = retriever.retrieve("anything", &settings()).await.unwrap();
        assert!(!retrieval.web_degraded);
        assert_eq!(retrieval.passages.len(), 2);
        assert!(retrieval.passages.iter().all(|p| p.kind == SourceKind::Web));
        assert_eq!(retrieval.passages[0].source_id, "https://a");
    }

    #[tokio::test]
    async fn no_web_provider_is_not_degraded() {
        let index = seeded_index(&[("a.txt", "alpha beta gamma")]).await;
        let retriever = HybridRetriever::new(index, None);
        let retrieval = retriever.retrieve("alpha", &settings()).await.unwrap();
        assert!(!retrieval.web_degraded);
        assert!(retrieval.web_query.is_none());
    }

    #[tokio::test]
    async fn empty_question_is_rejected() {
        let index = seeded_index(&[]).await;
        let retriever = HybridRetriever::new(index, None);
        assert!(matches!(
            retriever.retrieve("   ", &settings()).await,
            Err(RagError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn rewritten_query_is_sent_to_the_provider() {
        let index = seeded_index(&[]).await;
        let search = FakeSearch::new(Behavior::Answer(vec![result(0, "https://a")]));
        let llm = Arc::new(FakeRewriter {
            reply: Ok("\"rust async runtime comparison\"".to_string()),
            calls: AtomicUsize::new(0),
        });
        let retriever = HybridRetriever::new(index, Some(search.clone()))
            .with_query_rewriter(llm.clone(), "model", Duration::from_secs(1));
        let mut s = settings();
        s.rewrite_query = true;

        let retrieval = retriever.retrieve("which runtime?", &s).await.unwrap();
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            retrieval.web_query.as_deref(),
            Some("rust async runtime comparison")
        );
        assert_eq!(
            search.queries.lock().unwrap().as_slice(),
            ["rust async runtime comparison".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_rewrite_falls_back_to_question() {
        let index = seeded_index(&[]).await;
        let search = FakeSearch::new(Behavior::Answer(vec![result(0, "https://a")]));
        let llm = Arc::new(FakeRewriter {
            reply: Err(()),
            calls: AtomicUsize::new(0),
        });
        let retriever = HybridRetriever::new(index, Some(search.clone()))
            .with_query_rewriter(llm, "model", Duration::from_secs(1));
        let mut s = settings();
        s.rewrite_query = true;

        let retrieval = retriever.retrieve("which runtime?", &s).await.unwrap();
        assert_eq!(retrieval.web_query.as_deref(), Some("which runtime?"));
        assert_eq!(retrieval.passages.len(), 1);
    }
}
