//! In-memory embedding index.
//!
//! Readers clone an `Arc` of the current state and never block on writers
//! for longer than that clone. Writers are serialized and publish a new state
//! in a single swap, so a reader sees either the whole update or none of it.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::chunker::{Chunk, ChunkId};
use super::document::DocumentId;
use super::embedding::Embedder;
use super::snapshot::{self, SnapshotMeta};
use crate::core::errors::RagError;

const DEFAULT_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    /// `1 - cos(a, b)`, in `[0, 2]`
    #[default]
    Cosine,
    /// Euclidean distance
    L2,
}

impl DistanceMetric {
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => {
                let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                let denom = norm_a * norm_b;
                if denom <= f32::EPSILON {
                    1.0
                } else {
                    (1.0 - dot / denom).clamp(0.0, 2.0)
                }
            }
            DistanceMetric::L2 => a
                .iter()
                .zip(b)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f32>()
                .sqrt(),
        }
    }

    /// Maps a distance onto `[0, 1]`, preserving order.
    pub fn normalize(&self, distance: f32) -> f32 {
        match self {
            DistanceMetric::Cosine => (distance / 2.0).clamp(0.0, 1.0),
            DistanceMetric::L2 => {
                let d = distance.max(0.0);
                d / (1.0 + d)
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::L2 => "l2",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cosine" => Some(DistanceMetric::Cosine),
            "l2" => Some(DistanceMetric::L2),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

#[derive(Debug, Clone)]
pub struct Neighbor {
    pub entry: Arc<IndexEntry>,
    pub distance: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AddReport {
    /// Chunks sent to the embedder
    pub embedded: usize,
    /// Chunks whose text was unchanged and kept their vector
    pub reused: usize,
    /// Stale chunks dropped by a document replacement
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSummary {
    pub id: DocumentId,
    pub origin: String,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub model_id: String,
    pub dimension: usize,
    pub metric: DistanceMetric,
    pub version: u64,
    pub entries: usize,
    pub documents: usize,
}

#[derive(Debug, Default)]
struct IndexState {
    version: u64,
    entries: BTreeMap<ChunkId, Arc<IndexEntry>>,
}

pub struct EmbeddingIndex {
    embedder: Arc<dyn Embedder>,
    metric: DistanceMetric,
    dimension: usize,
    concurrency: usize,
    embed_timeout: Option<Duration>,
    state: RwLock<Arc<IndexState>>,
    writer: Mutex<()>,
    persist_lock: Mutex<()>,
}

impl EmbeddingIndex {
    pub fn new(embedder: Arc<dyn Embedder>, metric: DistanceMetric) -> Self {
        let dimension = embedder.dimension();
        Self {
            embedder,
            metric,
            dimension,
            concurrency: DEFAULT_CONCURRENCY,
            embed_timeout: None,
            state: RwLock::new(Arc::new(IndexState::default())),
            writer: Mutex::new(()),
            persist_lock: Mutex::new(()),
        }
    }

    /// Bounds the number of in-flight embedding requests during `add`.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Fails any single embedding call that takes longer than `timeout`.
    pub fn with_embed_timeout(mut self, timeout: Duration) -> Self {
        self.embed_timeout = Some(timeout);
        self
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub async fn len(&self) -> usize {
        self.snapshot().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshot().await.entries.is_empty()
    }

    /// Incremented by every commit that changes the entry set.
    pub async fn version(&self) -> u64 {
        self.snapshot().await.version
    }

    async fn snapshot(&self) -> Arc<IndexState> {
        self.state.read().await.clone()
    }

    /// Upserts chunks by id.
    ///
    /// On an embedding failure every chunk embedded before it is still
    /// committed and the error is returned. Re-adding is idempotent.
    pub async fn add(&self, chunks: Vec<Chunk>) -> Result<AddReport, RagError> {
        self.commit(None, chunks).await
    }

    /// Replaces the chunk set of one document in a single commit.
    ///
    /// Chunks of `document_id` missing from `chunks` are removed. If any
    /// chunk fails to embed nothing is committed and the previous version
    /// stays in place.
    pub async fn replace_document(
        &self,
        document_id: &DocumentId,
        chunks: Vec<Chunk>,
    ) -> Result<AddReport, RagError> {
        if let Some(foreign) = chunks.iter().find(|c| &c.document_id != document_id) {
            return Err(RagError::InvalidArgument(format!(
                "chunk {} does not belong to document {}",
                foreign.id, document_id
            )));
        }
        self.commit(Some(document_id), chunks).await
    }

    async fn commit(
        &self,
        replace: Option<&DocumentId>,
        chunks: Vec<Chunk>,
    ) -> Result<AddReport, RagError> {
        let _guard = self.writer.lock().await;
        let current = self.snapshot().await;

        let new_ids: BTreeSet<ChunkId> = chunks.iter().map(|c| c.id.clone()).collect();

        let mut reused = Vec::new();
        let mut to_embed = Vec::new();
        for chunk in chunks {
            match current.entries.get(&chunk.id) {
                Some(existing) if existing.chunk.text_sha256 == chunk.text_sha256 => {
                    reused.push(IndexEntry {
                        chunk,
                        vector: existing.vector.clone(),
                    });
                }
                _ => to_embed.push(chunk),
            }
        }

        let (embedded, failure) = self.embed_all(to_embed).await;

        let failure = match (replace, failure) {
            (Some(document_id), Some(err)) => {
                tracing::warn!(
                    "Replacement of document {} abandoned after {} embedded chunks: {}",
                    document_id,
                    embedded.len(),
                    err
                );
                return Err(err);
            }
            (_, failure) => failure,
        };

        let mut report = AddReport {
            embedded: embedded.len(),
            reused: reused.len(),
            removed: 0,
        };
        let mut entries = current.entries.clone();
        let mut changed = !embedded.is_empty();

        if let Some(document_id) = replace {
            let before = entries.len();
            entries.retain(|id, entry| {
                &entry.chunk.document_id != document_id || new_ids.contains(id)
            });
            report.removed = before - entries.len();
            changed |= report.removed > 0;
        }

        for entry in reused {
            let differs = entries
                .get(&entry.chunk.id)
                .map(|existing| existing.chunk != entry.chunk)
                .unwrap_or(true);
            if differs {
                changed = true;
                entries.insert(entry.chunk.id.clone(), Arc::new(entry));
            }
        }
        for entry in embedded {
            entries.insert(entry.chunk.id.clone(), Arc::new(entry));
        }

        if changed {
            let next = IndexState {
                version: current.version + 1,
                entries,
            };
            *self.state.write().await = Arc::new(next);
        }

        tracing::debug!(
            embedded = report.embedded,
            reused = report.reused,
            removed = report.removed,
            "index commit"
        );

        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Embeds in input order and stops at the first failure.
    async fn embed_all(&self, chunks: Vec<Chunk>) -> (Vec<IndexEntry>, Option<RagError>) {
        let mut embedded = Vec::with_capacity(chunks.len());
        let mut results = stream::iter(chunks.into_iter().map(|chunk| async move {
            let result = self.embed(&chunk.text).await;
            (chunk, result)
        }))
        .buffered(self.concurrency);

        while let Some((chunk, result)) = results.next().await {
            let vector = match result {
                Ok(vector) => vector,
                Err(err) => {
                    tracing::warn!("Embedding failed for chunk {}: {}", chunk.id, err);
                    return (embedded, Some(as_embedding_error(err)));
                }
            };
            if let Err(err) = self.check_dimension(&vector) {
                tracing::warn!("Rejected vector for chunk {}: {}", chunk.id, err);
                return (embedded, Some(err));
            }
            embedded.push(IndexEntry { chunk, vector });
        }

        (embedded, None)
    }

    /// Deletes every entry of `document_id`. Returns the number removed.
    pub async fn remove(&self, document_id: &DocumentId) -> Result<usize, RagError> {
        let _guard = self.writer.lock().await;
        let current = self.snapshot().await;

        let mut entries = current.entries.clone();
        entries.retain(|_, entry| &entry.chunk.document_id != document_id);
        let removed = current.entries.len() - entries.len();

        if removed > 0 {
            *self.state.write().await = Arc::new(IndexState {
                version: current.version + 1,
                entries,
            });
        }
        Ok(removed)
    }

    /// Up to `k` nearest entries, ascending distance, ties by chunk id.
    pub async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>, RagError> {
        if k == 0 {
            return Err(RagError::InvalidArgument(
                "k must be greater than zero".to_string(),
            ));
        }
        self.check_dimension(vector)?;

        let state = self.snapshot().await;
        let mut neighbors: Vec<Neighbor> = state
            .entries
            .values()
            .map(|entry| Neighbor {
                distance: self.metric.distance(vector, &entry.vector),
                entry: entry.clone(),
            })
            .collect();

        neighbors.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.entry.chunk.id.cmp(&b.entry.chunk.id))
        });
        neighbors.truncate(k);
        Ok(neighbors)
    }

    /// Embeds `text` with the index's own model, then queries.
    pub async fn query_text(&self, text: &str, k: usize) -> Result<Vec<Neighbor>, RagError> {
        if k == 0 {
            return Err(RagError::InvalidArgument(
                "k must be greater than zero".to_string(),
            ));
        }
        if self.is_empty().await {
            return Ok(Vec::new());
        }
        let vector = self.embed(text).await.map_err(as_embedding_error)?;
        self.query(&vector, k).await
    }

    pub async fn documents(&self) -> Vec<DocumentSummary> {
        let state = self.snapshot().await;
        let mut summaries: BTreeMap<&DocumentId, DocumentSummary> = BTreeMap::new();
        for entry in state.entries.values() {
            summaries
                .entry(&entry.chunk.document_id)
                .or_insert_with(|| DocumentSummary {
                    id: entry.chunk.document_id.clone(),
                    origin: entry.chunk.origin.clone(),
                    chunk_count: 0,
                })
                .chunk_count += 1;
        }
        summaries.into_values().collect()
    }

    pub async fn stats(&self) -> IndexStats {
        let state = self.snapshot().await;
        let documents = state
            .entries
            .values()
            .map(|entry| &entry.chunk.document_id)
            .collect::<BTreeSet<_>>()
            .len();
        IndexStats {
            model_id: self.embedder.model_id().to_string(),
            dimension: self.dimension,
            metric: self.metric,
            version: state.version,
            entries: state.entries.len(),
            documents,
        }
    }

    /// Writes the current state to a snapshot file.
    pub async fn persist(&self, path: &Path) -> Result<SnapshotMeta, RagError> {
        let _guard = self.persist_lock.lock().await;
        let state = self.snapshot().await;
        let entries: Vec<Arc<IndexEntry>> = state.entries.values().cloned().collect();
        let meta = snapshot::write_snapshot(
            path,
            self.embedder.model_id(),
            self.dimension,
            self.metric,
            state.version,
            &entries,
        )
        .await?;
        tracing::info!(
            "Persisted index snapshot ({} entries, version {}) to {}",
            meta.entry_count,
            meta.index_version,
            path.display()
        );
        Ok(meta)
    }

    /// Rebuilds an index from a snapshot written by [`EmbeddingIndex::persist`].
    ///
    /// The snapshot must have been produced with the same embedding model and
    /// dimension as `embedder`.
    pub async fn load(
        path: &Path,
        embedder: Arc<dyn Embedder>,
        metric: DistanceMetric,
    ) -> Result<Self, RagError> {
        let (meta, entries) = snapshot::read_snapshot(path).await?;

        if meta.model_id != embedder.model_id() || meta.dimension != embedder.dimension() {
            return Err(RagError::Configuration(format!(
                "snapshot {} was built with {} ({} dims), configured embedder is {} ({} dims)",
                path.display(),
                meta.model_id,
                meta.dimension,
                embedder.model_id(),
                embedder.dimension()
            )));
        }
        if meta.metric != metric {
            tracing::warn!(
                "Snapshot metric {} differs from configured {}; using {}",
                meta.metric.as_str(),
                metric.as_str(),
                metric.as_str()
            );
        }

        let index = Self::new(embedder, metric);
        let entries = entries
            .into_iter()
            .map(|entry| (entry.chunk.id.clone(), Arc::new(entry)))
            .collect();
        *index.state.write().await = Arc::new(IndexState {
            version: meta.index_version,
            entries,
        });

        tracing::info!(
            "Loaded index snapshot ({} entries, version {}) from {}",
            meta.entry_count,
            meta.index_version,
            path.display()
        );
        Ok(index)
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
        let Some(timeout) = self.embed_timeout else {
            return self.embedder.embed(text).await;
        };
        tokio::time::timeout(timeout, self.embedder.embed(text))
            .await
            .unwrap_or_else(|_| {
                Err(RagError::Embedding(format!(
                    "{} did not respond within {:?}",
                    self.embedder.model_id(),
                    timeout
                )))
            })
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<(), RagError> {
        if vector.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        Ok(())
    }
}

fn as_embedding_error(err: RagError) -> RagError {
    match err {
        RagError::Embedding(_) | RagError::DimensionMismatch { .. } => err,
        other => RagError::Embedding(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::rag::chunker::chunk;
    use crate::rag::document::Document;
    use crate::rag::embedding::HashingEmbedder;

    /// Counts calls and fails every call after `fail_after`.
    struct FlakyEmbedder {
        inner: HashingEmbedder,
        calls: AtomicUsize,
        fail_after: usize,
    }

    impl FlakyEmbedder {
        fn new(fail_after: usize) -> Self {
            Self {
                inner: HashingEmbedder::new(32),
                calls: AtomicUsize::new(0),
                fail_after,
            }
        }
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        fn model_id(&self) -> &str {
            self.inner.model_id()
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.fail_after {
                return Err(RagError::Embedding("provider unavailable".to_string()));
            }
            Ok(self.inner.embed_sync(text))
        }
    }

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        fn model_id(&self) -> &str {
            "fixed"
        }

        fn dimension(&self) -> usize {
            3
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, RagError> {
            Ok(self.0.clone())
        }
    }

    fn chunks_of(origin: &str, text: &str) -> Vec<Chunk> {
        let doc = Document::new(origin, text);
        chunk(&doc, 40, 5).unwrap().collect()
    }

    fn hashing_index() -> EmbeddingIndex {
        EmbeddingIndex::new(Arc::new(HashingEmbedder::new(32)), DistanceMetric::Cosine)
    }

    #[test]
    fn cosine_and_l2_distances() {
        let cosine = DistanceMetric::Cosine;
        assert!((cosine.distance(&[1.0, 0.0], &[1.0, 0.0])).abs() < 1e-6);
        assert!((cosine.distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert_eq!(cosine.distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
        assert!((cosine.normalize(2.0) - 1.0).abs() < 1e-6);

        let l2 = DistanceMetric::L2;
        assert!((l2.distance(&[0.0, 0.0], &[3.0, 4.0]) - 5.0).abs() < 1e-6);
        assert!((l2.normalize(1.0) - 0.5).abs() < 1e-6);
    }

    #[tokio::test]
    async fn re_adding_is_idempotent_and_skips_the_embedder() {
        let embedder = Arc::new(FlakyEmbedder::new(usize::MAX));
        let index = EmbeddingIndex::new(embedder.clone(), DistanceMetric::Cosine);
        let chunks = chunks_of("a.txt", "alpha beta gamma delta epsilon zeta eta theta iota kappa");

        let first = index.add(chunks.clone()).await.unwrap();
        let calls_after_first = embedder.calls.load(Ordering::SeqCst);
        let version = index.version().await;
        let second = index.add(chunks.clone()).await.unwrap();

        assert_eq!(first.embedded, chunks.len());
        assert_eq!(second.embedded, 0);
        assert_eq!(second.reused, chunks.len());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), calls_after_first);
        assert_eq!(index.len().await, chunks.len());
        assert_eq!(index.version().await, version);
    }

    #[tokio::test]
    async fn partial_failure_commits_the_embedded_prefix() {
        let index = EmbeddingIndex::new(Arc::new(FlakyEmbedder::new(2)), DistanceMetric::Cosine)
            .with_concurrency(1);
        let chunks = chunks_of(
            "long.txt",
            "one two three four five six seven eight nine ten eleven twelve thirteen fourteen",
        );
        assert!(chunks.len() > 2);

        let result = index.add(chunks.clone()).await;

        assert!(matches!(result, Err(RagError::Embedding(_))));
        assert_eq!(index.len().await, 2);
        let ids: Vec<ChunkId> = index
            .query(&HashingEmbedder::new(32).embed_sync("one"), 10)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.entry.chunk.id.clone())
            .collect();
        let mut expected = vec![chunks[0].id.clone(), chunks[1].id.clone()];
        expected.sort();
        let mut ids_sorted = ids.clone();
        ids_sorted.sort();
        assert_eq!(ids_sorted, expected);
    }

    #[tokio::test]
    async fn rejects_vectors_of_the_wrong_dimension() {
        struct Wrong;

        #[async_trait]
        impl Embedder for Wrong {
            fn model_id(&self) -> &str {
                "wrong"
            }
            fn dimension(&self) -> usize {
                4
            }
            async fn embed(&self, _text: &str) -> Result<Vec<f32>, RagError> {
                Ok(vec![1.0, 0.0])
            }
        }

        let index = EmbeddingIndex::new(Arc::new(Wrong), DistanceMetric::Cosine);
        let result = index.add(chunks_of("w.txt", "some text")).await;
        assert!(matches!(
            result,
            Err(RagError::DimensionMismatch {
                expected: 4,
                actual: 2
            })
        ));
        assert!(index.is_empty().await);

        let probe = index.query(&[1.0, 0.0], 1).await;
        assert!(matches!(probe, Err(RagError::DimensionMismatch { .. })));
    }

    #[tokio::test]
    async fn query_rejects_zero_k() {
        let index = hashing_index();
        assert!(matches!(
            index.query(&[0.0; 32], 0).await,
            Err(RagError::InvalidArgument(_))
        ));
        assert!(matches!(
            index.query_text("anything", 0).await,
            Err(RagError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn query_orders_by_distance_then_chunk_id() {
        let index = EmbeddingIndex::new(
            Arc::new(FixedEmbedder(vec![1.0, 0.0, 0.0])),
            DistanceMetric::Cosine,
        );
        let mut chunks = chunks_of("b.txt", "bravo");
        chunks.extend(chunks_of("a.txt", "alpha"));
        index.add(chunks).await.unwrap();

        let neighbors = index.query(&[1.0, 0.0, 0.0], 5).await.unwrap();
        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors[0].distance, neighbors[1].distance);
        assert!(neighbors[0].entry.chunk.id < neighbors[1].entry.chunk.id);
    }

    #[tokio::test]
    async fn nearest_entry_ranks_first() {
        let index = hashing_index();
        index
            .add(chunks_of("policy.txt", "Vacation policy: 15 days per year."))
            .await
            .unwrap();
        index
            .add(chunks_of("menu.txt", "The cafeteria serves soup on Mondays."))
            .await
            .unwrap();

        let neighbors = index.query_text("How many vacation days?", 2).await.unwrap();
        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors[0].entry.chunk.origin, "policy.txt");
        assert!(neighbors[0].distance <= neighbors[1].distance);
    }

    #[tokio::test]
    async fn remove_cascades_to_all_chunks_of_a_document() {
        let index = hashing_index();
        let long = "word ".repeat(40);
        index.add(chunks_of("long.txt", &long)).await.unwrap();
        index.add(chunks_of("keep.txt", "keep me")).await.unwrap();
        assert!(index.len().await > 2);

        let removed = index
            .remove(&DocumentId::from_origin("long.txt"))
            .await
            .unwrap();

        assert!(removed > 1);
        assert_eq!(index.len().await, 1);
        assert_eq!(index.documents().await[0].origin, "keep.txt");
        assert_eq!(
            index
                .remove(&DocumentId::from_origin("missing.txt"))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn replace_document_drops_stale_chunks_in_one_commit() {
        let index = hashing_index();
        let old = chunks_of("doc.txt", &"old text ".repeat(20));
        index.add(old.clone()).await.unwrap();
        let version = index.version().await;

        let new = chunks_of("doc.txt", "brand new text");
        let doc_id = new[0].document_id.clone();
        let report = index.replace_document(&doc_id, new.clone()).await.unwrap();

        assert_eq!(report.removed, old.len() - 1);
        assert_eq!(report.embedded, 1);
        assert_eq!(index.len().await, 1);
        assert_eq!(index.version().await, version + 1);

        let foreign = chunks_of("other.txt", "x");
        assert!(matches!(
            index.replace_document(&doc_id, foreign).await,
            Err(RagError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn failed_replacement_keeps_the_previous_version_whole() {
        let v1 = chunks_of("doc.txt", &"alpha ".repeat(40));
        let embedder = Arc::new(FlakyEmbedder::new(v1.len()));
        let index = EmbeddingIndex::new(embedder, DistanceMetric::Cosine).with_concurrency(1);
        index.add(v1.clone()).await.unwrap();
        let version = index.version().await;

        let v2 = chunks_of("doc.txt", &"omega ".repeat(40));
        let doc_id = v2[0].document_id.clone();
        let result = index.replace_document(&doc_id, v2).await;

        assert!(matches!(result, Err(RagError::Embedding(_))));
        assert_eq!(index.version().await, version);
        assert_eq!(index.len().await, v1.len());
        let texts: Vec<String> = index
            .query(&HashingEmbedder::new(32).embed_sync("alpha"), v1.len())
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.entry.chunk.text.clone())
            .collect();
        assert!(texts.iter().all(|t| t.contains("alpha") && !t.contains("omega")));
    }

    /// Answers the first `respond` calls, then never returns.
    struct StallingEmbedder {
        inner: HashingEmbedder,
        calls: AtomicUsize,
        respond: usize,
    }

    #[async_trait]
    impl Embedder for StallingEmbedder {
        fn model_id(&self) -> &str {
            "stalling"
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, RagError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) >= self.respond {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(self.inner.embed_sync(text))
        }
    }

    #[tokio::test]
    async fn stalled_embedding_call_times_out() {
        let embedder = Arc::new(StallingEmbedder {
            inner: HashingEmbedder::new(32),
            calls: AtomicUsize::new(0),
            respond: 1,
        });
        let index = EmbeddingIndex::new(embedder, DistanceMetric::Cosine)
            .with_embed_timeout(Duration::from_millis(50));
        index.add(chunks_of("a.txt", "short note")).await.unwrap();

        let query = index.query_text("note", 1).await;
        assert!(matches!(query, Err(RagError::Embedding(_))));

        let add = index.add(chunks_of("b.txt", "another note")).await;
        assert!(matches!(add, Err(RagError::Embedding(_))));
        assert_eq!(index.len().await, 1);
    }

    #[tokio::test]
    async fn query_text_on_empty_index_skips_embedding() {
        let index = EmbeddingIndex::new(Arc::new(FlakyEmbedder::new(0)), DistanceMetric::Cosine);
        assert!(index.query_text("hello", 3).await.unwrap().is_empty());
    }
}
