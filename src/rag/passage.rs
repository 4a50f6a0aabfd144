use serde::{Deserialize, Serialize};

use super::index::IndexEntry;
use crate::search::SearchResult;

/// Where a passage came from. Local sorts before web.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Local,
    Web,
}

/// A unit of retrievable text with a relevance score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub kind: SourceKind,
    /// Chunk id for local passages, URL for web passages
    pub source_id: String,
    /// Filename or URL shown to readers
    pub origin: String,
    pub title: Option<String>,
    /// Source page of a local passage from a paginated document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    pub text: String,
    pub score: f64,
}

impl Passage {
    pub fn local(entry: &IndexEntry, score: f64) -> Self {
        Self {
            kind: SourceKind::Local,
            source_id: entry.chunk.id.clone(),
            origin: entry.chunk.origin.clone(),
            title: None,
            page: entry.chunk.page,
            text: entry.chunk.text.clone(),
            score,
        }
    }

    pub fn web(result: &SearchResult, score: f64) -> Self {
        let text = if result.snippet.is_empty() {
            result.title.clone()
        } else {
            result.snippet.clone()
        };
        Self {
            kind: SourceKind::Web,
            source_id: result.url.clone(),
            origin: result.url.clone(),
            title: Some(result.title.clone()),
            page: None,
            text,
            score,
        }
    }

    /// Length counted against the context budget.
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}
