//! Answer synthesis: prompt construction, model call with bounded retry,
//! and citation recovery.

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::context_builder::ContextBundle;
use super::passage::{Passage, SourceKind};
use crate::core::config::LlmConfig;
use crate::core::errors::RagError;
use crate::llm::{ChatMessage, ChatRequest, LlmProvider};

const GROUNDED_RULES: &str = "<grounding_rules>
- Answer using only the numbered sources supplied with the question.
- After every statement taken from a source, cite it with its marker, e.g. [S1] or [S1, S3].
- Never cite a marker that was not supplied.
- If the sources do not contain the answer, say so plainly instead of guessing.
</grounding_rules>";

const UNGROUNDED_RULES: &str = "<grounding_rules>
- No documents or web results were found for this question.
- Say that you could not find supporting sources, then answer from general knowledge if you can.
- Do not include citation markers.
</grounding_rules>";

static CITATION_RE: OnceLock<Regex> = OnceLock::new();

fn citation_re() -> &'static Regex {
    CITATION_RE.get_or_init(|| {
        Regex::new(r"\[\s*(S\d+(?:\s*,\s*S\d+)*)\s*\]").expect("citation pattern is valid")
    })
}

/// A source the answer refers to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    /// Marker used in the answer text, e.g. `S2`
    pub marker: String,
    pub source_id: String,
    pub kind: SourceKind,
    pub origin: String,
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    /// In order of first appearance in `text`
    pub citations: Vec<Citation>,
    /// False when no context was supplied to the model
    pub grounded: bool,
    pub web_degraded: bool,
}

impl Answer {
    pub fn cited_source_ids(&self) -> Vec<&str> {
        self.citations.iter().map(|c| c.source_id.as_str()).collect()
    }

    /// Plain-text source list for front ends that cannot render citations.
    pub fn footnotes(&self) -> String {
        self.citations
            .iter()
            .map(|c| match (&c.kind, &c.title, c.page) {
                (SourceKind::Web, Some(title), _) => {
                    format!("[{}] {} ({})", c.marker, title, c.origin)
                }
                (_, _, Some(page)) => format!("[{}] {}, page {}", c.marker, c.origin, page),
                _ => format!("[{}] {}", c.marker, c.origin),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub struct AnswerSynthesizer {
    llm: Arc<dyn LlmProvider>,
    model: String,
    timeout: Duration,
    max_retries: u32,
    config: LlmConfig,
}

impl AnswerSynthesizer {
    pub fn new(llm: Arc<dyn LlmProvider>, config: &LlmConfig) -> Self {
        Self {
            llm,
            model: config.model.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            config: config.clone(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn llm(&self) -> &Arc<dyn LlmProvider> {
        &self.llm
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generates an answer from `context`.
    ///
    /// An empty bundle produces an ungrounded answer, not an error. Failed
    /// generation is always an error and never an empty answer.
    pub async fn synthesize(
        &self,
        question: &str,
        context: &ContextBundle,
        persona: &str,
    ) -> Result<Answer, RagError> {
        let grounded = context.is_grounded();
        let request =
            ChatRequest::new(build_messages(question, context, persona)).with_config(&self.config);

        let text = self.generate(request).await?;
        let citations = if grounded {
            extract_citations(&text, &context.passages)
        } else {
            Vec::new()
        };

        Ok(Answer {
            text,
            citations,
            grounded,
            web_degraded: false,
        })
    }

    async fn generate(&self, request: ChatRequest) -> Result<String, RagError> {
        let mut attempt = 0u32;
        loop {
            let result = match tokio::time::timeout(
                self.timeout,
                self.llm.chat(request.clone(), &self.model),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RagError::transient_generation(format!(
                    "{} did not respond within {:?}",
                    self.llm.name(),
                    self.timeout
                ))),
            };

            match result {
                Ok(text) if text.trim().is_empty() => {
                    return Err(RagError::generation("model returned an empty answer"));
                }
                Ok(text) => return Ok(text.trim().to_string()),
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Generation attempt {} failed, retrying: {}",
                        attempt,
                        err
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub fn build_messages(question: &str, context: &ContextBundle, persona: &str) -> Vec<ChatMessage> {
    if !context.is_grounded() {
        return vec![
            ChatMessage::system(format!("{}\n\n{}", persona.trim(), UNGROUNDED_RULES)),
            ChatMessage::user(format!("Question: {}", question.trim())),
        ];
    }

    let sources = context
        .passages
        .iter()
        .enumerate()
        .map(|(i, passage)| format!("[S{}] {}\n{}", i + 1, source_label(passage), passage.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n");

    vec![
        ChatMessage::system(format!("{}\n\n{}", persona.trim(), GROUNDED_RULES)),
        ChatMessage::user(format!(
            "Sources:\n\n{}\n\nQuestion: {}",
            sources,
            question.trim()
        )),
    ]
}

fn source_label(passage: &Passage) -> String {
    match passage.kind {
        SourceKind::Local => match passage.page {
            Some(page) => format!("(document: {}, page {})", passage.origin, page),
            None => format!("(document: {})", passage.origin),
        },
        SourceKind::Web => match &passage.title {
            Some(title) if !title.is_empty() => format!("(web: {}, {})", title, passage.origin),
            _ => format!("(web: {})", passage.origin),
        },
    }
}

/// Maps `[S<n>]` markers back to `passages`, in order of first appearance.
/// Markers outside `1..=passages.len()` are ignored.
pub fn extract_citations(text: &str, passages: &[Passage]) -> Vec<Citation> {
    let mut seen = HashSet::new();
    let mut citations = Vec::new();
    for caps in citation_re().captures_iter(text) {
        for marker in caps[1].split(',').map(str::trim) {
            let Some(n) = marker
                .strip_prefix('S')
                .and_then(|n| n.parse::<usize>().ok())
            else {
                continue;
            };
            if n == 0 || n > passages.len() || !seen.insert(n) {
                continue;
            }
            let passage = &passages[n - 1];
            citations.push(Citation {
                marker: format!("S{}", n),
                source_id: passage.source_id.clone(),
                kind: passage.kind,
                origin: passage.origin.clone(),
                title: passage.title.clone(),
                page: passage.page,
            });
        }
    }
    citations
}
