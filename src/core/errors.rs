use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("search unavailable: {0}")]
    SearchUnavailable(String),
    #[error("generation error: {message}")]
    Generation { message: String, transient: bool },
    #[error("index corruption: {0}")]
    IndexCorruption(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl RagError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        RagError::Internal(err.to_string())
    }

    pub fn generation(message: impl Into<String>) -> Self {
        RagError::Generation {
            message: message.into(),
            transient: false,
        }
    }

    /// Timeouts and transport failures; eligible for retry.
    pub fn transient_generation(message: impl Into<String>) -> Self {
        RagError::Generation {
            message: message.into(),
            transient: true,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, RagError::Generation { transient: true, .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RagError::Configuration(_) => "configuration",
            RagError::InvalidArgument(_) => "invalid_argument",
            RagError::DimensionMismatch { .. } => "dimension_mismatch",
            RagError::Embedding(_) => "embedding",
            RagError::SearchUnavailable(_) => "search_unavailable",
            RagError::Generation { .. } => "generation",
            RagError::IndexCorruption(_) => "index_corruption",
            RagError::NotFound(_) => "not_found",
            RagError::Internal(_) => "internal",
        }
    }
}

impl IntoResponse for RagError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            RagError::Configuration(_)
            | RagError::InvalidArgument(_)
            | RagError::DimensionMismatch { .. } => StatusCode::BAD_REQUEST,
            RagError::NotFound(_) => StatusCode::NOT_FOUND,
            RagError::Embedding(_) | RagError::Generation { .. } => StatusCode::BAD_GATEWAY,
            RagError::SearchUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RagError::IndexCorruption(_) | RagError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({ "error": self.to_string(), "kind": self.kind() }));
        (status, body).into_response()
    }
}
