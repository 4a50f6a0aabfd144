use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::errors::RagError;
use crate::rag::{DocumentId, IngestReport};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct UploadParams {
    pub filename: String,
}

pub async fn list_documents(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let documents = state.engine.documents().await;
    Json(json!({ "documents": documents }))
}

/// Raw file body; the extension of `filename` selects the loader.
pub async fn upload_document(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> Result<(StatusCode, Json<IngestReport>), RagError> {
    let report = state.engine.ingest_bytes(&params.filename, &body).await?;
    Ok((StatusCode::CREATED, Json(report)))
}

pub async fn delete_document(
    State(state): State<Arc<AppState>>,
    Path(document_id): Path<String>,
) -> Result<Json<Value>, RagError> {
    let id = DocumentId::from(document_id);
    let removed = state.engine.remove_document(&id).await?;
    Ok(Json(json!({
        "status": "deleted",
        "document_id": id,
        "chunks_removed": removed,
    })))
}

pub async fn persist_index(
    State(state): State<Arc<AppState>>,
) -> Result<impl IntoResponse, RagError> {
    let meta = state.engine.persist().await?;
    Ok(Json(meta))
}
