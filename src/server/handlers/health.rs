use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::state::AppState;

pub async fn health(State(_state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.engine.status().await;
    Json(json!({
        "status": "ok",
        "started_at": state.started_at,
        "engine": status,
    }))
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use tempfile::tempdir;

    use super::*;
    use crate::server::handlers::test_support;

    #[tokio::test]
    async fn status_reports_index_stats() {
        let dir = tempdir().unwrap();
        let state = test_support::state(dir.path());

        let response = get_status(State(state)).await.into_response();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(value["engine"]["index"]["entries"], 0);
        assert_eq!(value["engine"]["index"]["model_id"], "hashing-32");
        assert_eq!(value["engine"]["llm_provider"], "citing");
    }
}
