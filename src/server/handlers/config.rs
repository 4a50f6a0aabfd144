use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::core::errors::RagError;
use crate::state::AppState;

/// Effective configuration with secrets masked.
pub async fn get_config(State(state): State<Arc<AppState>>) -> Result<Json<Value>, RagError> {
    let config = serde_json::to_value(state.config.as_ref()).map_err(RagError::internal)?;
    Ok(Json(state.config_service.redact_sensitive_values(&config)))
}

#[derive(Debug, Deserialize)]
pub struct PersonaRequest {
    pub persona_text: String,
}

pub async fn get_persona(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({ "persona_text": state.engine.persona().await }))
}

pub async fn set_persona(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PersonaRequest>,
) -> Result<Json<Value>, RagError> {
    state.engine.set_persona(payload.persona_text).await?;
    Ok(Json(json!({"status": "success"})))
}

pub async fn reset_persona(State(state): State<Arc<AppState>>) -> Json<Value> {
    state.engine.reset_persona().await;
    Json(json!({"status": "success"}))
}
