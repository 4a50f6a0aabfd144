use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Deserialize;

use crate::core::errors::RagError;
use crate::rag::Answer;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AnswerRequest {
    pub question: String,
}

pub async fn answer(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AnswerRequest>,
) -> Result<Json<Answer>, RagError> {
    let answer = state.engine.answer(&payload.question).await?;
    Ok(Json(answer))
}
