//! `POST /tokenize` (§6.2).

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use seqforge_core::TokenId;

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/tokenize", post(tokenize))
}

#[derive(Debug, Deserialize)]
struct TokenizeRequest {
    text: String,
}

async fn tokenize(
    State(state): State<Arc<AppState>>,
    Json(req): Json<TokenizeRequest>,
) -> Result<Json<Vec<TokenId>>, ServerError> {
    let scheduler = state.scheduler.lock().await;
    let tokens = scheduler.tokenize(&req.text).map_err(|e| ServerError::BadRequest(e.to_string()))?;
    Ok(Json(tokens))
}
