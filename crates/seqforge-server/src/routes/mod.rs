//! Axum router construction.

mod completion;
mod health;
mod token_map;
mod tokenize;

use std::sync::Arc;

use axum::Router;

use crate::middleware::{cors, TraceLayer};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    let cors = cors::cors_layer(&state.config);

    Router::new()
        .merge(health::router())
        .merge(tokenize::router())
        .merge(completion::router())
        .merge(token_map::router())
        // Outermost layers execute first on the way in.
        .layer(TraceLayer::new())
        .layer(cors)
        .with_state(state)
}
