//! `GET /token_map` (§6.2).

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};

use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/token_map", get(token_map))
}

async fn token_map(State(state): State<Arc<AppState>>) -> Json<HashMap<String, String>> {
    let map = state
        .token_map
        .iter()
        .enumerate()
        .map(|(id, piece)| (id.to_string(), piece.clone()))
        .collect();
    Json(map)
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::collections::HashMap;
    use tower::ServiceExt;

    #[tokio::test]
    async fn token_map_covers_the_whole_vocabulary() {
        let state = crate::test_support::test_state();
        let vocab_size = state.token_map.len();
        let router = crate::routes::build(state);

        let response = router
            .oneshot(Request::get("/token_map").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let map: HashMap<String, String> = serde_json::from_slice(&body).unwrap();
        assert_eq!(map.len(), vocab_size);
        assert!(map.contains_key("0"));
    }
}
