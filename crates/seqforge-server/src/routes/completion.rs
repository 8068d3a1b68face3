//! `POST /streaming_completion` (§6.2): runs one client program to
//! completion, streaming each token event back as one NDJSON line
//! `[op_id, token_index, token_id, [[cand_id, logit], …]]`.
//!
//! The scheduler owns the engine exclusively (§5), so a request holds the
//! scheduler's lock for its whole run; `admission` bounds how many requests
//! are allowed to wait for that lock at once rather than queueing without
//! bound (§10.2 `request_concurrency_limit`). Submission-time validation
//! (§7 `InvalidProgram`) happens before any engine work or lock acquisition.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;

use seqforge_core::{validate_program, CancelToken, OperationWire, SchedulerError};

use crate::error::ServerError;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/streaming_completion", post(streaming_completion))
}

#[derive(Debug, Deserialize)]
struct StreamingCompletionRequest {
    operations: Vec<OperationWire>,
}

async fn streaming_completion(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StreamingCompletionRequest>,
) -> Result<Response, ServerError> {
    let program = validate_program(req.operations)?;

    let permit = Arc::clone(&state.admission)
        .try_acquire_owned()
        .map_err(|_| ServerError::Busy)?;

    let (tx, mut rx) = tokio::sync::mpsc::channel::<bytes::Bytes>(64);
    let scheduler = Arc::clone(&state.scheduler);

    // The scheduler loop runs on a blocking thread, so the only way to learn
    // the client has gone away is to watch the paired sender from an async
    // task and flip a flag the blocking loop polls once per tick (§5).
    let cancel = CancelToken::new();
    let cancel_watcher = cancel.clone();
    let tx_watch = tx.clone();
    tokio::spawn(async move {
        tx_watch.closed().await;
        cancel_watcher.cancel();
    });

    tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let mut scheduler = scheduler.blocking_lock();
        let result = scheduler.run(program, &cancel, |event| {
            let line = serde_json::json!([
                event.operation_id,
                event.token_index,
                event.token_id,
                event.top_candidates,
            ]);
            if let Ok(mut bytes) = serde_json::to_vec(&line) {
                bytes.push(b'\n');
                let _ = tx.blocking_send(bytes::Bytes::from(bytes));
            }
        });
        // Headers are already committed to a 200 response by the time the
        // scheduler loop runs, so a late failure (tick cap, exhausted
        // retries) is reported as a trailing NDJSON line rather than a
        // different status code. Cancellation means the client is already
        // gone, so there's no point logging it as a failure or trying to
        // send a trailing line down a channel whose receiver is dropped.
        if let Err(e) = result {
            if matches!(e, SchedulerError::Cancelled) {
                return;
            }
            tracing::warn!(error = %e, "streaming_completion ended with an error");
            let line = serde_json::json!({ "error": e.to_string() });
            if let Ok(mut bytes) = serde_json::to_vec(&line) {
                bytes.push(b'\n');
                let _ = tx.blocking_send(bytes::Bytes::from(bytes));
            }
        }
    });

    let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx).map(|b| b.map(Ok::<_, std::io::Error>)));
    let body = Body::from_stream(stream);

    Ok((
        [(axum::http::header::CONTENT_TYPE, "application/x-ndjson")],
        body,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;
    use tower::ServiceExt;

    fn wire_completion(id: u64, max_tokens: u32) -> serde_json::Value {
        json!({
            "id": id,
            "name": "completion",
            "completion": { "role": "assistant", "max_tokens": max_tokens, "top_p_k": 0 },
        })
    }

    #[tokio::test]
    async fn streaming_completion_rejects_an_empty_program() {
        let router = crate::routes::build(crate::test_support::test_state());
        let request = Request::post("/streaming_completion")
            .header("content-type", "application/json")
            .body(Body::from(json!({ "operations": [] }).to_string()))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn streaming_completion_accepts_a_well_formed_program() {
        let router = crate::routes::build(crate::test_support::test_state());
        let request = Request::post("/streaming_completion")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({ "operations": [wire_completion(1, 2)] }).to_string(),
            ))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(!body.is_empty());
    }
}
