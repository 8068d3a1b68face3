//! Shared application state injected into every Axum handler.

use std::sync::Arc;

use seqforge_core::{ReferenceEngine, Scheduler};
use tokio::sync::{Mutex, Semaphore};

use crate::config::Config;

/// State shared across all HTTP handlers.
///
/// The engine is process-wide and the scheduler serializes all calls to it
/// through a single executor (§5), so every request takes the same
/// `scheduler` lock for the duration of its run; `admission` bounds how many
/// requests are allowed to queue for that lock at once (§4.3, §10.2
/// `request_concurrency_limit`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub scheduler: Arc<Mutex<Scheduler<ReferenceEngine>>>,
    pub admission: Arc<Semaphore>,
    pub token_map: Arc<Vec<String>>,
}
