//! Test-only helpers for constructing an [`AppState`] backed by the
//! deterministic [`ReferenceEngine`], shared by the route unit tests.

use std::sync::Arc;

use seqforge_core::{Config as CoreConfig, EngineAdapter, ReferenceEngine, Scheduler};
use tokio::sync::{Mutex, Semaphore};

use crate::config::Config;
use crate::state::AppState;

pub fn test_state() -> Arc<AppState> {
    let engine = ReferenceEngine::new(64, 4096);
    let token_map = (0..engine.vocab_size() as i32)
        .map(|t| engine.token_to_piece(t))
        .collect();
    let scheduler = Scheduler::new(engine, CoreConfig::default()).expect("reference engine never fails to initialize");
    Arc::new(AppState {
        config: Arc::new(Config {
            core: CoreConfig::default(),
            bind_address: "127.0.0.1:0".to_string(),
            log_level: "info".to_string(),
            log_json: false,
            cors_allowed_origins: None,
        }),
        scheduler: Arc::new(Mutex::new(scheduler)),
        admission: Arc::new(Semaphore::new(4)),
        token_map: Arc::new(token_map),
    })
}
