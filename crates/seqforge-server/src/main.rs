//! seqforge-server – entry point.
//!
//! Startup order:
//! 1. Parse configuration from environment variables.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Construct the reference engine and the scheduler that owns it.
//! 4. Build the Axum router and start the HTTP server with graceful
//!    shutdown.

mod config;
mod error;
mod middleware;
mod routes;
mod state;

#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tracing::{info, warn};

use seqforge_core::{EngineAdapter, ReferenceEngine, Scheduler};

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ─────────────────────────────────────────────────
    let cfg = Config::from_env();

    // ── 2. Tracing ────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: SEQFORGE_LOG='{}' is not a valid tracing filter ({e}); falling back to 'info'",
                    cfg.log_level
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "seqforge-server starting");

    // ── 3. Engine + scheduler ────────────────────────────────────────────
    // The reference engine is the crate's only shipped engine adapter
    // (§6.1): deterministic, in-process, no model file or native library.
    let engine = ReferenceEngine::new(cfg.core.batch_size as usize, cfg.core.context_size as usize);
    let token_map: Vec<String> = (0..engine.vocab_size() as i32)
        .map(|t| engine.token_to_piece(t))
        .collect();
    let scheduler = Scheduler::new(engine, cfg.core.clone())?;
    info!(vocab_size = token_map.len(), "engine ready");

    let state = Arc::new(AppState {
        admission: Arc::new(Semaphore::new(cfg.core.request_concurrency_limit)),
        scheduler: Arc::new(Mutex::new(scheduler)),
        token_map: Arc::new(token_map),
        config: Arc::new(cfg.clone()),
    });

    // ── 4. HTTP server with graceful shutdown ───────────────────────────
    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("seqforge-server stopped");
    Ok(())
}

/// Resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
