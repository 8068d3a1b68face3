//! Server configuration, loaded from environment variables at startup.
//!
//! Wraps `seqforge_core::Config` (the engine-facing knobs) with the
//! HTTP-façade-only fields of §10.2: bind address, logging, and CORS.

use std::env;

use seqforge_core::Config as CoreConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub core: CoreConfig,

    /// TCP address to bind (default: `127.0.0.1:8089`).
    pub bind_address: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Comma-separated list of allowed CORS origins. `None` (default) means
    /// all origins are allowed — convenient for development, but should be
    /// restricted to trusted origins in production.
    pub cors_allowed_origins: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            core: CoreConfig::from_env(),
            bind_address: env_or("SEQFORGE_BIND", "127.0.0.1:8089"),
            log_level: env_or("SEQFORGE_LOG", "info"),
            log_json: env::var("SEQFORGE_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            cors_allowed_origins: env::var("SEQFORGE_CORS_ORIGINS").ok(),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}
