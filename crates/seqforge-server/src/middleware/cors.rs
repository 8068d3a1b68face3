use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;

pub fn cors_layer(config: &Config) -> CorsLayer {
    match &config.cors_allowed_origins {
        Some(origins_str) => {
            let origins: Vec<axum::http::HeaderValue> = origins_str
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            if origins.is_empty() {
                CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any)
            } else {
                CorsLayer::new().allow_origin(origins).allow_headers(Any).allow_methods(Any)
            }
        }
        // Wildcard — suitable for development; set SEQFORGE_CORS_ORIGINS in
        // production to restrict to trusted origins.
        None => CorsLayer::new().allow_origin(Any).allow_headers(Any).allow_methods(Any),
    }
}
