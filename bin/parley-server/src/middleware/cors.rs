use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;

/// CORS layer: the configured comma-separated allow list, or any origin.
///
/// A list that contains no parsable origin falls back to any origin.
pub fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<axum::http::HeaderValue> = config
        .cors_allowed_origins
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .filter(|v: &axum::http::HeaderValue| !v.is_empty())
        .collect();

    let layer = CorsLayer::new().allow_headers(Any).allow_methods(Any);
    if origins.is_empty() {
        // Wildcard for development; set PARLEY_CORS_ORIGINS in production.
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(origins)
    }
}
