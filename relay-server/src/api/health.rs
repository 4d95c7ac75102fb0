//! Health Check Endpoint
//!
//! This module defines the health endpoint for the relay server.
//!
//! - `/health` – general liveness check
//!
//! The endpoint includes a `Cache-Control: no-cache` header to prevent
//! caching of responses.

use axum::{
    Router,
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use tower_http::set_header::SetResponseHeaderLayer;

/// Create a router containing the health endpoint.
///
/// The endpoint has `Cache-Control: no-cache` set.
pub(crate) fn routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
}

/// Liveness check. The relay server has no external dependencies to poll, so
/// a successful response means only that the HTTP listener itself is up.
async fn health() -> impl IntoResponse {
    (StatusCode::OK, "healthy")
}
