//! Info Endpoint
//!
//! Returns cargo package name and version of the relay server build.
//!
//! - `/version` – returns the version string
//!
//! The endpoint includes a `Cache-Control: no-cache` header to prevent
//! caching of responses.

use axum::{
    http::{HeaderValue, StatusCode, header},
    response::IntoResponse,
    routing::get,
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;

/// Create a router containing the info endpoints.
///
/// All endpoints have `Cache-Control: no-cache` set.
pub(crate) fn routes() -> Router {
    Router::new()
        .route("/version", get(version))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache"),
        ))
}

/// Responds with cargo package name and version of the relay server build.
///
/// Returns `200 OK` with a string response.
async fn version() -> impl IntoResponse {
    (
        StatusCode::OK,
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION")),
    )
}
