// src/routes/health.rs
//! Liveness endpoint for process supervisors.
//!
//! Exports to the gateway (`mod.rs`) a subrouter with `GET /health`. The
//! handler touches neither the store nor the bus.

use axum::{routing::get, Json, Router};
use serde::Serialize;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Generic over the gateway state so it merges into any router.
pub fn router<S>() -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/health", get(health))
}
