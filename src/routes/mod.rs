//! HTTP API gateway.
//!
//! Each sibling module exports a subrouter over [`AppContext`]; this module
//! merges them and attaches the shared state so `main.rs` never needs to
//! know about individual endpoints.

use axum::{http::StatusCode, response::IntoResponse, response::Response, Json, Router};
use serde_json::json;

use crate::app::AppContext;

mod health;
mod pico;
mod readings;
mod status;
mod thresholds;

// ---

pub fn router(context: AppContext) -> Router {
    // ---
    Router::new()
        .merge(readings::router())
        .merge(thresholds::router())
        .merge(status::router())
        .merge(pico::router())
        .merge(health::router())
        .with_state(context)
}

/// `{"error": message}` with `status`.
fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}
