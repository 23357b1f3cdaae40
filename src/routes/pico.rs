//! `POST /api/pico`: HTTP ingestion for the soil-moisture microcontroller.
//!
//! The body holds one or more newline-separated JSON lines in the same format
//! the Pico writes to its serial port. Lines are checked here so the client
//! gets a 400 for garbage, then handed to the moisture source through the
//! shared line channel. A full channel answers 503 rather than blocking.

use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router,
};
use chrono::Utc;
use serde_json::json;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::error_response;
use crate::app::AppContext;
use crate::sources::parse_line;

// ---

pub fn router() -> Router<AppContext> {
    Router::new().route("/api/pico", post(ingest))
}

async fn ingest(State(ctx): State<AppContext>, body: String) -> impl IntoResponse {
    // ---
    let lines: Vec<&str> = body
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Empty body");
    }

    for line in &lines {
        if let Err(e) = parse_line(line, Utc::now()) {
            warn!("POST /api/pico - rejected line: {}", e);
            return error_response(StatusCode::BAD_REQUEST, e.to_string());
        }
    }

    let mut accepted = 0;
    for line in lines {
        match ctx.pico_lines.try_send(line.to_string()) {
            Ok(()) => accepted += 1,
            Err(TrySendError::Full(_)) => {
                warn!(accepted, "POST /api/pico - moisture queue full");
                return error_response(StatusCode::SERVICE_UNAVAILABLE, "Moisture queue is full");
            }
            Err(TrySendError::Closed(_)) => {
                return error_response(StatusCode::SERVICE_UNAVAILABLE, "Moisture source stopped");
            }
        }
    }

    debug!(accepted, "POST /api/pico - lines queued");
    (StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))).into_response()
}
