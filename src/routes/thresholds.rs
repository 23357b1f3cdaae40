//! Admin view of the runtime-mutable settings.
//!
//! `PUT /api/thresholds` replaces the whole snapshot (thresholds,
//! notification enablement, retention). Invalid settings are rejected with
//! 400 and never reach the alert engine. Accepted settings take effect on
//! the next sample and are saved so they survive a restart.

use axum::{
    extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router,
};
use tracing::{error, info, warn};

use super::error_response;
use crate::app::AppContext;
use crate::settings::RuntimeSettings;

// ---

pub fn router() -> Router<AppContext> {
    Router::new().route("/api/thresholds", get(current).put(replace))
}

async fn current(State(ctx): State<AppContext>) -> Json<RuntimeSettings> {
    Json(ctx.settings.current())
}

async fn replace(
    State(ctx): State<AppContext>,
    Json(settings): Json<RuntimeSettings>,
) -> impl IntoResponse {
    // ---
    if let Err(e) = ctx.settings.update(settings) {
        warn!("Rejected settings update: {}", e);
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    if let Err(e) = ctx.settings.persist(ctx.settings_store.as_ref()).await {
        error!("Settings applied but not saved: {}", e);
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Settings applied but could not be saved",
        );
    }

    info!("PUT /api/thresholds - settings saved");
    (StatusCode::OK, Json(ctx.settings.current())).into_response()
}
