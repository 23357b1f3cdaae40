//! `GET /api/status`: everything the live dashboard shows in one document.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::alert::AlertState;
use crate::app::AppContext;
use crate::bus::BusStats;
use crate::models::HumidifierState;
use crate::status::BoardSnapshot;

// ---

pub fn router() -> Router<AppContext> {
    Router::new().route("/api/status", get(status))
}

#[derive(Serialize)]
struct StatusResponse {
    #[serde(flatten)]
    board: BoardSnapshot,
    alerts: Vec<AlertState>,
    /// Believed plug state; `null` when no humidifier is configured.
    humidifier: Option<HumidifierState>,
    notifications_enabled: bool,
    bus: BusStats,
}

async fn status(State(ctx): State<AppContext>) -> Json<StatusResponse> {
    // ---
    let mut board = ctx.board.borrow().clone();
    // The controller's own view wins over the last bus message
    let humidifier = ctx
        .humidifier
        .as_ref()
        .map(|rx| *rx.borrow())
        .or(board.humidifier.take());

    Json(StatusResponse {
        board,
        alerts: ctx.alerts.borrow().clone(),
        humidifier,
        notifications_enabled: ctx.settings.notifications_enabled(),
        bus: ctx.bus.stats(),
    })
}
