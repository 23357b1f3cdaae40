//! Reading queries for the dashboard charts.
//!
//! - `GET /api/latest[?metric=&source_id=]`
//! - `GET /api/stats?metric=&hours=&source_id=`
//! - `GET /api/series?metric=&hours=&source_id=`

use axum::{
    extract::Query, extract::State, http::StatusCode, response::IntoResponse, routing::get, Json,
    Router,
};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::error_response;
use crate::app::AppContext;
use crate::models::Metric;
use crate::store::{bucket_size, SeriesPoint, WindowStats};

/// Roughly how many points a chart series should have.
const SERIES_TARGET_POINTS: u32 = 500;
const MAX_HOURS: u32 = 24 * 31;

// ---

pub fn router() -> Router<AppContext> {
    // ---
    Router::new()
        .route("/api/latest", get(latest))
        .route("/api/stats", get(stats))
        .route("/api/series", get(series))
}

#[derive(Debug, Deserialize)]
struct LatestQuery {
    metric: Option<Metric>,
    source_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    metric: Metric,
    hours: Option<u32>,
    source_id: Option<String>,
}

impl WindowQuery {
    fn hours(&self) -> Result<u32, String> {
        match self.hours.unwrap_or(24) {
            h @ 1..=MAX_HOURS => Ok(h),
            h => Err(format!("hours must be between 1 and {MAX_HOURS}, got {h}")),
        }
    }
}

#[derive(Serialize)]
struct StatsResponse {
    metric: Metric,
    source_id: Option<String>,
    hours: u32,
    /// `null` when the window holds no readings.
    stats: Option<WindowStats>,
}

#[derive(Serialize)]
struct SeriesResponse {
    metric: Metric,
    source_id: Option<String>,
    hours: u32,
    bucket_seconds: u32,
    points: Vec<SeriesPoint>,
}

async fn latest(
    Query(params): Query<LatestQuery>,
    State(ctx): State<AppContext>,
) -> impl IntoResponse {
    // ---
    debug!("GET /api/latest {:?}", params);

    let Some(metric) = params.metric else {
        return match ctx.readings.latest_all().await {
            Ok(samples) => (StatusCode::OK, Json(samples)).into_response(),
            Err(e) => {
                error!("Failed to load latest readings: {}", e);
                error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load readings")
            }
        };
    };

    match ctx.readings.latest(metric, params.source_id.as_deref()).await {
        Ok(Some(sample)) => (StatusCode::OK, Json(sample)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, format!("No {metric} readings yet")),
        Err(e) => {
            error!("Failed to load latest {} reading: {}", metric, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load readings")
        }
    }
}

async fn stats(
    Query(params): Query<WindowQuery>,
    State(ctx): State<AppContext>,
) -> impl IntoResponse {
    // ---
    debug!("GET /api/stats {:?}", params);
    let hours = match params.hours() {
        Ok(hours) => hours,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };

    let since = Utc::now() - Duration::hours(i64::from(hours));
    match ctx
        .readings
        .windowed_stats(params.metric, params.source_id.as_deref(), since)
        .await
    {
        Ok(stats) => (
            StatusCode::OK,
            Json(StatsResponse {
                metric: params.metric,
                source_id: params.source_id,
                hours,
                stats,
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to compute {} stats: {}", params.metric, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to compute stats")
        }
    }
}

async fn series(
    Query(params): Query<WindowQuery>,
    State(ctx): State<AppContext>,
) -> impl IntoResponse {
    // ---
    debug!("GET /api/series {:?}", params);
    let hours = match params.hours() {
        Ok(hours) => hours,
        Err(msg) => return error_response(StatusCode::BAD_REQUEST, msg),
    };

    let now = Utc::now();
    let since = now - Duration::hours(i64::from(hours));
    let bucket_seconds = bucket_size(since, now, SERIES_TARGET_POINTS);

    let source_id = params.source_id.as_deref();
    match ctx
        .readings
        .bucketed_series(params.metric, source_id, since, bucket_seconds)
        .await
    {
        Ok(points) => (
            StatusCode::OK,
            Json(SeriesResponse {
                metric: params.metric,
                source_id: params.source_id,
                hours,
                bucket_seconds,
                points,
            }),
        )
            .into_response(),
        Err(e) => {
            error!("Failed to build {} series: {}", params.metric, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to build series")
        }
    }
}
