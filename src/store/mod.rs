//! Reading store contract.
//!
//! The store owns persisted samples. Ingestion is the single writer (the
//! recorder task); dashboard queries read concurrently. Writes are
//! single-row appends, so no cross-row transactions are needed.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::models::{Metric, Sample};

mod sqlite;

pub use sqlite::SqliteStore;

/// Aggregates over a time window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WindowStats {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub count: i64,
}

/// One bucket of a charting series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SeriesPoint {
    /// Bucket start, milliseconds since the Unix epoch.
    pub epoch: i64,
    /// Average of the bucket.
    pub value: f64,
}

#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Append one sample.
    async fn append(&self, sample: &Sample) -> Result<(), StoreError>;

    /// Most recent sample for `metric`, optionally restricted to one source.
    async fn latest(
        &self,
        metric: Metric,
        source_id: Option<&str>,
    ) -> Result<Option<Sample>, StoreError>;

    /// Most recently appended sample of every `(metric, source_id)` pair.
    async fn latest_all(&self) -> Result<Vec<Sample>, StoreError>;

    /// Average/min/max since `since`; `None` when the window is empty.
    async fn windowed_stats(
        &self,
        metric: Metric,
        source_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Option<WindowStats>, StoreError>;

    /// Per-bucket averages since `since`, ordered by bucket.
    async fn bucketed_series(
        &self,
        metric: Metric,
        source_id: Option<&str>,
        since: DateTime<Utc>,
        bucket_seconds: u32,
    ) -> Result<Vec<SeriesPoint>, StoreError>;

    /// Delete samples observed before `older_than`. Returns rows removed.
    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Small key/value table for admin overrides and actuator state.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Bucket size (seconds) that yields roughly `target_points` buckets between
/// `since` and `now`. Never below one second.
pub fn bucket_size(since: DateTime<Utc>, now: DateTime<Utc>, target_points: u32) -> u32 {
    // ---
    let total = (now - since).num_seconds().max(0) as u64;
    let bucket = total / u64::from(target_points.max(1));
    bucket.clamp(1, u64::from(u32::MAX)) as u32
}
