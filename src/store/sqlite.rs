//! SQLite-backed [`ReadingStore`] and [`SettingsStore`].

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};
use tracing::info;

use super::{ReadingStore, SeriesPoint, SettingsStore, WindowStats};
use crate::error::StoreError;
use crate::models::{Metric, Sample};
use crate::schema;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct ReadingRow {
    metric: String,
    source_id: String,
    value: f64,
    observed_at: i64,
}

impl TryFrom<ReadingRow> for Sample {
    type Error = StoreError;

    fn try_from(row: ReadingRow) -> Result<Self, Self::Error> {
        // ---
        let metric = Metric::from_str(&row.metric)
            .map_err(|_| StoreError::Corrupt(format!("unknown metric '{}'", row.metric)))?;
        let observed_at = Utc
            .timestamp_millis_opt(row.observed_at)
            .single()
            .ok_or_else(|| StoreError::Corrupt(format!("bad timestamp {}", row.observed_at)))?;
        Ok(Sample {
            metric,
            source_id: row.source_id,
            value: row.value,
            observed_at,
        })
    }
}

#[derive(FromRow)]
struct StatsRow {
    avg: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    count: i64,
}

#[derive(FromRow)]
struct BucketRow {
    bucket: i64,
    value: f64,
}

impl SqliteStore {
    // ---
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        // ---
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        schema::create_schema(&pool).await?;
        info!("Connected to SQLite store at {}", url);
        Ok(Self { pool })
    }

    /// Private in-memory database, used by tests and dry runs.
    pub async fn in_memory() -> Result<Self, StoreError> {
        // ---
        // Every connection to :memory: is a separate database, so pin one.
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        schema::create_schema(&pool).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ReadingStore for SqliteStore {
    async fn append(&self, sample: &Sample) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            "INSERT INTO reading (metric, source_id, value, observed_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(sample.metric.as_str())
        .bind(&sample.source_id)
        .bind(sample.value)
        .bind(sample.observed_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest(
        &self,
        metric: Metric,
        source_id: Option<&str>,
    ) -> Result<Option<Sample>, StoreError> {
        // ---
        let row = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT metric, source_id, value, observed_at
            FROM reading
            WHERE metric = ?1 AND (?2 IS NULL OR source_id = ?2)
            ORDER BY observed_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(metric.as_str())
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Sample::try_from).transpose()
    }

    async fn latest_all(&self) -> Result<Vec<Sample>, StoreError> {
        // ---
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT metric, source_id, value, observed_at
            FROM (
                SELECT metric, source_id, value, observed_at,
                       ROW_NUMBER() OVER (
                           PARTITION BY metric, source_id
                           ORDER BY observed_at DESC, id DESC
                       ) AS recency
                FROM reading
            )
            WHERE recency = 1
            ORDER BY metric, source_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Sample::try_from).collect()
    }

    async fn windowed_stats(
        &self,
        metric: Metric,
        source_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Option<WindowStats>, StoreError> {
        // ---
        let row = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT AVG(value) AS avg, MIN(value) AS min, MAX(value) AS max, COUNT(*) AS count
            FROM reading
            WHERE metric = ?1 AND (?2 IS NULL OR source_id = ?2) AND observed_at >= ?3
            "#,
        )
        .bind(metric.as_str())
        .bind(source_id)
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(match (row.avg, row.min, row.max) {
            (Some(avg), Some(min), Some(max)) if row.count > 0 => Some(WindowStats {
                avg,
                min,
                max,
                count: row.count,
            }),
            _ => None,
        })
    }

    async fn bucketed_series(
        &self,
        metric: Metric,
        source_id: Option<&str>,
        since: DateTime<Utc>,
        bucket_seconds: u32,
    ) -> Result<Vec<SeriesPoint>, StoreError> {
        // ---
        let bucket_ms = i64::from(bucket_seconds.max(1)) * 1000;
        let rows = sqlx::query_as::<_, BucketRow>(
            r#"
            SELECT (observed_at / ?4) * ?4 AS bucket, AVG(value) AS value
            FROM reading
            WHERE metric = ?1 AND (?2 IS NULL OR source_id = ?2) AND observed_at >= ?3
            GROUP BY bucket
            ORDER BY bucket
            "#,
        )
        .bind(metric.as_str())
        .bind(source_id)
        .bind(since.timestamp_millis())
        .bind(bucket_ms)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| SeriesPoint {
                epoch: r.bucket,
                value: r.value,
            })
            .collect())
    }

    async fn prune(&self, older_than: DateTime<Utc>) -> Result<u64, StoreError> {
        // ---
        let result = sqlx::query("DELETE FROM reading WHERE observed_at < ?1")
            .bind(older_than.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        // ---
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn put_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn sample(metric: Metric, source: &str, value: f64, at: DateTime<Utc>) -> Sample {
        Sample::new(metric, source, value, at).unwrap()
    }

    async fn seed(
        store: &SqliteStore,
        rows: &[(Metric, &str, f64, DateTime<Utc>)],
    ) -> anyhow::Result<()> {
        // ---
        for &(metric, source, value, at) in rows {
            store.append(&sample(metric, source, value, at)).await?;
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_append_then_latest() -> anyhow::Result<()> {
        // ---
        let store = SqliteStore::in_memory().await?;
        let now = Utc::now();
        let earlier = now - ChronoDuration::seconds(10);

        assert!(store.latest(Metric::Humidity, None).await?.is_none());

        seed(
            &store,
            &[
                (Metric::Humidity, "dht22", 44.0, earlier),
                (Metric::Humidity, "dht22", 46.5, now),
                (Metric::Temperature, "dht22", 21.0, now),
            ],
        )
        .await?;

        let latest = store.latest(Metric::Humidity, None).await?.unwrap();
        assert_eq!(latest.value, 46.5);
        assert_eq!(
            latest.observed_at.timestamp_millis(),
            now.timestamp_millis()
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_latest_by_source_and_latest_all() -> anyhow::Result<()> {
        // ---
        let store = SqliteStore::in_memory().await?;
        let now = Utc::now();
        seed(
            &store,
            &[
                (Metric::Moisture, "plant-1", 35.0, now),
                (Metric::Moisture, "plant-2", 52.0, now),
                (Metric::Moisture, "plant-1", 33.0, now),
            ],
        )
        .await?;

        let p2 = store.latest(Metric::Moisture, Some("plant-2")).await?;
        assert_eq!(p2.map(|s| s.value), Some(52.0));

        let all = store.latest_all().await?;
        assert_eq!(all.len(), 2);
        let p1 = all.iter().find(|s| s.source_id == "plant-1").unwrap();
        assert_eq!(p1.value, 33.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_latest_all_prefers_newest_observation_over_last_insert() -> anyhow::Result<()> {
        // ---
        let store = SqliteStore::in_memory().await?;
        let base = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let at = |secs| base + ChronoDuration::seconds(secs);
        seed(
            &store,
            &[
                (Metric::Temperature, "dht22", 10.0, at(10)),
                (Metric::Temperature, "dht22", 20.0, at(20)),
                // Arrives last but was observed earlier
                (Metric::Temperature, "dht22", 10.0, at(15)),
            ],
        )
        .await?;

        let latest = store.latest(Metric::Temperature, None).await?.unwrap();
        let all = store.latest_all().await?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].value, 20.0);
        assert_eq!(all[0].observed_at, latest.observed_at);
        assert_eq!(all[0].observed_at, at(20));
        Ok(())
    }

    #[tokio::test]
    async fn test_windowed_stats() -> anyhow::Result<()> {
        // ---
        let store = SqliteStore::in_memory().await?;
        let now = Utc::now();
        let day_ago = now - ChronoDuration::hours(24);
        let stale = now - ChronoDuration::hours(30);
        seed(
            &store,
            &[
                (Metric::Temperature, "dht22", 10.0, stale),
                (Metric::Temperature, "dht22", 20.0, now),
                (Metric::Temperature, "dht22", 22.0, now),
                (Metric::Temperature, "dht22", 24.0, now),
            ],
        )
        .await?;

        let stats = store
            .windowed_stats(Metric::Temperature, None, day_ago)
            .await?
            .unwrap();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, 20.0);
        assert_eq!(stats.max, 24.0);
        assert!((stats.avg - 22.0).abs() < 1e-9);

        let humidity = store.windowed_stats(Metric::Humidity, None, day_ago).await?;
        assert!(humidity.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_bucketed_series_averages_buckets() -> anyhow::Result<()> {
        // ---
        let store = SqliteStore::in_memory().await?;
        let base = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        for (offset, v) in [(0, 40.0), (30, 50.0), (60, 60.0), (90, 70.0)] {
            let at = base + ChronoDuration::seconds(offset);
            seed(&store, &[(Metric::Humidity, "dht22", v, at)]).await?;
        }

        let series = store
            .bucketed_series(Metric::Humidity, None, base, 60)
            .await?;
        assert_eq!(series.len(), 2);
        assert_eq!(series[0].value, 45.0);
        assert_eq!(series[1].value, 65.0);
        assert!(series[0].epoch < series[1].epoch);
        Ok(())
    }

    #[tokio::test]
    async fn test_prune_removes_old_rows() -> anyhow::Result<()> {
        // ---
        let store = SqliteStore::in_memory().await?;
        let now = Utc::now();
        let expired = now - ChronoDuration::days(8);
        seed(
            &store,
            &[
                (Metric::Moisture, "plant-1", 30.0, expired),
                (Metric::Moisture, "plant-1", 31.0, now),
            ],
        )
        .await?;

        let removed = store.prune(now - ChronoDuration::days(7)).await?;
        assert_eq!(removed, 1);
        assert_eq!(store.latest_all().await?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_settings_upsert() -> anyhow::Result<()> {
        // ---
        let store = SqliteStore::in_memory().await?;
        assert!(store.get_setting("humidifier").await?.is_none());

        store.put_setting("humidifier", "on").await?;
        store.put_setting("humidifier", "off").await?;
        let saved = store.get_setting("humidifier").await?;
        assert_eq!(saved.as_deref(), Some("off"));
        Ok(())
    }
}
