//! Database schema management for `garden-monitor`.
//!
//! Ensures required tables and indexes exist before anything reads or writes.
//! Applied once when the store is opened.

use sqlx::SqlitePool;

// ---

/// Create or update the database schema (idempotent).
///
/// Creates the `reading` table for samples of every metric and the `settings`
/// key/value table. Safe to call on every startup; no-op if objects already
/// exist.
///
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // ---
    let mut tx = pool.begin().await?;

    // Append-only time series; observed_at is epoch milliseconds
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reading (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            metric      TEXT    NOT NULL,
            source_id   TEXT    NOT NULL,
            value       REAL    NOT NULL,
            observed_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Admin overrides and small actuator state
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key        TEXT PRIMARY KEY,
            value      TEXT    NOT NULL,
            updated_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(&mut *tx)
    .await?;

    // Windowed stats, series and pruning all filter on time
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_reading_metric_time
            ON reading (metric, observed_at);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_reading_source
            ON reading (metric, source_id, id);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}
