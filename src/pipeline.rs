//! Storage-side consumers: the recorder that persists every sample and the
//! retention pruner.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::bus::{spawn_handler, topics, EventBus};
use crate::error::StoreError;
use crate::models::BusMessage;
use crate::settings::LiveSettings;
use crate::shutdown::Shutdown;
use crate::store::ReadingStore;

// ---

/// Persist every `sample.*` message. The store is the only writer path.
pub fn spawn_recorder(
    store: Arc<dyn ReadingStore>,
    bus: &EventBus,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    // ---
    spawn_handler(
        bus.subscribe_as("recorder", &[topics::ALL_SAMPLES]),
        move |envelope| {
            let store = store.clone();
            async move {
                if let BusMessage::Sample(sample) = envelope.message {
                    store.append(&sample).await.with_context(|| {
                        format!(
                            "Failed to store {} sample from {}",
                            sample.metric, sample.source_id
                        )
                    })?;
                }
                Ok(())
            }
        },
        shutdown,
    )
}

/// Delete readings older than `retention_days` before `now`.
pub async fn prune_once(
    store: &dyn ReadingStore,
    retention_days: u32,
    now: DateTime<Utc>,
) -> Result<u64, StoreError> {
    // ---
    let cutoff = now - chrono::Duration::days(i64::from(retention_days));
    let removed = store.prune(cutoff).await?;
    if removed > 0 {
        info!(removed, retention_days, "Pruned old readings");
    } else {
        debug!(retention_days, "Nothing to prune");
    }
    Ok(removed)
}

/// Prune every `interval`, reading the retention period from the live
/// settings each time. The first pass runs immediately.
pub fn spawn_pruner(
    store: Arc<dyn ReadingStore>,
    settings: LiveSettings,
    interval: Duration,
    mut shutdown: Shutdown,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {}
            }
            let retention_days = settings.retention_days();
            if let Err(e) = prune_once(store.as_ref(), retention_days, Utc::now()).await {
                warn!("Retention pruning failed: {}", e);
            }
        }
        debug!("Pruner stopped");
    })
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{Metric, Sample};
    use crate::settings::{RuntimeSettings, Thresholds};
    use crate::shutdown;
    use crate::store::SqliteStore;

    fn sample(value: f64, observed_at: DateTime<Utc>) -> Sample {
        Sample::new(Metric::Humidity, "dht22", value, observed_at).unwrap()
    }

    #[tokio::test]
    async fn test_recorder_persists_published_samples() -> anyhow::Result<()> {
        // ---
        let store = Arc::new(SqliteStore::in_memory().await?);
        let bus = EventBus::new(16);
        let (trigger, shutdown) = shutdown::channel();
        let task = spawn_recorder(store.clone(), &bus, shutdown);

        bus.publish_sample(sample(44.0, Utc::now()));
        bus.publish_sample(sample(45.5, Utc::now()));
        bus.close();
        task.await?;
        drop(trigger);

        let latest = store.latest(Metric::Humidity, Some("dht22")).await?;
        assert_eq!(latest.map(|s| s.value), Some(45.5));
        Ok(())
    }

    #[tokio::test]
    async fn test_prune_once_uses_retention() -> anyhow::Result<()> {
        // ---
        let store = SqliteStore::in_memory().await?;
        let now = Utc::now();
        for days_ago in [10, 3, 0] {
            let at = now - chrono::Duration::days(days_ago);
            store.append(&sample(40.0, at)).await?;
        }

        assert_eq!(prune_once(&store, 7, now).await?, 1);
        assert_eq!(prune_once(&store, 7, now).await?, 0);
        assert_eq!(prune_once(&store, 1, now).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_pruner_runs_until_shutdown() -> anyhow::Result<()> {
        // ---
        let store = Arc::new(SqliteStore::in_memory().await?);
        store
            .append(&sample(40.0, Utc::now() - chrono::Duration::days(30)))
            .await?;
        let settings = LiveSettings::new(RuntimeSettings {
            thresholds: Thresholds::default(),
            notifications_enabled: false,
            retention_days: 7,
        });

        let (trigger, shutdown) = shutdown::channel();
        let task = spawn_pruner(store.clone(), settings, Duration::from_secs(3600), shutdown);

        // First tick fires immediately
        for _ in 0..50 {
            if store.latest(Metric::Humidity, None).await?.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.latest(Metric::Humidity, None).await?.is_none());

        trigger.trigger();
        task.await?;
        Ok(())
    }
}
