//! Sample source adapters and the polling loop that drives them.
//!
//! An adapter only turns physical input into [`Sample`]s. The loop in
//! [`spawn_source`] publishes them, counts consecutive failures and raises a
//! `SourceDegraded` status after too many, and keeps retrying with a capped
//! delay for as long as the process runs. Adapters never persist anything.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::SourceConfig;
use crate::error::SourceError;
use crate::models::{BusMessage, Metric, Sample, SourceHealth, SourceStatusEvent};
use crate::shutdown::Shutdown;

pub mod climate;
pub mod moisture;

pub use climate::{ClimateSensor, ClimateSource, SimulatedClimateSensor, SysfsClimateSensor};
pub use moisture::{
    line_channel, parse_line, spawn_line_forwarder, ChannelLineSource, LineSource, MoistureSource,
    ReaderLineSource, SerialLineSource, SimulatedLineSource,
};

#[async_trait]
pub trait SampleSource: Send {
    /// Adapter name used in logs and status events.
    fn name(&self) -> &str;

    fn metrics(&self) -> &[Metric];

    /// Fixed polling interval, or `None` for sources that block on input.
    fn cadence(&self) -> Option<Duration>;

    /// Produce the next batch of samples. An empty batch is not a failure.
    async fn poll(&mut self) -> Result<Vec<Sample>, SourceError>;

    /// Release hardware or channel handles.
    async fn close(&mut self) {}
}

/// Consecutive-failure bookkeeping for one source.
#[derive(Debug, Clone)]
pub struct FailureTracker {
    consecutive: u32,
    degraded_after: u32,
    degraded: bool,
    base_delay: Duration,
    max_delay: Duration,
}

impl FailureTracker {
    // ---
    pub fn new(degraded_after: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            consecutive: 0,
            degraded_after: degraded_after.max(1),
            degraded: false,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Returns `Degraded` exactly once, on the failure that crosses the limit.
    pub fn record_failure(&mut self) -> Option<SourceHealth> {
        // ---
        self.consecutive = self.consecutive.saturating_add(1);
        if !self.degraded && self.consecutive >= self.degraded_after {
            self.degraded = true;
            return Some(SourceHealth::Degraded);
        }
        None
    }

    /// Returns `Healthy` when this success ends a degraded period.
    pub fn record_success(&mut self) -> Option<SourceHealth> {
        // ---
        self.consecutive = 0;
        if self.degraded {
            self.degraded = false;
            return Some(SourceHealth::Healthy);
        }
        None
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Exponential in the failure count, capped at the maximum delay.
    pub fn retry_delay(&self) -> Duration {
        // ---
        let exponent = self.consecutive.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

/// Start the polling loop for `source` as its own task.
pub fn spawn_source(
    source: Box<dyn SampleSource>,
    bus: EventBus,
    config: &SourceConfig,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    // ---
    let base = source.cadence().unwrap_or(Duration::from_secs(1));
    let tracker = FailureTracker::new(config.degraded_after_failures, base, config.max_retry_delay);
    tokio::spawn(run_source(source, bus, tracker, shutdown))
}

async fn run_source(
    mut source: Box<dyn SampleSource>,
    bus: EventBus,
    mut tracker: FailureTracker,
    mut shutdown: Shutdown,
) {
    // ---
    let name = source.name().to_string();
    info!(source = %name, "Sample source started");

    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown.wait() => break,
            result = source.poll() => result,
        };

        let pause = match result {
            Ok(samples) => {
                for sample in samples {
                    debug!(
                        source = %name,
                        metric = %sample.metric,
                        source_id = %sample.source_id,
                        value = sample.value,
                        "Sample read"
                    );
                    bus.publish_sample(sample);
                }
                if let Some(health) = tracker.record_success() {
                    info!(source = %name, "Source recovered");
                    publish_status(&bus, source.as_ref(), health, &tracker, None);
                }
                source.cadence()
            }
            Err(SourceError::Closed) => {
                warn!(source = %name, "Source input closed, stopping");
                break;
            }
            Err(e) => {
                warn!(
                    source = %name,
                    failures = tracker.consecutive_failures() + 1,
                    "Read failed, skipping: {}",
                    e
                );
                let transient = matches!(e, SourceError::TransientRead(_));
                if let Some(health) = tracker.record_failure() {
                    warn!(
                        source = %name,
                        failures = tracker.consecutive_failures(),
                        "Source degraded"
                    );
                    publish_status(&bus, source.as_ref(), health, &tracker, Some(e.to_string()));
                }
                // Line sources already waited out their read timeout
                if source.cadence().is_some() || transient {
                    Some(tracker.retry_delay())
                } else {
                    None
                }
            }
        };

        if let Some(pause) = pause {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    source.close().await;
    info!(source = %name, "Sample source stopped");
}

fn publish_status(
    bus: &EventBus,
    source: &dyn SampleSource,
    health: SourceHealth,
    tracker: &FailureTracker,
    last_error: Option<String>,
) {
    // ---
    bus.emit(BusMessage::SourceStatus(SourceStatusEvent {
        source: source.name().to_string(),
        metrics: source.metrics().to_vec(),
        health,
        consecutive_failures: tracker.consecutive_failures(),
        last_error,
        timestamp: Utc::now(),
    }));
}
