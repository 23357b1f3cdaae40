//! Threshold alert engine.
//!
//! One [`AlertState`] per `(metric, source_id)` stream, owned exclusively by
//! [`AlertEngine`]. A state changes only on a fresh sample:
//!
//! | current   | condition                           | next      |
//! |-----------|-------------------------------------|-----------|
//! | `Normal`  | `value < min`                       | `TooLow`  |
//! | `Normal`  | `value > max`                       | `TooHigh` |
//! | `TooLow`  | `value >= min + hysteresis`         | `Normal`  |
//! | `TooHigh` | `value <= max - hysteresis`         | `Normal`  |
//!
//! Anything else is a no-op and emits nothing, so a sustained alert never
//! re-fires. With the default hysteresis of zero this is plain
//! single-threshold crossing. An absent bound never raises.
//!
//! A sample that leaves `TooLow` straight into `TooHigh` (or the reverse)
//! is reported as two transitions, through `Normal`, so every consumer sees a
//! resolution before the next raise.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{topics, EventBus};
use crate::models::{
    AlertEvent, AlertStatus, BusMessage, Metric, Sample, SourceHealth, SourceStatusEvent,
};
use crate::settings::{LiveSettings, Threshold};
use crate::shutdown::Shutdown;

/// Alert state of one stream, as exposed to the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertState {
    pub metric: Metric,
    pub source_id: String,
    pub status: AlertStatus,
    /// Time of the last status transition.
    pub since: DateTime<Utc>,
    pub last_value: f64,
    pub last_observed: DateTime<Utc>,
    /// Candidate transition waiting for confirmation, and how many
    /// consecutive samples have agreed with it.
    #[serde(skip)]
    pending: Option<(AlertStatus, u32)>,
}

pub struct AlertEngine {
    states: HashMap<(Metric, String), AlertState>,
    confirmation_count: u32,
}

/// Where a stream in `current` should go for `value` under `threshold`.
fn classify(current: AlertStatus, value: f64, threshold: &Threshold) -> AlertStatus {
    // ---
    let below = threshold.min.is_some_and(|min| value < min);
    let above = threshold.max.is_some_and(|max| value > max);
    let h = threshold.hysteresis;

    match current {
        AlertStatus::Normal if below => AlertStatus::TooLow,
        AlertStatus::Normal if above => AlertStatus::TooHigh,
        AlertStatus::Normal => AlertStatus::Normal,
        AlertStatus::TooLow => {
            let recovered = threshold.min.map_or(true, |min| value >= min + h);
            match (recovered, above) {
                (false, _) => AlertStatus::TooLow,
                (true, true) => AlertStatus::TooHigh,
                (true, false) => AlertStatus::Normal,
            }
        }
        AlertStatus::TooHigh => {
            let recovered = threshold.max.map_or(true, |max| value <= max - h);
            match (recovered, below) {
                (false, _) => AlertStatus::TooHigh,
                (true, true) => AlertStatus::TooLow,
                (true, false) => AlertStatus::Normal,
            }
        }
    }
}

/// The bound that `from -> to` crossed or recovered from.
fn bound_for(from: AlertStatus, to: AlertStatus, threshold: &Threshold) -> Option<f64> {
    match (from, to) {
        (_, AlertStatus::TooLow) | (AlertStatus::TooLow, AlertStatus::Normal) => threshold.min,
        (_, AlertStatus::TooHigh) | (AlertStatus::TooHigh, AlertStatus::Normal) => threshold.max,
        (AlertStatus::Normal, AlertStatus::Normal) => None,
    }
}

impl Default for AlertEngine {
    fn default() -> Self {
        Self::new(1)
    }
}

impl AlertEngine {
    // ---
    /// `confirmation_count` consecutive samples must agree before a
    /// transition is committed. `1` commits on the first sample.
    pub fn new(confirmation_count: u32) -> Self {
        Self {
            states: HashMap::new(),
            confirmation_count: confirmation_count.max(1),
        }
    }

    /// Feed one sample through the state machine. Returns the transitions it
    /// caused, usually none.
    pub fn evaluate(&mut self, sample: &Sample, threshold: &Threshold) -> Vec<AlertEvent> {
        // ---
        let confirmation_count = self.confirmation_count;
        let state = self
            .states
            .entry(sample.key())
            .or_insert_with(|| AlertState {
                metric: sample.metric,
                source_id: sample.source_id.clone(),
                status: AlertStatus::Normal,
                since: sample.observed_at,
                last_value: sample.value,
                last_observed: sample.observed_at,
                pending: None,
            });

        if sample.observed_at < state.last_observed {
            debug!(
                metric = %sample.metric,
                source_id = %sample.source_id,
                observed_at = %sample.observed_at,
                "Late sample ignored by alert engine"
            );
            return Vec::new();
        }
        state.last_value = sample.value;
        state.last_observed = sample.observed_at;

        let target = classify(state.status, sample.value, threshold);
        if target == state.status {
            state.pending = None;
            return Vec::new();
        }

        let seen = match state.pending {
            Some((pending, n)) if pending == target => n + 1,
            _ => 1,
        };
        if seen < confirmation_count {
            state.pending = Some((target, seen));
            return Vec::new();
        }
        state.pending = None;

        // Raise after raise goes through Normal
        let path = if state.status != AlertStatus::Normal && target != AlertStatus::Normal {
            vec![AlertStatus::Normal, target]
        } else {
            vec![target]
        };

        let mut events = Vec::with_capacity(path.len());
        for next in path {
            events.push(AlertEvent {
                id: Uuid::new_v4(),
                metric: sample.metric,
                source_id: sample.source_id.clone(),
                previous_status: state.status,
                new_status: next,
                value: sample.value,
                threshold_crossed: bound_for(state.status, next, threshold),
                timestamp: sample.observed_at,
            });
            state.status = next;
        }
        state.since = sample.observed_at;
        events
    }

    /// Seed a stream from its most recent stored reading after a restart.
    /// Classifies from `Normal` and emits nothing; streams that already have
    /// state are left alone.
    pub fn rehydrate(&mut self, sample: &Sample, threshold: &Threshold) -> AlertStatus {
        // ---
        let state = self
            .states
            .entry(sample.key())
            .or_insert_with(|| AlertState {
                metric: sample.metric,
                source_id: sample.source_id.clone(),
                status: classify(AlertStatus::Normal, sample.value, threshold),
                since: sample.observed_at,
                last_value: sample.value,
                last_observed: sample.observed_at,
                pending: None,
            });
        state.status
    }

    /// A degraded source leaves its alerts exactly as they are; only a
    /// fresh in-range sample resolves them.
    pub fn note_degraded(&self, event: &SourceStatusEvent) -> usize {
        // ---
        let held = self
            .states
            .values()
            .filter(|s| event.metrics.contains(&s.metric) && s.status != AlertStatus::Normal)
            .count();
        if held > 0 {
            info!(
                source = %event.source,
                alerts = held,
                "Source degraded, holding active alerts until fresh data"
            );
        }
        held
    }

    pub fn status(&self, metric: Metric, source_id: &str) -> Option<AlertStatus> {
        self.states
            .get(&(metric, source_id.to_string()))
            .map(|s| s.status)
    }

    /// All streams, ordered by metric then source.
    pub fn snapshot(&self) -> Vec<AlertState> {
        // ---
        let mut states: Vec<AlertState> = self.states.values().cloned().collect();
        states.sort_by(|a, b| {
            a.metric
                .cmp(&b.metric)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        states
    }
}

/// Run the engine as the single consumer of `sample.*`.
///
/// The subscription is taken before this returns, so nothing published
/// afterwards is missed. Thresholds are read from `settings` on every
/// sample. Returns the task and a receiver of the latest state snapshot.
pub fn spawn_alert_service(
    mut engine: AlertEngine,
    bus: EventBus,
    settings: LiveSettings,
    mut shutdown: Shutdown,
) -> (JoinHandle<()>, watch::Receiver<Vec<AlertState>>) {
    // ---
    let patterns = [topics::ALL_SAMPLES, topics::SOURCE_STATUS];
    let mut subscription = bus.subscribe_as("alert-engine", &patterns);
    let (state_tx, state_rx) = watch::channel(engine.snapshot());

    let task = tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                next = subscription.recv() => match next {
                    Some(envelope) => envelope,
                    None => break,
                },
            };

            match envelope.message {
                BusMessage::Sample(sample) => {
                    let threshold = settings.threshold_for(sample.metric, &sample.source_id);
                    for event in engine.evaluate(&sample, &threshold) {
                        if event.is_resolution() {
                            info!(
                                metric = %event.metric,
                                source_id = %event.source_id,
                                value = event.value,
                                "Alert resolved"
                            );
                        } else {
                            warn!(
                                metric = %event.metric,
                                source_id = %event.source_id,
                                value = event.value,
                                status = %event.new_status,
                                "Alert raised"
                            );
                        }
                        bus.emit(BusMessage::Alert(event));
                    }
                    state_tx.send_replace(engine.snapshot());
                }
                BusMessage::SourceStatus(status) if status.health == SourceHealth::Degraded => {
                    engine.note_degraded(&status);
                }
                _ => {}
            }
        }
        debug!("Alert engine stopped");
    });

    (task, state_rx)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::shutdown;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 26, 18, 0, 0).unwrap()
    }

    fn climate() -> Threshold {
        Threshold {
            min: Some(18.0),
            max: Some(25.0),
            hysteresis: 0.0,
        }
    }

    /// Feed values one second apart, collecting `(new_status, value)`.
    fn run(
        engine: &mut AlertEngine,
        threshold: &Threshold,
        values: &[f64],
    ) -> Vec<(AlertStatus, f64)> {
        // ---
        let mut out = Vec::new();
        for (i, &v) in values.iter().enumerate() {
            let at = t0() + Duration::seconds(i as i64);
            let sample = Sample::new(Metric::Temperature, "dht22", v, at).unwrap();
            for e in engine.evaluate(&sample, threshold) {
                out.push((e.new_status, e.value));
            }
        }
        out
    }

    #[test]
    fn test_reference_sequence() {
        // ---
        let mut engine = AlertEngine::default();
        let events = run(&mut engine, &climate(), &[17.0, 17.0, 19.0, 26.0, 24.0]);
        assert_eq!(
            events,
            vec![
                (AlertStatus::TooLow, 17.0),
                (AlertStatus::Normal, 19.0),
                (AlertStatus::TooHigh, 26.0),
                (AlertStatus::Normal, 24.0),
            ]
        );
    }

    #[test]
    fn test_sustained_alert_emits_once() {
        // ---
        let mut engine = AlertEngine::default();
        let events = run(&mut engine, &climate(), &[30.0; 50]);
        assert_eq!(events.len(), 1);
        assert_eq!(
            engine.status(Metric::Temperature, "dht22"),
            Some(AlertStatus::TooHigh)
        );
    }

    #[test]
    fn test_boundaries_are_in_range() {
        // ---
        let mut engine = AlertEngine::default();
        let events = run(&mut engine, &climate(), &[18.0, 25.0, 17.9, 18.0]);

        // Resolves exactly at the bound
        assert_eq!(
            events,
            vec![(AlertStatus::TooLow, 17.9), (AlertStatus::Normal, 18.0)]
        );
    }

    #[test]
    fn test_min_only_never_too_high() {
        // ---
        let moisture = Threshold {
            min: Some(30.0),
            ..Threshold::default()
        };
        let mut engine = AlertEngine::default();
        let mut statuses = Vec::new();
        for (i, v) in [50.0, 100.0, 1e9, 29.0, 1e9].into_iter().enumerate() {
            let at = t0() + Duration::seconds(i as i64);
            let sample = Sample::new(Metric::Moisture, "plant-1", v, at).unwrap();
            let events = engine.evaluate(&sample, &moisture);
            statuses.extend(events.into_iter().map(|e| e.new_status));
        }
        assert_eq!(statuses, vec![AlertStatus::TooLow, AlertStatus::Normal]);
    }

    #[test]
    fn test_event_carries_crossed_bound() {
        // ---
        let mut engine = AlertEngine::default();
        let sample = Sample::new(Metric::Humidity, "dht22", 35.0, t0()).unwrap();
        let threshold = Threshold {
            min: Some(40.0),
            max: Some(65.0),
            hysteresis: 0.0,
        };
        let events = engine.evaluate(&sample, &threshold);
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.previous_status, AlertStatus::Normal);
        assert_eq!(e.new_status, AlertStatus::TooLow);
        assert_eq!(e.threshold_crossed, Some(40.0));
        assert_eq!(e.timestamp, t0());
    }

    #[test]
    fn test_jump_across_band_goes_through_normal() {
        // ---
        let mut engine = AlertEngine::default();
        let events = run(&mut engine, &climate(), &[10.0, 30.0]);
        assert_eq!(
            events,
            vec![
                (AlertStatus::TooLow, 10.0),
                (AlertStatus::Normal, 30.0),
                (AlertStatus::TooHigh, 30.0),
            ]
        );
    }

    #[test]
    fn test_hysteresis_delays_resolution() {
        // ---
        let threshold = Threshold {
            min: Some(40.0),
            max: Some(65.0),
            hysteresis: 3.0,
        };
        let mut engine = AlertEngine::default();
        let events = run(&mut engine, &threshold, &[39.0, 41.0, 42.9, 43.0, 39.5]);
        assert_eq!(
            events,
            vec![
                (AlertStatus::TooLow, 39.0),
                (AlertStatus::Normal, 43.0),
                (AlertStatus::TooLow, 39.5),
            ]
        );
    }

    #[test]
    fn test_confirmation_count_filters_single_outliers() {
        // ---
        let mut engine = AlertEngine::new(3);
        let events = run(&mut engine, &climate(), &[17.0, 20.0, 17.0, 17.0, 17.0]);
        assert_eq!(events, vec![(AlertStatus::TooLow, 17.0)]);
    }

    #[test]
    fn test_threshold_change_applies_on_next_sample() {
        // ---
        let mut engine = AlertEngine::default();
        assert!(run(&mut engine, &climate(), &[24.0]).is_empty());

        let tighter = Threshold {
            max: Some(23.0),
            ..climate()
        };
        let at = t0() + Duration::seconds(5);
        let sample = Sample::new(Metric::Temperature, "dht22", 24.0, at).unwrap();
        let events = engine.evaluate(&sample, &tighter);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].new_status, AlertStatus::TooHigh);
    }

    #[test]
    fn test_late_sample_does_not_reopen() {
        // ---
        let mut engine = AlertEngine::default();
        let late = |v: f64, secs: i64| {
            let at = t0() + Duration::seconds(secs);
            Sample::new(Metric::Temperature, "dht22", v, at).unwrap()
        };
        assert_eq!(engine.evaluate(&late(10.0, 10), &climate()).len(), 1);
        assert_eq!(engine.evaluate(&late(20.0, 20), &climate()).len(), 1);

        // Captured before the resolution, delivered after it
        assert!(engine.evaluate(&late(10.0, 15), &climate()).is_empty());
        assert_eq!(
            engine.status(Metric::Temperature, "dht22"),
            Some(AlertStatus::Normal)
        );
    }

    #[test]
    fn test_streams_are_independent() {
        // ---
        let threshold = Threshold {
            min: Some(30.0),
            ..Threshold::default()
        };
        let mut engine = AlertEngine::default();
        let dry = Sample::new(Metric::Moisture, "plant-1", 20.0, t0()).unwrap();
        let wet = Sample::new(Metric::Moisture, "plant-2", 60.0, t0()).unwrap();

        assert_eq!(engine.evaluate(&dry, &threshold).len(), 1);
        assert!(engine.evaluate(&wet, &threshold).is_empty());
        assert_eq!(
            engine.status(Metric::Moisture, "plant-1"),
            Some(AlertStatus::TooLow)
        );
        assert_eq!(
            engine.status(Metric::Moisture, "plant-2"),
            Some(AlertStatus::Normal)
        );
    }

    #[test]
    fn test_rehydrate_then_resolve() {
        // ---
        let mut engine = AlertEngine::default();
        let stored = Sample::new(Metric::Temperature, "dht22", 16.0, t0()).unwrap();
        assert_eq!(engine.rehydrate(&stored, &climate()), AlertStatus::TooLow);

        // Still low: nothing new to say
        let at = t0() + Duration::seconds(1);
        let again = Sample::new(Metric::Temperature, "dht22", 17.0, at).unwrap();
        assert!(engine.evaluate(&again, &climate()).is_empty());

        let at = t0() + Duration::seconds(2);
        let ok = Sample::new(Metric::Temperature, "dht22", 21.0, at).unwrap();
        let events = engine.evaluate(&ok, &climate());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].previous_status, AlertStatus::TooLow);
        assert!(events[0].is_resolution());
    }

    #[test]
    fn test_degraded_source_holds_state() {
        // ---
        let mut engine = AlertEngine::default();
        run(&mut engine, &climate(), &[30.0]);

        let degraded = SourceStatusEvent {
            source: "dht22".into(),
            metrics: vec![Metric::Temperature, Metric::Humidity],
            health: SourceHealth::Degraded,
            consecutive_failures: 5,
            last_error: None,
            timestamp: t0(),
        };
        assert_eq!(engine.note_degraded(&degraded), 1);
        assert_eq!(
            engine.status(Metric::Temperature, "dht22"),
            Some(AlertStatus::TooHigh)
        );
    }

    #[tokio::test]
    async fn test_service_publishes_alert_topics() {
        // ---
        let bus = EventBus::new(64);
        let settings = LiveSettings::new(crate::settings::RuntimeSettings {
            thresholds: crate::settings::Thresholds::default(),
            notifications_enabled: false,
            retention_days: 7,
        });
        let (trigger, shutdown) = shutdown::channel();
        let mut alerts = bus.subscribe(&topics::alert(Metric::Humidity));

        let (task, mut states) =
            spawn_alert_service(AlertEngine::default(), bus.clone(), settings, shutdown);

        for v in [35.0, 36.0, 50.0] {
            let sample = Sample::new(Metric::Humidity, "dht22", v, Utc::now()).unwrap();
            bus.publish_sample(sample);
        }

        let raised = alerts.recv().await.unwrap();
        let resolved = alerts.recv().await.unwrap();
        match (raised.message, resolved.message) {
            (BusMessage::Alert(a), BusMessage::Alert(b)) => {
                assert_eq!(a.new_status, AlertStatus::TooLow);
                assert_eq!(b.new_status, AlertStatus::Normal);
            }
            other => panic!("unexpected messages {other:?}"),
        }

        states.changed().await.unwrap();
        assert_eq!(states.borrow().len(), 1);

        trigger.trigger();
        task.await.unwrap();
    }
}
