//! Data models for the monitoring pipeline.
//!
//! Everything that travels over the event bus or into the reading store is
//! defined here so that producers and consumers share one vocabulary.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConfigError, SourceError};

// ---

/// Kind of physical quantity a [`Sample`] measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    Humidity,
    Moisture,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Temperature => "temperature",
            Metric::Humidity => "humidity",
            Metric::Moisture => "moisture",
        }
    }

    /// Display unit used in notifications and on the dashboard.
    pub fn unit(&self) -> &'static str {
        match self {
            Metric::Temperature => "°C",
            Metric::Humidity | Metric::Moisture => "%",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "temperature" => Ok(Metric::Temperature),
            "humidity" => Ok(Metric::Humidity),
            "moisture" => Ok(Metric::Moisture),
            other => Err(ConfigError::UnknownMetric(other.to_string())),
        }
    }
}

/// One sensor observation. `value` is always finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    // ---
    pub metric: Metric,
    pub source_id: String,
    pub value: f64,
    /// Capture time, not receipt time.
    pub observed_at: DateTime<Utc>,
}

impl Sample {
    // ---
    pub fn new(
        metric: Metric,
        source_id: impl Into<String>,
        value: f64,
        observed_at: DateTime<Utc>,
    ) -> Result<Self, SourceError> {
        // ---
        if !value.is_finite() {
            return Err(SourceError::TransientRead(format!(
                "{metric} value is not finite: {value}"
            )));
        }
        Ok(Self {
            metric,
            source_id: source_id.into(),
            value,
            observed_at,
        })
    }

    /// Key the alert engine tracks state under.
    pub fn key(&self) -> (Metric, String) {
        (self.metric, self.source_id.clone())
    }
}

/// Raw climate reading as returned by the DHT22 (or its simulation).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawClimateReading {
    // ---
    pub temperature_c: f64,
    pub humidity: f64,
}

/// Physical range of the DHT22 sensor, per metric.
pub const DHT22_TEMPERATURE_RANGE: (f64, f64) = (-40.0, 80.0);
pub const DHT22_HUMIDITY_RANGE: (f64, f64) = (0.0, 100.0);

impl RawClimateReading {
    // ---
    /// Check the reading against the sensor's physical range and split it
    /// into one sample per metric.
    pub fn to_samples(
        &self,
        source_id: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<Vec<Sample>, SourceError> {
        // ---
        let checks = [
            (
                Metric::Temperature,
                self.temperature_c,
                DHT22_TEMPERATURE_RANGE,
            ),
            (Metric::Humidity, self.humidity, DHT22_HUMIDITY_RANGE),
        ];

        let mut samples = Vec::with_capacity(checks.len());
        for (metric, value, (lo, hi)) in checks {
            let sample = Sample::new(metric, source_id, value, observed_at)?;
            if value < lo || value > hi {
                return Err(SourceError::TransientRead(format!(
                    "{metric} reading outside sensor bounds [{lo}, {hi}]: {value}"
                )));
            }
            samples.push(sample);
        }
        Ok(samples)
    }
}

/// Alert status of one `(metric, source_id)` stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    #[default]
    Normal,
    TooLow,
    TooHigh,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Normal => "normal",
            AlertStatus::TooLow => "too_low",
            AlertStatus::TooHigh => "too_high",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted once per alert state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    // ---
    pub id: Uuid,
    pub metric: Metric,
    pub source_id: String,
    pub previous_status: AlertStatus,
    pub new_status: AlertStatus,
    pub value: f64,
    /// Bound that was crossed (on raise) or recovered from (on resolve).
    pub threshold_crossed: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl AlertEvent {
    // ---
    pub fn is_resolution(&self) -> bool {
        self.new_status == AlertStatus::Normal
    }

    /// One-line human summary shared by notifiers and logs.
    pub fn summary(&self) -> String {
        // ---
        let unit = self.metric.unit();
        let threshold = self
            .threshold_crossed
            .map(|t| format!("{t}{unit}"))
            .unwrap_or_else(|| "n/a".to_string());

        if self.is_resolution() {
            format!(
                "{} ({}) recovered at {}: value {:.1}{unit}, threshold {threshold}.",
                self.metric,
                self.source_id,
                self.timestamp.format("%Y-%m-%d %H:%M:%S"),
                self.value,
            )
        } else {
            format!(
                "{} ({}) is {} at {}: value {:.1}{unit}, threshold {threshold}.",
                self.metric,
                self.source_id,
                self.new_status,
                self.timestamp.format("%Y-%m-%d %H:%M:%S"),
                self.value,
            )
        }
    }
}

/// Health of one sample source as seen by its polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceHealth {
    Healthy,
    Degraded,
}

/// `SourceDegraded` / recovery signal published by the polling loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceStatusEvent {
    // ---
    pub source: String,
    pub metrics: Vec<Metric>,
    pub health: SourceHealth,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Believed on/off state of the humidifier plug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumidifierState {
    // ---
    pub is_on: bool,
    /// Whether the plug acknowledged the last command.
    pub confirmed: bool,
    pub changed_at: DateTime<Utc>,
}

/// Everything that can travel over the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusMessage {
    Sample(Sample),
    Alert(AlertEvent),
    SourceStatus(SourceStatusEvent),
    Humidifier(HumidifierState),
}
