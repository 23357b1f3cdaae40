//! Runtime-mutable settings: thresholds, notification switch, retention.
//!
//! The whole snapshot lives behind a `watch` channel, so an update replaces
//! it in one step and readers never observe half of a `min`/`max` pair. The
//! alert engine reads the current snapshot on every sample.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::{ConfigError, StoreError};
use crate::models::{Metric, DHT22_HUMIDITY_RANGE, DHT22_TEMPERATURE_RANGE};
use crate::store::SettingsStore;

/// Key of the persisted snapshot in the settings table.
const RUNTIME_SETTINGS_KEY: &str = "runtime_settings";

/// Bounds for one metric. Either side may be absent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Offset a value must recover past before an alert resolves.
    #[serde(default)]
    pub hysteresis: f64,
}

impl Threshold {
    fn validate(&self, field: &str, range: (f64, f64)) -> Result<(), ConfigError> {
        // ---
        let (lo, hi) = range;
        for (side, bound) in [("min", self.min), ("max", self.max)] {
            if let Some(v) = bound {
                if !v.is_finite() || v < lo || v > hi {
                    return Err(ConfigError::invalid(
                        format!("{field}.{side}"),
                        format!("{v} is outside [{lo}, {hi}]"),
                    ));
                }
            }
        }
        if !self.hysteresis.is_finite() || self.hysteresis < 0.0 {
            return Err(ConfigError::invalid(
                format!("{field}.hysteresis"),
                "must be a non-negative number",
            ));
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min + self.hysteresis >= max - self.hysteresis {
                return Err(ConfigError::invalid(
                    field,
                    format!("min ({min}) must be below max ({max}) with room for hysteresis"),
                ));
            }
        }
        Ok(())
    }
}

/// Per-metric thresholds, with per-plant moisture overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub temperature: Threshold,
    pub humidity: Threshold,
    /// Default for every plant without an override.
    pub moisture: Threshold,
    /// Overrides keyed by plant source id (`plant-N`).
    #[serde(default)]
    pub plants: BTreeMap<String, Threshold>,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            temperature: Threshold {
                min: Some(18.0),
                max: Some(25.0),
                hysteresis: 0.0,
            },
            humidity: Threshold {
                min: Some(40.0),
                max: Some(65.0),
                hysteresis: 0.0,
            },
            moisture: Threshold {
                min: Some(30.0),
                max: None,
                hysteresis: 0.0,
            },
            plants: BTreeMap::new(),
        }
    }
}

impl Thresholds {
    /// Threshold that applies to one `(metric, source_id)` stream.
    pub fn for_source(&self, metric: Metric, source_id: &str) -> Threshold {
        match metric {
            Metric::Temperature => self.temperature,
            Metric::Humidity => self.humidity,
            Metric::Moisture => self.plants.get(source_id).copied().unwrap_or(self.moisture),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        // ---
        self.temperature
            .validate("temperature", DHT22_TEMPERATURE_RANGE)?;
        self.humidity.validate("humidity", DHT22_HUMIDITY_RANGE)?;
        self.moisture.validate("moisture", (0.0, 100.0))?;
        for (plant, threshold) in &self.plants {
            if !plant.starts_with("plant-") {
                return Err(ConfigError::invalid(
                    format!("plants.{plant}"),
                    "plant keys look like 'plant-N'",
                ));
            }
            threshold.validate(&format!("plants.{plant}"), (0.0, 100.0))?;
        }
        Ok(())
    }
}

/// Everything an admin may change without a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeSettings {
    pub thresholds: Thresholds,
    pub notifications_enabled: bool,
    pub retention_days: u32,
}

impl RuntimeSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // ---
        self.thresholds.validate()?;
        if self.retention_days == 0 {
            return Err(ConfigError::invalid("retention_days", "must be at least 1"));
        }
        Ok(())
    }
}

/// Shared handle to the live settings snapshot.
#[derive(Clone)]
pub struct LiveSettings {
    tx: Arc<watch::Sender<RuntimeSettings>>,
}

impl LiveSettings {
    // ---
    pub fn new(initial: RuntimeSettings) -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(initial)),
        }
    }

    pub fn current(&self) -> RuntimeSettings {
        self.tx.borrow().clone()
    }

    pub fn thresholds(&self) -> Thresholds {
        self.tx.borrow().thresholds.clone()
    }

    /// Threshold for one stream, read from the current snapshot.
    pub fn threshold_for(&self, metric: Metric, source_id: &str) -> Threshold {
        self.tx.borrow().thresholds.for_source(metric, source_id)
    }

    pub fn notifications_enabled(&self) -> bool {
        self.tx.borrow().notifications_enabled
    }

    pub fn retention_days(&self) -> u32 {
        self.tx.borrow().retention_days
    }

    /// Validate and swap in a whole new snapshot. Invalid settings never reach
    /// the alert engine.
    pub fn update(&self, settings: RuntimeSettings) -> Result<(), ConfigError> {
        // ---
        settings.validate()?;
        self.tx.send_replace(settings);
        tracing::info!("Runtime settings updated");
        Ok(())
    }

    pub fn watch(&self) -> watch::Receiver<RuntimeSettings> {
        self.tx.subscribe()
    }

    /// Replace the environment defaults with the snapshot an admin saved
    /// before the last restart, if any. Returns whether one was applied.
    pub async fn load_overrides(&self, store: &dyn SettingsStore) -> Result<bool, StoreError> {
        // ---
        let Some(raw) = store.get_setting(RUNTIME_SETTINGS_KEY).await? else {
            return Ok(false);
        };
        let saved: RuntimeSettings = serde_json::from_str(&raw)?;
        match self.update(saved) {
            Ok(()) => {
                tracing::info!("Applied runtime settings saved in the database");
                Ok(true)
            }
            Err(e) => {
                tracing::warn!("Ignoring invalid saved runtime settings: {}", e);
                Ok(false)
            }
        }
    }

    pub async fn persist(&self, store: &dyn SettingsStore) -> Result<(), StoreError> {
        // ---
        let raw = serde_json::to_string(&self.current())?;
        store.put_setting(RUNTIME_SETTINGS_KEY, &raw).await
    }
}
