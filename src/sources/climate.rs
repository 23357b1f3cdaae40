//! Temperature/humidity adapter for the DHT22.
//!
//! The kernel `dht11` IIO driver (which also handles the DHT22) exposes the
//! two channels in sysfs as milli-units. Reads fail routinely on checksum or
//! timing errors; each failure is a `TransientRead` and the next cycle tries
//! again.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::SampleSource;
use crate::error::SourceError;
use crate::models::{Metric, RawClimateReading, Sample};

pub const CLIMATE_SOURCE_ID: &str = "dht22";

/// Hardware seam: one raw temperature/humidity reading per call.
#[async_trait]
pub trait ClimateSensor: Send {
    async fn read(&mut self) -> Result<RawClimateReading, SourceError>;

    async fn close(&mut self) {}
}

/// Polls a [`ClimateSensor`] on a fixed cadence.
pub struct ClimateSource {
    sensor: Box<dyn ClimateSensor>,
    interval: Duration,
}

impl ClimateSource {
    pub fn new(sensor: Box<dyn ClimateSensor>, interval: Duration) -> Self {
        Self { sensor, interval }
    }
}

#[async_trait]
impl SampleSource for ClimateSource {
    fn name(&self) -> &str {
        CLIMATE_SOURCE_ID
    }

    fn metrics(&self) -> &[Metric] {
        &[Metric::Temperature, Metric::Humidity]
    }

    fn cadence(&self) -> Option<Duration> {
        Some(self.interval)
    }

    async fn poll(&mut self) -> Result<Vec<Sample>, SourceError> {
        // ---
        let raw = self.sensor.read().await?;
        raw.to_samples(CLIMATE_SOURCE_ID, Utc::now())
    }

    async fn close(&mut self) {
        self.sensor.close().await;
    }
}

/// DHT22 behind the Linux IIO sysfs interface.
pub struct SysfsClimateSensor {
    device: PathBuf,
}

impl SysfsClimateSensor {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self {
            device: device.into(),
        }
    }

    async fn read_channel(&self, channel: &str) -> Result<f64, SourceError> {
        // ---
        let path = self.device.join(channel);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| SourceError::TransientRead(format!("{}: {}", path.display(), e)))?;
        let milli: i64 = text.trim().parse().map_err(|_| {
            SourceError::Malformed(format!("{}: not an integer: {:?}", path.display(), text.trim()))
        })?;
        Ok(milli as f64 / 1000.0)
    }
}

#[async_trait]
impl ClimateSensor for SysfsClimateSensor {
    async fn read(&mut self) -> Result<RawClimateReading, SourceError> {
        // ---
        let temperature_c = self.read_channel("in_temp_input").await?;
        let humidity = self.read_channel("in_humidityrelative_input").await?;
        Ok(RawClimateReading {
            temperature_c,
            humidity,
        })
    }
}

/// Bounded random walk standing in for the DHT22 when sensors are mocked.
pub struct SimulatedClimateSensor {
    rng: StdRng,
    temperature_c: f64,
    humidity: f64,
}

/// Next step of a bounded random walk, rounded to one decimal like the sensor.
pub(crate) fn random_walk(rng: &mut StdRng, current: f64, drift: f64, min: f64, max: f64) -> f64 {
    // ---
    let next = (current + rng.gen_range(-drift..=drift)).clamp(min, max);
    (next * 10.0).round() / 10.0
}

impl SimulatedClimateSensor {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Deterministic walk for tests.
    pub fn seeded(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(mut rng: StdRng) -> Self {
        let temperature_c = rng.gen_range(20.0..23.0);
        let humidity = rng.gen_range(45.0..55.0);
        Self {
            rng,
            temperature_c,
            humidity,
        }
    }
}

impl Default for SimulatedClimateSensor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClimateSensor for SimulatedClimateSensor {
    async fn read(&mut self) -> Result<RawClimateReading, SourceError> {
        // ---
        self.temperature_c = random_walk(&mut self.rng, self.temperature_c, 0.25, 15.0, 30.0);
        self.humidity = random_walk(&mut self.rng, self.humidity, 0.5, 30.0, 70.0);
        Ok(RawClimateReading {
            temperature_c: self.temperature_c,
            humidity: self.humidity,
        })
    }
}
