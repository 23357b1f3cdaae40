//! Configuration loader for the `garden-monitor` appliance.
//!
//! This module centralizes all startup configuration values and their
//! defaults, loading from environment variables (with optional `.env` file
//! support provided by the caller). By consolidating configuration logic here,
//! we avoid scattering `env::var` calls throughout the codebase.
//!
//! Values that an admin may change while the appliance runs (thresholds,
//! notification enablement, retention) only seed the
//! [`LiveSettings`](crate::settings::LiveSettings) handle from here.
use std::collections::BTreeMap;
use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::error::ConfigError;
use crate::notify::BackendKind;
use crate::settings::{RuntimeSettings, Threshold, Thresholds};

/// Parse an optional environment variable into `$ty` with a default value.
macro_rules! parse_env {
    ($lookup:expr, $var_name:expr, $ty:ty, $default:expr) => {
        $lookup($var_name)
            .filter(|v: &String| !v.trim().is_empty())
            .map(|v| v.trim().parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional boolean flag (`1`/`true`/`yes` vs `0`/`false`/`no`).
macro_rules! parse_env_bool {
    ($lookup:expr, $var_name:expr, $default:expr) => {
        match $lookup($var_name).as_deref().map(str::trim) {
            None | Some("") => $default,
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            Some(other) => {
                return Err(anyhow!("Invalid {}: '{}' is not a boolean", $var_name, other))
            }
        }
    };
}

/// Read an optional string environment variable with a default.
macro_rules! env_or {
    ($lookup:expr, $var_name:expr, $default:expr) => {
        $lookup($var_name).unwrap_or_else(|| $default.to_string())
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($lookup:expr, $var_name:expr) => {
        $lookup($var_name)
            .filter(|v: &String| !v.trim().is_empty())
            .ok_or_else(|| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// SQLite connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// Port of the dashboard/ingestion HTTP API.
    pub http_port: u16,

    /// Use simulated sensors and a logging smart plug instead of hardware.
    pub mock_sensors: bool,

    pub sources: SourceConfig,

    /// Startup thresholds; the live copy is owned by `LiveSettings`.
    pub thresholds: Thresholds,

    /// Consecutive out-of-state samples needed before a transition.
    pub alert_confirmation_count: u32,

    pub retention_days: u32,
    pub prune_interval: Duration,

    pub notifications: NotificationConfig,
    pub humidifier: HumidifierConfig,

    /// Per-subscriber event bus queue capacity.
    pub bus_queue_capacity: usize,
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    // ---
    /// Cadence of the climate sensor.
    pub poll_interval: Duration,
    /// Consecutive failures before a source is reported degraded.
    pub degraded_after_failures: u32,
    /// Ceiling of the retry delay after failures.
    pub max_retry_delay: Duration,
    /// IIO sysfs directory of the DHT22 kernel driver.
    pub dht_iio_device: String,
    /// Serial device the Pico writes JSON lines to; `None` = HTTP only.
    pub pico_serial_port: Option<String>,
    pub pico_read_timeout: Duration,
    pub spike_threshold: f64,
    pub plant_ids: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct NotificationConfig {
    // ---
    pub enabled: bool,
    pub backends: Vec<BackendKind>,
    pub gmail: GmailConfig,
    pub slack_webhook_url: String,
    /// Total attempts per backend per event (first try included).
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct GmailConfig {
    // ---
    pub sender: String,
    pub recipients: Vec<String>,
    pub username: String,
    pub password: String,
    pub smtp_host: String,
    pub smtp_port: u16,
}

#[derive(Debug, Clone)]
pub struct HumidifierConfig {
    // ---
    pub enabled: bool,
    /// Address of the Kasa smart plug.
    pub host: String,
    /// Minimum time between two relay toggles.
    pub min_dwell: Duration,
    pub off_on_shutdown: bool,
}

/// Load configuration from environment variables with defaults.
///
/// Every variable is optional. The main groups:
/// - `DATABASE_URL`, `DB_POOL_MAX`, `HTTP_PORT`, `MOCK_SENSORS`
/// - `POLL_INTERVAL_SEC`, `DEGRADED_AFTER_FAILURES`, `MAX_RETRY_DELAY_SEC`,
///   `PICO_SERIAL_PORT`, `PICO_READ_TIMEOUT_SEC`, `PLANT_IDS`
/// - `MIN_*` / `MAX_*` / `HYSTERESIS_*` thresholds, `MIN_MOISTURE_PLANT_<N>`
/// - `ENABLE_NOTIFICATION_SERVICE`, `NOTIFICATION_BACKENDS`, `GMAIL_*`,
///   `SLACK_WEBHOOK_URL`, `NOTIFY_*`
/// - `ENABLE_HUMIDIFIER`, `HUMIDIFIER_HOST`, `HUMIDIFIER_MIN_DWELL_SEC`
///
/// `HUMIDIFIER_HOST` becomes required when `ENABLE_HUMIDIFIER` is set and
/// sensors are not mocked.
///
/// Returns an error if any variable is invalid or the values contradict each
/// other.
pub fn load_from_env() -> Result<Config> {
    load_from(|key| env::var(key).ok())
}

/// Same as [`load_from_env`] but reading variables through `lookup`.
pub fn load_from<F>(lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    // ---
    let db_url = env_or!(lookup, "DATABASE_URL", "sqlite://garden.sqlite3?mode=rwc");
    let db_pool_max = parse_env!(lookup, "DB_POOL_MAX", u32, 5);
    let http_port = parse_env!(lookup, "HTTP_PORT", u16, 8080);
    let mock_sensors = parse_env_bool!(lookup, "MOCK_SENSORS", false);

    let plant_ids = env_or!(lookup, "PLANT_IDS", "1,2,3")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("Invalid PLANT_IDS: {}", e))?;

    let pico_serial_port = lookup("PICO_SERIAL_PORT").filter(|p| !p.trim().is_empty());
    let pico_read_timeout_secs = parse_env!(lookup, "PICO_READ_TIMEOUT_SEC", u64, 60);

    let sources = SourceConfig {
        poll_interval: Duration::from_secs(parse_env!(lookup, "POLL_INTERVAL_SEC", u64, 2)),
        degraded_after_failures: parse_env!(lookup, "DEGRADED_AFTER_FAILURES", u32, 5),
        max_retry_delay: Duration::from_secs(parse_env!(lookup, "MAX_RETRY_DELAY_SEC", u64, 30)),
        dht_iio_device: env_or!(lookup, "DHT_IIO_DEVICE", "/sys/bus/iio/devices/iio:device0"),
        pico_serial_port,
        pico_read_timeout: Duration::from_secs(pico_read_timeout_secs),
        spike_threshold: parse_env!(lookup, "SPIKE_THRESHOLD_MOISTURE", f64, 20.0),
        plant_ids,
    };

    let moisture_default = Threshold {
        min: Some(parse_env!(lookup, "MIN_MOISTURE", f64, 30.0)),
        max: None,
        hysteresis: parse_env!(lookup, "HYSTERESIS_MOISTURE", f64, 0.0),
    };
    let mut plants = BTreeMap::new();
    for id in &sources.plant_ids {
        let var = format!("MIN_MOISTURE_PLANT_{id}");
        if let Some(min) = lookup(&var).filter(|v| !v.trim().is_empty()) {
            let min = min
                .trim()
                .parse::<f64>()
                .map_err(|e| anyhow!("Invalid {}: {}", var, e))?;
            plants.insert(
                format!("plant-{id}"),
                Threshold {
                    min: Some(min),
                    ..moisture_default
                },
            );
        }
    }

    let thresholds = Thresholds {
        temperature: Threshold {
            min: Some(parse_env!(lookup, "MIN_TEMPERATURE", f64, 18.0)),
            max: Some(parse_env!(lookup, "MAX_TEMPERATURE", f64, 25.0)),
            hysteresis: parse_env!(lookup, "HYSTERESIS_TEMPERATURE", f64, 0.0),
        },
        humidity: Threshold {
            min: Some(parse_env!(lookup, "MIN_HUMIDITY", f64, 40.0)),
            max: Some(parse_env!(lookup, "MAX_HUMIDITY", f64, 65.0)),
            hysteresis: parse_env!(lookup, "HYSTERESIS_HUMIDITY", f64, 0.0),
        },
        moisture: moisture_default,
        plants,
    };
    thresholds.validate()?;

    let backends = env_or!(lookup, "NOTIFICATION_BACKENDS", "gmail")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<BackendKind>)
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let notifications = NotificationConfig {
        enabled: parse_env_bool!(lookup, "ENABLE_NOTIFICATION_SERVICE", false),
        backends,
        gmail: GmailConfig {
            sender: env_or!(lookup, "GMAIL_SENDER", ""),
            recipients: env_or!(lookup, "GMAIL_RECIPIENTS", "")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
            username: env_or!(lookup, "GMAIL_USERNAME", ""),
            password: env_or!(lookup, "GMAIL_PASSWORD", ""),
            smtp_host: env_or!(lookup, "SMTP_HOST", "smtp.gmail.com"),
            smtp_port: parse_env!(lookup, "SMTP_PORT", u16, 587),
        },
        slack_webhook_url: env_or!(lookup, "SLACK_WEBHOOK_URL", ""),
        max_attempts: parse_env!(lookup, "NOTIFY_MAX_ATTEMPTS", u32, 2).max(1),
        retry_delay: Duration::from_millis(parse_env!(lookup, "NOTIFY_RETRY_DELAY_MS", u64, 500)),
        timeout: Duration::from_secs(parse_env!(lookup, "NOTIFY_TIMEOUT_SEC", u64, 10)),
    };
    if notifications.enabled {
        notifications.check_credentials()?;
    }

    let humidifier_enabled = parse_env_bool!(lookup, "ENABLE_HUMIDIFIER", false);
    let humidifier_host = if humidifier_enabled && !mock_sensors {
        require_env!(lookup, "HUMIDIFIER_HOST")
    } else {
        env_or!(lookup, "HUMIDIFIER_HOST", "")
    };
    let humidifier = HumidifierConfig {
        enabled: humidifier_enabled,
        host: humidifier_host,
        min_dwell: Duration::from_secs(parse_env!(lookup, "HUMIDIFIER_MIN_DWELL_SEC", u64, 300)),
        off_on_shutdown: parse_env_bool!(lookup, "HUMIDIFIER_OFF_ON_SHUTDOWN", true),
    };

    let retention_days = parse_env!(lookup, "RETENTION_DAYS", u32, 7);
    if retention_days == 0 {
        return Err(ConfigError::invalid("RETENTION_DAYS", "must be at least 1").into());
    }

    Ok(Config {
        db_url,
        db_pool_max,
        http_port,
        mock_sensors,
        sources,
        thresholds,
        alert_confirmation_count: parse_env!(lookup, "ALERT_CONFIRMATION_COUNT", u32, 1).max(1),
        retention_days,
        prune_interval: Duration::from_secs(parse_env!(lookup, "PRUNE_INTERVAL_SEC", u64, 3600)),
        notifications,
        humidifier,
        bus_queue_capacity: parse_env!(lookup, "BUS_QUEUE_CAPACITY", usize, 256),
    })
}

impl NotificationConfig {
    /// Every enabled backend must have the credentials it needs.
    pub fn check_credentials(&self) -> std::result::Result<(), ConfigError> {
        // ---
        for backend in &self.backends {
            let missing: Vec<&str> = match backend {
                BackendKind::Gmail => [
                    ("GMAIL_SENDER", self.gmail.sender.is_empty()),
                    ("GMAIL_RECIPIENTS", self.gmail.recipients.is_empty()),
                    ("GMAIL_USERNAME", self.gmail.username.is_empty()),
                    ("GMAIL_PASSWORD", self.gmail.password.is_empty()),
                ]
                .into_iter()
                .filter_map(|(name, absent)| absent.then_some(name))
                .collect(),
                BackendKind::Slack => {
                    if self.slack_webhook_url.is_empty() {
                        vec!["SLACK_WEBHOOK_URL"]
                    } else {
                        vec![]
                    }
                }
            };
            if !missing.is_empty() {
                return Err(ConfigError::MissingCredentials {
                    backend: backend.as_str(),
                    missing: missing.join(", "),
                });
            }
        }
        Ok(())
    }
}

impl Config {
    /// Initial value of the runtime-mutable settings.
    pub fn runtime_settings(&self) -> RuntimeSettings {
        // ---
        RuntimeSettings {
            thresholds: self.thresholds.clone(),
            notifications_enabled: self.notifications.enabled,
            retention_days: self.retention_days,
        }
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like passwords and webhook tokens while
    /// showing all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        let sources = &self.sources;
        let notifications = &self.notifications;
        let humidifier = &self.humidifier;

        let masked_password = if notifications.gmail.password.is_empty() {
            "<unset>"
        } else {
            "****"
        };
        let webhook = &notifications.slack_webhook_url;
        let masked_webhook = match webhook.find("/services/") {
            Some(pos) => format!("{}/services/****", &webhook[..pos]),
            None if webhook.is_empty() => "<unset>".to_string(),
            None => "****".to_string(),
        };
        let backends: Vec<&str> = notifications.backends.iter().map(|b| b.as_str()).collect();
        let pico_port = sources.pico_serial_port.as_deref().unwrap_or("<none>");
        let poll_secs = sources.poll_interval.as_secs();
        let dwell_secs = humidifier.min_dwell.as_secs();

        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL                : {}", self.db_url);
        tracing::info!("  DB_POOL_MAX                 : {}", self.db_pool_max);
        tracing::info!("  HTTP_PORT                   : {}", self.http_port);
        tracing::info!("  MOCK_SENSORS                : {}", self.mock_sensors);
        tracing::info!("  POLL_INTERVAL_SEC           : {}", poll_secs);
        tracing::info!(
            "  DEGRADED_AFTER_FAILURES     : {}",
            sources.degraded_after_failures
        );
        tracing::info!("  PICO_SERIAL_PORT            : {}", pico_port);
        tracing::info!("  PLANT_IDS                   : {:?}", sources.plant_ids);
        tracing::info!("  THRESHOLDS                  : {:?}", self.thresholds);
        tracing::info!(
            "  ALERT_CONFIRMATION_COUNT    : {}",
            self.alert_confirmation_count
        );
        tracing::info!("  RETENTION_DAYS              : {}", self.retention_days);
        tracing::info!("  ENABLE_NOTIFICATION_SERVICE : {}", notifications.enabled);
        tracing::info!("  NOTIFICATION_BACKENDS       : {}", backends.join(","));
        tracing::info!("  GMAIL_PASSWORD              : {}", masked_password);
        tracing::info!("  SLACK_WEBHOOK_URL           : {}", masked_webhook);
        tracing::info!("  ENABLE_HUMIDIFIER           : {}", humidifier.enabled);
        tracing::info!("  HUMIDIFIER_HOST             : {}", humidifier.host);
        tracing::info!("  HUMIDIFIER_MIN_DWELL_SEC    : {}", dwell_secs);
        tracing::info!(
            "  BUS_QUEUE_CAPACITY          : {}",
            self.bus_queue_capacity
        );
    }
}
