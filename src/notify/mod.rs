//! Alert notification dispatch.
//!
//! Backends form a closed set ([`BackendKind`]) built through a small
//! registry from configuration. Every alert event goes to every backend
//! concurrently; each backend gets a bounded number of attempts with a
//! per-attempt timeout, after which the failure is logged and the event is
//! dropped for that backend. Nothing is queued for later redelivery.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::bus::{spawn_handler, topics, EventBus};
use crate::config::NotificationConfig;
use crate::error::{ConfigError, DeliveryError};
use crate::models::{AlertEvent, BusMessage};
use crate::settings::LiveSettings;
use crate::shutdown::Shutdown;

pub mod email;
pub mod slack;

pub use email::GmailNotifier;
pub use slack::SlackNotifier;

/// One delivery backend.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, subject: &str, body: &str) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Gmail,
    Slack,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Gmail => "gmail",
            BackendKind::Slack => "slack",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gmail" | "email" => Ok(BackendKind::Gmail),
            "slack" => Ok(BackendKind::Slack),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

type BackendFactory = fn(&NotificationConfig) -> Result<Arc<dyn Notifier>, ConfigError>;

/// Maps each backend kind to the constructor that builds it.
pub struct BackendRegistry {
    factories: HashMap<BackendKind, BackendFactory>,
}

impl Default for BackendRegistry {
    fn default() -> Self {
        // ---
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(BackendKind::Gmail, |cfg| {
            let notifier: Arc<dyn Notifier> = Arc::new(GmailNotifier::from_config(&cfg.gmail)?);
            Ok(notifier)
        });
        registry.register(BackendKind::Slack, |cfg| {
            let notifier: Arc<dyn Notifier> = Arc::new(SlackNotifier::new(&cfg.slack_webhook_url)?);
            Ok(notifier)
        });
        registry
    }
}

impl BackendRegistry {
    pub fn register(&mut self, kind: BackendKind, factory: BackendFactory) {
        self.factories.insert(kind, factory);
    }

    /// Build every backend the configuration enables, in order.
    pub fn build(
        &self,
        config: &NotificationConfig,
    ) -> Result<Vec<Arc<dyn Notifier>>, ConfigError> {
        // ---
        config.check_credentials()?;
        config
            .backends
            .iter()
            .map(|kind| {
                let factory = self
                    .factories
                    .get(kind)
                    .ok_or_else(|| ConfigError::UnknownBackend(kind.to_string()))?;
                factory(config)
            })
            .collect()
    }
}

/// Attempt budget for one backend and one event.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, first one included.
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub timeout: Duration,
}

impl From<&NotificationConfig> for RetryPolicy {
    fn from(config: &NotificationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay,
            timeout: config.timeout,
        }
    }
}

impl RetryPolicy {
    // ---
    /// Longest a single dispatch can take when every attempt times out.
    pub fn dispatch_budget(&self) -> Duration {
        // ---
        let attempts = self.max_attempts.max(1);
        self.timeout * attempts + self.retry_delay * (attempts - 1)
    }
}

/// Outcome of one dispatch, per backend name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub skipped: bool,
    pub delivered: Vec<String>,
    pub failed: Vec<String>,
}

pub struct NotificationDispatcher {
    backends: Vec<Arc<dyn Notifier>>,
    policy: RetryPolicy,
    settings: LiveSettings,
}

impl NotificationDispatcher {
    // ---
    pub fn new(
        backends: Vec<Arc<dyn Notifier>>,
        policy: RetryPolicy,
        settings: LiveSettings,
    ) -> Self {
        Self {
            backends,
            policy,
            settings,
        }
    }

    /// Subject and body for an alert event.
    pub fn render(event: &AlertEvent) -> (String, String) {
        // ---
        let subject = if event.is_resolution() {
            format!(
                "Garden monitor: {} back to normal ({})",
                event.metric, event.source_id
            )
        } else {
            format!(
                "Garden monitor: {} {} ({})",
                event.metric, event.new_status, event.source_id
            )
        };
        (subject, event.summary())
    }

    /// Deliver `event` to every backend concurrently. Returns once every
    /// backend has succeeded or exhausted its attempts.
    pub async fn dispatch(&self, event: &AlertEvent) -> DispatchReport {
        // ---
        if !self.settings.notifications_enabled() {
            info!(event_id = %event.id, "Notification service disabled, ignoring event");
            return DispatchReport {
                skipped: true,
                ..DispatchReport::default()
            };
        }

        let (subject, body) = Self::render(event);
        let mut tasks = JoinSet::new();
        for backend in &self.backends {
            tasks.spawn(deliver(backend.clone(), subject.clone(), body.clone(), self.policy));
        }

        let mut report = DispatchReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => report.delivered.push(name),
                Ok((name, Err(_))) => report.failed.push(name),
                Err(e) => error!("Notification task failed: {}", e),
            }
        }
        report
    }
}

async fn deliver(
    backend: Arc<dyn Notifier>,
    subject: String,
    body: String,
    policy: RetryPolicy,
) -> (String, Result<(), DeliveryError>) {
    // ---
    let name = backend.name().to_string();
    let mut attempt = 1;
    loop {
        let send = backend.send(&subject, &body);
        let result = match tokio::time::timeout(policy.timeout, send).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout("notification", policy.timeout)),
        };

        match result {
            Ok(()) => {
                info!(backend = %name, attempt, "Notification sent");
                return (name, Ok(()));
            }
            Err(e) if attempt < policy.max_attempts => {
                warn!(
                    backend = %name,
                    attempt,
                    max_attempts = policy.max_attempts,
                    "Notification attempt failed, retrying: {}",
                    e
                );
                tokio::time::sleep(policy.retry_delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(
                    backend = %name,
                    attempts = attempt,
                    "Notification dropped: {}",
                    e
                );
                return (name, Err(e));
            }
        }
    }
}

/// Dispatch every `alert.*` event, one event at a time.
pub fn spawn_notification_service(
    dispatcher: NotificationDispatcher,
    bus: &EventBus,
    shutdown: Shutdown,
) -> JoinHandle<()> {
    // ---
    let dispatcher = Arc::new(dispatcher);
    spawn_handler(
        bus.subscribe_as("notifier", &[topics::ALL_ALERTS]),
        move |envelope| {
            let dispatcher = dispatcher.clone();
            async move {
                if let BusMessage::Alert(event) = envelope.message {
                    dispatcher.dispatch(&event).await;
                }
                Ok(())
            }
        },
        shutdown,
    )
}
