//! Humidifier control.
//!
//! The controller listens to `alert.humidity`. A too-low alert asks for the
//! humidifier to be on, a resolution (or a too-high alert) asks for it to be
//! off. Commands go to a [`PowerSwitch`]; the Kasa plug is the real one and
//! [`LoggingSwitch`] stands in when sensors are mocked.
//!
//! The believed state flips when a command is issued and is marked
//! `confirmed` once the switch acknowledges it. Failed commands are retried
//! with capped exponential backoff. Two toggles are never closer together
//! than `min_dwell`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{topics, EventBus};
use crate::config::HumidifierConfig;
use crate::error::DeliveryError;
use crate::models::{AlertStatus, BusMessage, HumidifierState, Metric};
use crate::shutdown::Shutdown;
use crate::store::SettingsStore;

pub mod kasa;

pub use kasa::KasaPlug;

/// Settings key holding the last known humidifier state.
pub const HUMIDIFIER_STATE_KEY: &str = "humidifier_state";

const FIRST_RETRY_DELAY: Duration = Duration::from_secs(2);

#[async_trait]
pub trait PowerSwitch: Send + Sync {
    /// Human readable target, for logs.
    fn describe(&self) -> String;

    async fn set_power(&self, on: bool) -> Result<(), DeliveryError>;
}

/// Switch that only logs. Used with simulated sensors.
#[derive(Debug, Default)]
pub struct LoggingSwitch;

#[async_trait]
impl PowerSwitch for LoggingSwitch {
    fn describe(&self) -> String {
        "logging switch".to_string()
    }

    async fn set_power(&self, on: bool) -> Result<(), DeliveryError> {
        info!(on, "Simulated humidifier switched");
        Ok(())
    }
}

/// Whether a humidity alert status asks for the humidifier to run.
pub fn demand_for(status: AlertStatus) -> bool {
    status == AlertStatus::TooLow
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    // ---
    pub min_dwell: Duration,
    pub max_retry_delay: Duration,
    /// Upper bound for a single switch command.
    pub command_timeout: Duration,
    pub off_on_shutdown: bool,
}

impl From<&HumidifierConfig> for ControllerConfig {
    fn from(cfg: &HumidifierConfig) -> Self {
        Self {
            min_dwell: cfg.min_dwell,
            max_retry_delay: Duration::from_secs(60),
            command_timeout: Duration::from_secs(10),
            off_on_shutdown: cfg.off_on_shutdown,
        }
    }
}

pub struct HumidifierController {
    switch: Arc<dyn PowerSwitch>,
    config: ControllerConfig,
    store: Option<Arc<dyn SettingsStore>>,
    initial_demand: Option<bool>,
}

impl HumidifierController {
    // ---
    pub fn new(switch: Arc<dyn PowerSwitch>, config: ControllerConfig) -> Self {
        Self {
            switch,
            config,
            store: None,
            initial_demand: None,
        }
    }

    /// Restore the believed state from, and save it to, `store`.
    pub fn with_store(mut self, store: Arc<dyn SettingsStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Demand derived from the rehydrated humidity alert state, applied as
    /// soon as the controller starts.
    pub fn with_initial_demand(mut self, on: Option<bool>) -> Self {
        self.initial_demand = on;
        self
    }

    /// Start the controller task. The subscription is taken before this
    /// returns. The receiver always holds the believed state.
    pub fn spawn(
        self,
        bus: EventBus,
        mut shutdown: Shutdown,
    ) -> (JoinHandle<()>, watch::Receiver<HumidifierState>) {
        // ---
        let alert_topic = topics::alert(Metric::Humidity);
        let mut subscription = bus.subscribe_as("humidifier", &[alert_topic.as_str()]);
        let (state_tx, state_rx) = watch::channel(HumidifierState {
            is_on: false,
            confirmed: false,
            changed_at: Utc::now(),
        });

        let mut runner = Runner {
            switch: self.switch,
            config: self.config,
            store: self.store,
            bus,
            state_tx,
            desired: None,
            last_toggle: None,
            failures: 0,
            next_attempt: None,
        };
        let initial_demand = self.initial_demand;

        let task = tokio::spawn(async move {
            runner.restore().await;
            info!(switch = %runner.switch.describe(), "Humidifier controller started");
            if let Some(on) = initial_demand {
                runner.set_demand(on);
            }

            loop {
                let wake = runner.next_attempt;
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    _ = sleep_until(wake) => runner.attempt().await,
                    next = subscription.recv() => match next {
                        Some(envelope) => {
                            if let BusMessage::Alert(event) = envelope.message {
                                debug!(status = %event.new_status, "Humidity alert received");
                                runner.set_demand(demand_for(event.new_status));
                            }
                        }
                        None => break,
                    },
                }
            }

            runner.power_down().await;
            debug!("Humidifier controller stopped");
        });

        (task, state_rx)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Runner {
    switch: Arc<dyn PowerSwitch>,
    config: ControllerConfig,
    store: Option<Arc<dyn SettingsStore>>,
    bus: EventBus,
    state_tx: watch::Sender<HumidifierState>,
    /// Latest requested state; `None` until the first humidity alert.
    desired: Option<bool>,
    last_toggle: Option<Instant>,
    failures: u32,
    next_attempt: Option<Instant>,
}

impl Runner {
    // ---
    fn believed(&self) -> HumidifierState {
        *self.state_tx.borrow()
    }

    /// Load the state saved before the last restart. It stays unconfirmed
    /// until the plug acknowledges a new command.
    async fn restore(&mut self) {
        // ---
        let Some(store) = &self.store else { return };
        match store.get_setting(HUMIDIFIER_STATE_KEY).await {
            Ok(Some(raw)) => match serde_json::from_str::<HumidifierState>(&raw) {
                Ok(saved) => {
                    info!(is_on = saved.is_on, "Restored humidifier state");
                    self.state_tx.send_replace(HumidifierState {
                        confirmed: false,
                        ..saved
                    });
                }
                Err(e) => warn!("Ignoring unreadable humidifier state: {}", e),
            },
            Ok(None) => {}
            Err(e) => warn!("Failed to load humidifier state: {}", e),
        }
    }

    fn set_demand(&mut self, on: bool) {
        // ---
        self.desired = Some(on);
        let state = self.believed();

        if on == state.is_on {
            if state.confirmed {
                self.next_attempt = None;
            } else if self.next_attempt.is_none() {
                self.next_attempt = Some(Instant::now());
            }
            return;
        }

        let now = Instant::now();
        let earliest = self
            .last_toggle
            .map(|t| t + self.config.min_dwell)
            .unwrap_or(now)
            .max(now);
        if earliest > now {
            info!(
                on,
                wait_secs = (earliest - now).as_secs(),
                "Holding humidifier state for minimum dwell"
            );
        }
        self.failures = 0;
        self.next_attempt = Some(earliest);
    }

    async fn attempt(&mut self) {
        // ---
        self.next_attempt = None;
        let Some(on) = self.desired else { return };
        let state = self.believed();
        if on == state.is_on && state.confirmed {
            return;
        }

        if on != state.is_on {
            self.last_toggle = Some(Instant::now());
            self.publish(HumidifierState {
                is_on: on,
                confirmed: false,
                changed_at: Utc::now(),
            })
            .await;
        }

        match self.command(on).await {
            Ok(()) => {
                info!(on, switch = %self.switch.describe(), "Humidifier switched");
                self.failures = 0;
                let state = self.believed();
                self.publish(HumidifierState {
                    confirmed: true,
                    ..state
                })
                .await;
            }
            Err(e) => {
                self.failures += 1;
                let delay = self.retry_delay();
                warn!(
                    on,
                    attempt = self.failures,
                    retry_in_secs = delay.as_secs(),
                    "Humidifier command failed: {}",
                    e
                );
                self.next_attempt = Some(Instant::now() + delay);
            }
        }
    }

    fn retry_delay(&self) -> Duration {
        let exponent = self.failures.saturating_sub(1).min(16);
        FIRST_RETRY_DELAY
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_retry_delay)
    }

    async fn command(&self, on: bool) -> Result<(), DeliveryError> {
        // ---
        let timeout = self.config.command_timeout;
        tokio::time::timeout(timeout, self.switch.set_power(on))
            .await
            .map_err(|_| DeliveryError::Timeout("humidifier", timeout))?
    }

    async fn publish(&mut self, state: HumidifierState) {
        // ---
        self.state_tx.send_replace(state);
        self.bus.emit(BusMessage::Humidifier(state));

        let Some(store) = &self.store else { return };
        let result = match serde_json::to_string(&state) {
            Ok(raw) => store.put_setting(HUMIDIFIER_STATE_KEY, &raw).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!("Failed to persist humidifier state: {}", e);
        }
    }

    /// Best-effort off command on the way out.
    async fn power_down(&mut self) {
        // ---
        let state = self.believed();
        if !self.config.off_on_shutdown || (!state.is_on && state.confirmed) {
            return;
        }

        match self.command(false).await {
            Ok(()) => {
                info!("Humidifier turned off for shutdown");
                self.publish(HumidifierState {
                    is_on: false,
                    confirmed: true,
                    changed_at: Utc::now(),
                })
                .await;
            }
            Err(e) => warn!("Failed to turn humidifier off on shutdown: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::AlertEvent;
    use crate::shutdown;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct FakeSwitch {
        commands: Mutex<Vec<(bool, Instant)>>,
        fail_next: AtomicU32,
    }

    impl FakeSwitch {
        fn failing(times: u32) -> Self {
            Self {
                fail_next: AtomicU32::new(times),
                ..Self::default()
            }
        }

        fn commands(&self) -> Vec<bool> {
            self.commands
                .lock()
                .unwrap()
                .iter()
                .map(|(on, _)| *on)
                .collect()
        }
    }

    #[async_trait]
    impl PowerSwitch for FakeSwitch {
        fn describe(&self) -> String {
            "fake".into()
        }

        async fn set_power(&self, on: bool) -> Result<(), DeliveryError> {
            self.commands.lock().unwrap().push((on, Instant::now()));
            let failing = self
                .fail_next
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(DeliveryError::Device {
                    host: "fake".into(),
                    message: "unreachable".into(),
                });
            }
            Ok(())
        }
    }

    fn config(min_dwell: Duration) -> ControllerConfig {
        ControllerConfig {
            min_dwell,
            max_retry_delay: Duration::from_secs(60),
            command_timeout: Duration::from_secs(5),
            off_on_shutdown: true,
        }
    }

    fn humidity_alert(previous: AlertStatus, new: AlertStatus) -> BusMessage {
        BusMessage::Alert(AlertEvent {
            id: Uuid::new_v4(),
            metric: Metric::Humidity,
            source_id: "dht22".into(),
            previous_status: previous,
            new_status: new,
            value: 35.0,
            threshold_crossed: Some(40.0),
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn test_demand_for_status() {
        assert!(demand_for(AlertStatus::TooLow));
        assert!(!demand_for(AlertStatus::Normal));
        assert!(!demand_for(AlertStatus::TooHigh));
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_humidity_turns_on_then_off() {
        // ---
        let bus = EventBus::new(16);
        let switch = Arc::new(FakeSwitch::default());
        let (trigger, shutdown) = shutdown::channel();
        let (task, mut state) = HumidifierController::new(switch.clone(), config(Duration::ZERO))
            .spawn(bus.clone(), shutdown);

        bus.emit(humidity_alert(AlertStatus::Normal, AlertStatus::TooLow));
        state.wait_for(|s| s.is_on && s.confirmed).await.unwrap();

        bus.emit(humidity_alert(AlertStatus::TooLow, AlertStatus::Normal));
        state.wait_for(|s| !s.is_on && s.confirmed).await.unwrap();
        assert_eq!(switch.commands(), vec![true, false]);

        trigger.trigger();
        task.await.unwrap();
        // Already confirmed off, nothing more to send
        assert_eq!(switch.commands(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_min_dwell_delays_second_toggle() {
        // ---
        let bus = EventBus::new(16);
        let switch = Arc::new(FakeSwitch::default());
        let (_trigger, shutdown) = shutdown::channel();
        let (_task, mut state) =
            HumidifierController::new(switch.clone(), config(Duration::from_secs(300)))
                .spawn(bus.clone(), shutdown);

        bus.emit(humidity_alert(AlertStatus::Normal, AlertStatus::TooLow));
        state.wait_for(|s| s.is_on && s.confirmed).await.unwrap();
        let started = Instant::now();

        bus.emit(humidity_alert(AlertStatus::TooLow, AlertStatus::Normal));
        state.wait_for(|s| !s.is_on).await.unwrap();
        assert!(Instant::now() - started >= Duration::from_secs(300));

        let commands = switch.commands.lock().unwrap().clone();
        assert_eq!(commands.len(), 2);
        assert!(commands[1].1 - commands[0].1 >= Duration::from_secs(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_command_is_retried() {
        // ---
        let bus = EventBus::new(16);
        let switch = Arc::new(FakeSwitch::failing(2));
        let (_trigger, shutdown) = shutdown::channel();
        let (_task, mut state) = HumidifierController::new(switch.clone(), config(Duration::ZERO))
            .spawn(bus.clone(), shutdown);

        bus.emit(humidity_alert(AlertStatus::Normal, AlertStatus::TooLow));

        // Believed on right away, confirmed only after the third attempt
        state.wait_for(|s| s.is_on).await.unwrap();
        state.wait_for(|s| s.confirmed).await.unwrap();
        assert_eq!(switch.commands(), vec![true, true, true]);

        let commands = switch.commands.lock().unwrap().clone();
        let times: Vec<Instant> = commands.iter().map(|(_, t)| *t).collect();
        assert!(times[1] - times[0] >= Duration::from_secs(2));
        assert!(times[2] - times[1] >= Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_demand_is_not_resent() {
        // ---
        let bus = EventBus::new(16);
        let switch = Arc::new(FakeSwitch::default());
        let (_trigger, shutdown) = shutdown::channel();
        let (_task, mut state) = HumidifierController::new(switch.clone(), config(Duration::ZERO))
            .spawn(bus.clone(), shutdown);

        bus.emit(humidity_alert(AlertStatus::Normal, AlertStatus::TooLow));
        state.wait_for(|s| s.is_on && s.confirmed).await.unwrap();

        bus.emit(humidity_alert(AlertStatus::TooLow, AlertStatus::TooLow));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(switch.commands(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_turns_humidifier_off() {
        // ---
        let bus = EventBus::new(16);
        let switch = Arc::new(FakeSwitch::default());
        let (trigger, shutdown) = shutdown::channel();
        let (task, mut state) = HumidifierController::new(switch.clone(), config(Duration::ZERO))
            .with_initial_demand(Some(true))
            .spawn(bus.clone(), shutdown);

        state.wait_for(|s| s.is_on && s.confirmed).await.unwrap();
        trigger.trigger();
        task.await.unwrap();

        assert_eq!(switch.commands(), vec![true, false]);
        assert!(!state.borrow().is_on);
    }
}
