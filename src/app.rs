//! Application context and task lifecycle.
//!
//! [`App::start`] builds every component explicitly, in dependency order:
//! live settings, bus, alert state rehydrated from the store, consumers, and
//! finally the sample sources. Consumers subscribe before any producer runs
//! so no sample is missed. [`App::shutdown`] stops everything and waits for
//! in-flight work.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::actuator::{
    self, ControllerConfig, HumidifierController, KasaPlug, LoggingSwitch, PowerSwitch,
};
use crate::alert::{spawn_alert_service, AlertEngine, AlertState};
use crate::bus::EventBus;
use crate::config::Config;
use crate::models::{AlertStatus, HumidifierState, Metric};
use crate::notify::{
    spawn_notification_service, BackendRegistry, NotificationDispatcher, Notifier, RetryPolicy,
};
use crate::pipeline::{spawn_pruner, spawn_recorder};
use crate::settings::LiveSettings;
use crate::shutdown::{self, ShutdownTrigger};
use crate::sources::climate::CLIMATE_SOURCE_ID;
use crate::sources::{
    line_channel, spawn_line_forwarder, spawn_source, ClimateSensor, ClimateSource, LineSource,
    MoistureSource, SerialLineSource, SimulatedClimateSensor, SimulatedLineSource,
    SysfsClimateSensor,
};
use crate::status::{spawn_status_board, BoardSnapshot, StatusBoard};
use crate::store::{ReadingStore, SettingsStore};

/// Capacity of the channel shared by the serial reader and `POST /api/pico`.
const PICO_LINE_CAPACITY: usize = 64;

/// How long shutdown waits for each task.
const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Slack on top of a computed join budget for scheduling and logging.
const JOIN_GRACE: Duration = Duration::from_secs(1);

/// Shutdown wait for the notifier: enough for the dispatch in flight to
/// finish every attempt, never less than [`TASK_JOIN_TIMEOUT`].
fn notifier_join_timeout(policy: &RetryPolicy) -> Duration {
    (policy.dispatch_budget() + JOIN_GRACE).max(TASK_JOIN_TIMEOUT)
}

/// External devices and services the pipeline talks to.
#[derive(Default)]
pub struct Collaborators {
    pub climate: Option<Box<dyn ClimateSensor>>,
    /// Extra moisture line input (serial port or simulation). HTTP ingestion
    /// is always available.
    pub moisture_input: Option<Box<dyn LineSource>>,
    pub notifiers: Vec<Arc<dyn Notifier>>,
    pub switch: Option<Arc<dyn PowerSwitch>>,
}

impl Collaborators {
    // ---
    /// Real hardware, or simulations when `MOCK_SENSORS` is set.
    pub fn from_config(config: &Config) -> Result<Self> {
        // ---
        let (climate, moisture_input): (Box<dyn ClimateSensor>, Option<Box<dyn LineSource>>) =
            if config.mock_sensors {
                info!("Using simulated sensors");
                let lines = SimulatedLineSource::new(
                    &config.sources.plant_ids,
                    config.sources.poll_interval * 5,
                );
                (
                    Box::new(SimulatedClimateSensor::new()) as Box<dyn ClimateSensor>,
                    Some(Box::new(lines) as Box<dyn LineSource>),
                )
            } else {
                let serial = config
                    .sources
                    .pico_serial_port
                    .as_ref()
                    .map(|port| Box::new(SerialLineSource::new(port)) as Box<dyn LineSource>);
                let sensor = SysfsClimateSensor::new(&config.sources.dht_iio_device);
                (Box::new(sensor) as Box<dyn ClimateSensor>, serial)
            };

        // Backends are built whenever their credentials are present so an
        // admin can enable notifications at runtime.
        let notifiers = match BackendRegistry::default().build(&config.notifications) {
            Ok(notifiers) => notifiers,
            Err(e) if !config.notifications.enabled => {
                info!("Notification backends not configured: {}", e);
                Vec::new()
            }
            Err(e) => return Err(e).context("Failed to set up notification backends"),
        };

        let switch: Option<Arc<dyn PowerSwitch>> =
            match (config.humidifier.enabled, config.mock_sensors) {
                (false, _) => None,
                (true, true) => Some(Arc::new(LoggingSwitch)),
                (true, false) => Some(Arc::new(KasaPlug::new(&config.humidifier.host))),
            };

        Ok(Self {
            climate: Some(climate),
            moisture_input,
            notifiers,
            switch,
        })
    }
}

/// Shared handles given to the HTTP layer.
#[derive(Clone)]
pub struct AppContext {
    pub bus: EventBus,
    pub readings: Arc<dyn ReadingStore>,
    pub settings_store: Arc<dyn SettingsStore>,
    pub settings: LiveSettings,
    pub board: watch::Receiver<BoardSnapshot>,
    pub alerts: watch::Receiver<Vec<AlertState>>,
    pub humidifier: Option<watch::Receiver<HumidifierState>>,
    /// Feeds raw Pico lines into the moisture source.
    pub pico_lines: mpsc::Sender<String>,
}

pub struct App {
    context: AppContext,
    trigger: ShutdownTrigger,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    notifier_join_timeout: Duration,
}

impl App {
    // ---
    pub async fn start<S>(
        config: &Config,
        store: Arc<S>,
        collaborators: Collaborators,
    ) -> Result<Self>
    where
        S: ReadingStore + SettingsStore + 'static,
    {
        // ---
        let readings: Arc<dyn ReadingStore> = store.clone();
        let settings_store: Arc<dyn SettingsStore> = store;

        let settings = LiveSettings::new(config.runtime_settings());
        settings
            .load_overrides(settings_store.as_ref())
            .await
            .context("Failed to load saved runtime settings")?;

        let bus = EventBus::new(config.bus_queue_capacity);
        let (trigger, shutdown) = shutdown::channel();
        let mut tasks = Vec::new();

        // Alert state from the newest stored reading of each stream
        let latest = readings
            .latest_all()
            .await
            .context("Failed to read latest samples")?;
        let mut engine = AlertEngine::new(config.alert_confirmation_count);
        for sample in &latest {
            let threshold = settings.threshold_for(sample.metric, &sample.source_id);
            let status = engine.rehydrate(sample, &threshold);
            if status != AlertStatus::Normal {
                info!(
                    metric = %sample.metric,
                    source_id = %sample.source_id,
                    value = sample.value,
                    status = %status,
                    "Rehydrated active alert"
                );
            }
        }
        let humidity_demand = engine
            .status(Metric::Humidity, CLIMATE_SOURCE_ID)
            .map(actuator::demand_for);

        // Consumers
        tasks.push((
            "recorder",
            spawn_recorder(readings.clone(), &bus, shutdown.clone()),
        ));

        let (alert_task, alerts) =
            spawn_alert_service(engine, bus.clone(), settings.clone(), shutdown.clone());
        tasks.push(("alert-engine", alert_task));

        let policy = RetryPolicy::from(&config.notifications);
        let dispatcher =
            NotificationDispatcher::new(collaborators.notifiers, policy, settings.clone());
        tasks.push((
            "notifier",
            spawn_notification_service(dispatcher, &bus, shutdown.clone()),
        ));

        let humidifier = match collaborators.switch {
            Some(switch) => {
                let controller_config = ControllerConfig::from(&config.humidifier);
                let (task, rx) = HumidifierController::new(switch, controller_config)
                    .with_store(settings_store.clone())
                    .with_initial_demand(humidity_demand)
                    .spawn(bus.clone(), shutdown.clone());
                tasks.push(("humidifier", task));
                Some(rx)
            }
            None => None,
        };

        let (board_task, board) =
            spawn_status_board(StatusBoard::seeded(latest), &bus, shutdown.clone());
        tasks.push(("status-board", board_task));

        tasks.push((
            "pruner",
            spawn_pruner(
                readings.clone(),
                settings.clone(),
                config.prune_interval,
                shutdown.clone(),
            ),
        ));

        // Producers
        if let Some(sensor) = collaborators.climate {
            let source = ClimateSource::new(sensor, config.sources.poll_interval);
            tasks.push((
                "climate-source",
                spawn_source(
                    Box::new(source),
                    bus.clone(),
                    &config.sources,
                    shutdown.clone(),
                ),
            ));
        }

        let (pico_lines, channel) = line_channel(PICO_LINE_CAPACITY);
        if let Some(input) = collaborators.moisture_input {
            tasks.push((
                "moisture-input",
                spawn_line_forwarder(
                    input,
                    pico_lines.clone(),
                    config.sources.max_retry_delay,
                    shutdown.clone(),
                ),
            ));
        }
        let moisture = MoistureSource::new(
            Box::new(channel),
            config.sources.pico_read_timeout,
            config.sources.spike_threshold,
        );
        tasks.push((
            "moisture-source",
            spawn_source(Box::new(moisture), bus.clone(), &config.sources, shutdown),
        ));

        info!(tasks = tasks.len(), "Pipeline started");

        Ok(Self {
            context: AppContext {
                bus,
                readings,
                settings_store,
                settings,
                board,
                alerts,
                humidifier,
                pico_lines,
            },
            trigger,
            tasks,
            notifier_join_timeout: notifier_join_timeout(&policy),
        })
    }

    pub fn context(&self) -> AppContext {
        self.context.clone()
    }

    /// Stop every task and wait for in-flight work (notification attempts,
    /// the humidifier's final off command) to finish or time out.
    pub async fn shutdown(self) {
        // ---
        info!("Shutting down pipeline");
        self.trigger.trigger();
        self.context.bus.close();

        for (name, task) in self.tasks {
            let limit = match name {
                "notifier" => self.notifier_join_timeout,
                _ => TASK_JOIN_TIMEOUT,
            };
            match tokio::time::timeout(limit, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, "Task ended abnormally: {}", e),
                Err(_) => warn!(task = name, "Task did not stop in time"),
            }
        }

        let stats = self.context.bus.stats();
        info!(
            published = stats.published,
            dropped = stats.dropped,
            "Pipeline stopped"
        );
    }
}
