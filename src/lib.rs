//! Home environmental monitoring appliance.
//!
//! Sample sources publish normalized samples on an in-process [`bus`]. The
//! recorder persists them, the [`alert`] engine turns them into threshold
//! transitions, and the notifier, humidifier controller and status board
//! consume those. [`app::App`] wires the pieces together; [`routes`] serves
//! the dashboard API.

pub mod actuator;
pub mod alert;
pub mod app;
pub mod bus;
pub mod config;
pub mod error;
pub mod models;
pub mod notify;
pub mod pipeline;
pub mod routes;
pub mod schema;
pub mod settings;
pub mod shutdown;
pub mod sources;
pub mod status;
pub mod store;

pub use app::{App, AppContext, Collaborators};
pub use bus::EventBus;
pub use config::Config;
pub use models::{AlertEvent, AlertStatus, BusMessage, Metric, Sample};
