//! Dashboard status board.
//!
//! A presentation-side subscriber of every topic. It keeps the last known
//! good value of each stream, the health of each source, the most recent
//! alert transitions and the humidifier state. Values stay visible while a
//! source is degraded; they are only flagged stale.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::bus::EventBus;
use crate::models::{
    AlertEvent, BusMessage, HumidifierState, Metric, Sample, SourceHealth, SourceStatusEvent,
};
use crate::shutdown::Shutdown;

const RECENT_ALERTS: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestValue {
    #[serde(flatten)]
    pub sample: Sample,
    /// The producing source is currently degraded.
    pub stale: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BoardSnapshot {
    pub latest: Vec<LatestValue>,
    pub sources: Vec<SourceStatusEvent>,
    /// Newest first.
    pub recent_alerts: Vec<AlertEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub humidifier: Option<HumidifierState>,
}

#[derive(Debug, Default)]
pub struct StatusBoard {
    latest: BTreeMap<(Metric, String), Sample>,
    sources: BTreeMap<String, SourceStatusEvent>,
    recent_alerts: VecDeque<AlertEvent>,
    humidifier: Option<HumidifierState>,
}

impl StatusBoard {
    // ---
    /// Start from the newest stored readings so the dashboard has values
    /// right after a restart.
    pub fn seeded(samples: Vec<Sample>) -> Self {
        let mut board = Self::default();
        for sample in samples {
            board.latest.insert(sample.key(), sample);
        }
        board
    }

    pub fn apply(&mut self, message: BusMessage) {
        // ---
        match message {
            BusMessage::Sample(sample) => {
                let newer = self
                    .latest
                    .get(&sample.key())
                    .map_or(true, |known| sample.observed_at >= known.observed_at);
                if newer {
                    self.latest.insert(sample.key(), sample);
                }
            }
            BusMessage::Alert(event) => {
                self.recent_alerts.push_front(event);
                self.recent_alerts.truncate(RECENT_ALERTS);
            }
            BusMessage::SourceStatus(status) => {
                self.sources.insert(status.source.clone(), status);
            }
            BusMessage::Humidifier(state) => self.humidifier = Some(state),
        }
    }

    fn is_stale(&self, metric: Metric) -> bool {
        self.sources
            .values()
            .any(|s| s.health == SourceHealth::Degraded && s.metrics.contains(&metric))
    }

    pub fn snapshot(&self) -> BoardSnapshot {
        // ---
        BoardSnapshot {
            latest: self
                .latest
                .values()
                .map(|sample| LatestValue {
                    stale: self.is_stale(sample.metric),
                    sample: sample.clone(),
                })
                .collect(),
            sources: self.sources.values().cloned().collect(),
            recent_alerts: self.recent_alerts.iter().cloned().collect(),
            humidifier: self.humidifier,
        }
    }
}

/// Feed the board from every bus topic. The receiver always holds the
/// latest snapshot.
pub fn spawn_status_board(
    mut board: StatusBoard,
    bus: &EventBus,
    mut shutdown: Shutdown,
) -> (JoinHandle<()>, watch::Receiver<BoardSnapshot>) {
    // ---
    let mut subscription = bus.subscribe_as("status-board", &["*"]);
    let (tx, rx) = watch::channel(board.snapshot());

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
            board.apply(envelope.message);
            tx.send_replace(board.snapshot());
        }
        debug!(dropped = subscription.dropped(), "Status board stopped");
    });

    (task, rx)
}
