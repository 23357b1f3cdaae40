//! Soil-moisture adapter for the Pico microcontroller.
//!
//! The Pico writes one JSON object per line, mapping plant ids to readings:
//!
//! ```text
//! {"plant-1": 45.5, "plant-2": {"percentage": 61.0, "raw": 28113}}
//! ```
//!
//! Lines arrive over USB serial or through `POST /api/pico`; both paths feed
//! the same bounded channel, which [`MoistureSource`] drains.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::climate::random_walk;
use super::SampleSource;
use crate::error::SourceError;
use crate::models::{Metric, Sample};
use crate::shutdown::Shutdown;

pub const MOISTURE_SOURCE_NAME: &str = "pico";

/// Anything that yields newline-delimited text.
#[async_trait]
pub trait LineSource: Send {
    /// Next line without its terminator. `Err(Closed)` once no more input
    /// can ever arrive.
    async fn next_line(&mut self) -> Result<String, SourceError>;
}

/// Lines from any buffered async reader. End of input is `Closed`.
pub struct ReaderLineSource<R> {
    reader: R,
}

impl<R> ReaderLineSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

#[async_trait]
impl<R> LineSource for ReaderLineSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next_line(&mut self) -> Result<String, SourceError> {
        // ---
        let mut line = String::new();
        let n = self
            .reader
            .read_line(&mut line)
            .await
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidData => SourceError::Malformed(e.to_string()),
                _ => SourceError::TransientRead(e.to_string()),
            })?;
        if n == 0 {
            return Err(SourceError::Closed);
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Serial device opened as a character file. The port is expected to be in
/// raw mode at the Pico's baud rate already (udev rule or `stty`). The device
/// is reopened after an unplug.
pub struct SerialLineSource {
    path: PathBuf,
    reader: Option<BufReader<tokio::fs::File>>,
}

impl SerialLineSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            reader: None,
        }
    }
}

#[async_trait]
impl LineSource for SerialLineSource {
    async fn next_line(&mut self) -> Result<String, SourceError> {
        // ---
        let mut reader = match self.reader.take() {
            Some(reader) => reader,
            None => {
                let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
                    SourceError::TransientRead(format!("open {}: {}", self.path.display(), e))
                })?;
                info!("Opened serial port {}", self.path.display());
                BufReader::new(file)
            }
        };

        // The handle is kept after a clean read or a garbled line; any other
        // failure drops it so the device is reopened.
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => Err(SourceError::TransientRead(format!(
                "{} reached end of input",
                self.path.display()
            ))),
            Ok(_) => {
                self.reader = Some(reader);
                Ok(line.trim_end_matches(['\r', '\n']).to_string())
            }
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                self.reader = Some(reader);
                Err(SourceError::Malformed(format!(
                    "undecodable line from {}: {}",
                    self.path.display(),
                    e
                )))
            }
            Err(e) => Err(SourceError::TransientRead(format!(
                "read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

/// Receiving end of the shared moisture line channel.
pub struct ChannelLineSource {
    rx: mpsc::Receiver<String>,
}

/// Bounded channel carrying raw Pico lines into a [`MoistureSource`].
pub fn line_channel(capacity: usize) -> (mpsc::Sender<String>, ChannelLineSource) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (tx, ChannelLineSource { rx })
}

#[async_trait]
impl LineSource for ChannelLineSource {
    async fn next_line(&mut self) -> Result<String, SourceError> {
        self.rx.recv().await.ok_or(SourceError::Closed)
    }
}

/// Generates Pico-style lines when sensors are mocked.
pub struct SimulatedLineSource {
    rng: StdRng,
    interval: Duration,
    moisture: Vec<(u32, f64)>,
}

impl SimulatedLineSource {
    pub fn new(plant_ids: &[u32], interval: Duration) -> Self {
        // ---
        let mut rng = StdRng::from_entropy();
        let moisture = plant_ids
            .iter()
            .map(|&id| (id, rng.gen_range(40.0..70.0)))
            .collect();
        Self {
            rng,
            interval,
            moisture,
        }
    }
}

#[async_trait]
impl LineSource for SimulatedLineSource {
    async fn next_line(&mut self) -> Result<String, SourceError> {
        // ---
        tokio::time::sleep(self.interval).await;

        let mut line = serde_json::Map::new();
        for (id, value) in self.moisture.iter_mut() {
            *value = random_walk(&mut self.rng, *value, 0.5, 10.0, 90.0);
            let raw = (65535.0 * (1.0 - *value / 100.0)).round() as u32;
            line.insert(
                format!("plant-{id}"),
                serde_json::json!({ "percentage": *value, "raw": raw }),
            );
        }
        Ok(Value::Object(line).to_string())
    }
}

/// Copy lines from `lines` into the moisture channel until shutdown.
/// Read errors are logged and retried after a capped delay.
pub fn spawn_line_forwarder(
    mut lines: Box<dyn LineSource>,
    tx: mpsc::Sender<String>,
    max_retry_delay: Duration,
    mut shutdown: Shutdown,
) -> JoinHandle<()> {
    // ---
    tokio::spawn(async move {
        let mut delay = Duration::from_secs(1);
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                next = lines.next_line() => next,
            };

            match next {
                Ok(line) => {
                    delay = Duration::from_secs(1);
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(SourceError::Closed) => break,
                Err(SourceError::Malformed(msg)) => {
                    warn!("Skipping garbled moisture line: {}", msg);
                }
                Err(e) => {
                    warn!("Moisture line input failed, retrying in {:?}: {}", delay, e);
                    tokio::select! {
                        biased;
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay = (delay * 2).min(max_retry_delay);
                }
            }
        }
        debug!("Moisture line forwarder stopped");
    })
}

/// Plant id from `"plant-N"` or bare `"N"`.
fn plant_source_id(key: &str) -> Option<String> {
    // ---
    let digits = key.trim().strip_prefix("plant-").unwrap_or(key.trim());
    let id: u32 = digits.parse().ok()?;
    (id > 0).then(|| format!("plant-{id}"))
}

fn percentage(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Object(fields) => fields.get("percentage").and_then(Value::as_f64),
        _ => None,
    }
}

/// Parse one Pico line into one moisture sample per valid plant entry.
///
/// Entries with an unknown key or a percentage outside `[0, 100]` are skipped
/// with a warning. A line with no valid entry at all is `Malformed`.
pub fn parse_line(line: &str, observed_at: DateTime<Utc>) -> Result<Vec<Sample>, SourceError> {
    // ---
    let data: Value = serde_json::from_str(line)
        .map_err(|e| SourceError::Malformed(format!("invalid JSON: {e}")))?;
    let Value::Object(entries) = data else {
        return Err(SourceError::Malformed(format!(
            "expected a JSON object, got: {line}"
        )));
    };

    let mut samples = Vec::with_capacity(entries.len());
    for (key, value) in &entries {
        let Some(source_id) = plant_source_id(key) else {
            warn!(key = %key, "Ignoring entry with invalid plant id");
            continue;
        };
        let Some(pct) = percentage(value) else {
            warn!(source_id = %source_id, "Ignoring entry without a numeric percentage");
            continue;
        };
        if !(0.0..=100.0).contains(&pct) {
            warn!(source_id = %source_id, value = pct, "Ignoring moisture outside [0, 100]");
            continue;
        }
        samples.push(Sample::new(Metric::Moisture, source_id, pct, observed_at)?);
    }

    if samples.is_empty() {
        return Err(SourceError::Malformed(format!("no valid plant readings in: {line}")));
    }
    Ok(samples)
}

/// Drains Pico lines and turns them into moisture samples.
pub struct MoistureSource {
    lines: Box<dyn LineSource>,
    read_timeout: Duration,
    spike_threshold: f64,
    last_accepted: HashMap<String, f64>,
}

impl MoistureSource {
    // ---
    pub fn new(lines: Box<dyn LineSource>, read_timeout: Duration, spike_threshold: f64) -> Self {
        Self {
            lines,
            read_timeout,
            spike_threshold,
            last_accepted: HashMap::new(),
        }
    }

    /// A jump to 100% far above the last accepted reading is a failing
    /// capacitive sensor, not watering. First readings are never spikes.
    fn is_spike(&self, sample: &Sample) -> bool {
        // ---
        if sample.value < 100.0 {
            return false;
        }
        self.last_accepted
            .get(&sample.source_id)
            .is_some_and(|last| sample.value - last > self.spike_threshold)
    }
}

#[async_trait]
impl SampleSource for MoistureSource {
    fn name(&self) -> &str {
        MOISTURE_SOURCE_NAME
    }

    fn metrics(&self) -> &[Metric] {
        &[Metric::Moisture]
    }

    fn cadence(&self) -> Option<Duration> {
        None
    }

    async fn poll(&mut self) -> Result<Vec<Sample>, SourceError> {
        // ---
        let line = tokio::time::timeout(self.read_timeout, self.lines.next_line())
            .await
            .map_err(|_| SourceError::Timeout(self.read_timeout))??;

        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }

        let mut accepted = Vec::new();
        for sample in parse_line(line, Utc::now())? {
            if self.is_spike(&sample) {
                warn!(
                    source_id = %sample.source_id,
                    value = sample.value,
                    last = self.last_accepted.get(&sample.source_id).copied(),
                    threshold = self.spike_threshold,
                    "Spike rejected"
                );
                continue;
            }
            self.last_accepted
                .insert(sample.source_id.clone(), sample.value);
            accepted.push(sample);
        }
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn test_parse_plain_and_structured_entries() {
        // ---
        let line = r#"{"plant-1": 45.5, "plant-2": {"percentage": 61.0, "raw": 28113}, "3": 12}"#;
        let mut samples = parse_line(line, now()).unwrap();
        samples.sort_by(|a, b| a.source_id.cmp(&b.source_id));

        let got: Vec<(&str, f64)> = samples
            .iter()
            .map(|s| (s.source_id.as_str(), s.value))
            .collect();
        let expected = [("plant-1", 45.5), ("plant-2", 61.0), ("plant-3", 12.0)];
        assert_eq!(got, expected);
        assert!(samples.iter().all(|s| s.metric == Metric::Moisture));
    }

    #[test]
    fn test_parse_skips_invalid_entries() {
        // ---
        let line = r#"{"plant-1": 101.0, "pump": 40, "plant-2": "wet", "plant-3": 33.3}"#;
        let samples = parse_line(line, now()).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].source_id, "plant-3");
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        // ---
        let lines = [
            "not json",
            "[1, 2]",
            r#"{"plant-1": -3}"#,
            "{}",
            r#"{"plant-0": 20}"#,
        ];
        for line in lines {
            assert!(
                matches!(parse_line(line, now()), Err(SourceError::Malformed(_))),
                "accepted {line}"
            );
        }
    }

    #[tokio::test]
    async fn test_reader_line_source_reports_close() {
        // ---
        let input: &[u8] = b"{\"plant-1\": 40}\r\n";
        let mut lines = ReaderLineSource::new(input);
        assert_eq!(lines.next_line().await.unwrap(), r#"{"plant-1": 40}"#);
        assert!(matches!(lines.next_line().await, Err(SourceError::Closed)));
    }

    #[tokio::test]
    async fn test_serial_source_survives_garbled_line() -> anyhow::Result<()> {
        // ---
        let path = std::env::temp_dir().join(format!("pico-{}.tty", uuid::Uuid::new_v4()));
        tokio::fs::write(&path, b"\xff\xfe\x80 noise\n{\"plant-1\": 40}\n").await?;

        let mut source = SerialLineSource::new(&path);
        let first = source.next_line().await;
        assert!(matches!(first, Err(SourceError::Malformed(_))), "{first:?}");
        // Same handle: the next line follows the garbled one
        assert_eq!(source.next_line().await?, r#"{"plant-1": 40}"#);
        let eof = source.next_line().await;
        assert!(matches!(eof, Err(SourceError::TransientRead(_))), "{eof:?}");

        tokio::fs::remove_file(&path).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_spike_to_100_rejected_but_watering_accepted() {
        // ---
        let (tx, lines) = line_channel(8);
        let mut source = MoistureSource::new(Box::new(lines), Duration::from_secs(5), 20.0);

        for line in [
            r#"{"plant-1": 40.0, "plant-2": 95.0}"#,
            r#"{"plant-1": 100.0, "plant-2": 100.0}"#,
            r#"{"plant-1": 80.0}"#,
        ] {
            tx.send(line.to_string()).await.unwrap();
        }

        let first = source.poll().await.unwrap();
        assert_eq!(first.len(), 2);

        // plant-1 jumps by 60 to 100: spike; plant-2 creeps up by 5: fine
        let second = source.poll().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].source_id, "plant-2");

        // A large jump below 100 is watering
        let third = source.poll().await.unwrap();
        assert_eq!(third[0].value, 80.0);
    }

    #[tokio::test]
    async fn test_first_reading_at_100_is_not_a_spike() {
        // ---
        let (tx, lines) = line_channel(8);
        let mut source = MoistureSource::new(Box::new(lines), Duration::from_secs(5), 20.0);
        tx.send(r#"{"plant-4": 100}"#.to_string()).await.unwrap();
        assert_eq!(source.poll().await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_and_blank_lines() {
        // ---
        let (tx, lines) = line_channel(8);
        let mut source = MoistureSource::new(Box::new(lines), Duration::from_secs(60), 20.0);

        assert!(matches!(source.poll().await, Err(SourceError::Timeout(_))));

        tx.send("   ".to_string()).await.unwrap();
        assert!(source.poll().await.unwrap().is_empty());

        drop(tx);
        assert!(matches!(source.poll().await, Err(SourceError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_lines_parse() {
        // ---
        let mut lines = SimulatedLineSource::new(&[1, 2, 3], Duration::from_secs(2));
        for _ in 0..20 {
            let line = lines.next_line().await.unwrap();
            let samples = parse_line(&line, now()).unwrap();
            assert_eq!(samples.len(), 3);
            assert!(samples.iter().all(|s| (10.0..=90.0).contains(&s.value)));
        }
    }
}
