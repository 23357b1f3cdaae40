use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use garden_monitor::actuator::PowerSwitch;
use garden_monitor::error::DeliveryError;
use garden_monitor::notify::Notifier;
use garden_monitor::store::{ReadingStore, SqliteStore};
use garden_monitor::{config, routes, AlertStatus, App, Collaborators, Config, Metric, Sample};

#[derive(Default)]
struct RecordingNotifier {
    subjects: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, subject: &str, _body: &str) -> Result<(), DeliveryError> {
        self.subjects.lock().unwrap().push(subject.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSwitch {
    commands: Mutex<Vec<bool>>,
}

#[async_trait]
impl PowerSwitch for RecordingSwitch {
    fn describe(&self) -> String {
        "recording".into()
    }

    async fn set_power(&self, on: bool) -> Result<(), DeliveryError> {
        self.commands.lock().unwrap().push(on);
        Ok(())
    }
}

fn test_config() -> Result<Config> {
    // ---
    let mut cfg = config::load_from(|_| None)?;
    cfg.notifications.enabled = true;
    cfg.humidifier.enabled = true;
    cfg.humidifier.min_dwell = Duration::ZERO;
    Ok(cfg)
}

fn humidity(value: f64) -> Sample {
    Sample::new(Metric::Humidity, "dht22", value, Utc::now()).unwrap()
}

/// Poll `check` every 10ms for up to two seconds.
async fn wait_until(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    // ---
    for _ in 0..200 {
        if check() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    bail!("timed out waiting for {what}")
}

#[tokio::test]
async fn published_sample_is_persisted_and_readable() -> Result<()> {
    // ---
    let store = Arc::new(SqliteStore::in_memory().await?);
    let app = App::start(&test_config()?, store.clone(), Collaborators::default()).await?;
    let ctx = app.context();

    let sample = Sample::new(Metric::Temperature, "dht22", 21.4, Utc::now())?;
    ctx.bus.publish_sample(sample.clone());

    let mut stored = None;
    for _ in 0..200 {
        stored = store.latest(Metric::Temperature, Some("dht22")).await?;
        if stored.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let stored = stored.expect("sample was never persisted");
    assert_eq!(stored.metric, sample.metric);
    assert_eq!(stored.source_id, sample.source_id);
    assert_eq!(stored.value, sample.value);

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn low_humidity_notifies_and_drives_humidifier() -> Result<()> {
    // ---
    let notifier = Arc::new(RecordingNotifier::default());
    let switch = Arc::new(RecordingSwitch::default());
    let collaborators = Collaborators {
        notifiers: vec![notifier.clone() as Arc<dyn Notifier>],
        switch: Some(switch.clone() as Arc<dyn PowerSwitch>),
        ..Collaborators::default()
    };

    let store = Arc::new(SqliteStore::in_memory().await?);
    let app = App::start(&test_config()?, store, collaborators).await?;
    let ctx = app.context();

    let commands = || switch.commands.lock().unwrap().clone();
    let subjects = || notifier.subjects.lock().unwrap().clone();

    // Default humidity band is 40..65
    ctx.bus.publish_sample(humidity(35.0));
    ctx.bus.publish_sample(humidity(34.0));
    wait_until("humidifier on", || commands() == [true]).await?;
    wait_until("raise notification", || subjects().len() == 1).await?;

    ctx.bus.publish_sample(humidity(52.0));
    wait_until("humidifier off", || commands() == [true, false]).await?;
    wait_until("resolve notification", || subjects().len() == 2).await?;

    let subjects = subjects();
    assert!(subjects[0].contains("humidity too_low"), "{subjects:?}");
    assert!(subjects[1].contains("back to normal"), "{subjects:?}");

    app.shutdown().await;
    // Already confirmed off: shutdown sends nothing more
    assert_eq!(*switch.commands.lock().unwrap(), [true, false]);
    Ok(())
}

#[tokio::test]
async fn restart_rehydrates_alert_and_resolves_once() -> Result<()> {
    // ---
    let store = Arc::new(SqliteStore::in_memory().await?);
    store.append(&humidity(30.0)).await?;

    let notifier = Arc::new(RecordingNotifier::default());
    let switch = Arc::new(RecordingSwitch::default());
    let collaborators = Collaborators {
        notifiers: vec![notifier.clone() as Arc<dyn Notifier>],
        switch: Some(switch.clone() as Arc<dyn PowerSwitch>),
        ..Collaborators::default()
    };
    let app = App::start(&test_config()?, store, collaborators).await?;
    let ctx = app.context();

    let restored = ctx.alerts.borrow().clone();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].status, AlertStatus::TooLow);

    let commands = || switch.commands.lock().unwrap().clone();
    let subjects = || notifier.subjects.lock().unwrap().clone();

    // The rehydrated alert asks for the humidifier without a new event
    wait_until("humidifier on", || commands() == [true]).await?;
    assert!(subjects().is_empty());

    // Still low: nothing new. Back in range: exactly one resolution.
    ctx.bus.publish_sample(humidity(31.0));
    ctx.bus.publish_sample(humidity(50.0));
    wait_until("resolve notification", || subjects().len() == 1).await?;
    wait_until("humidifier off", || commands() == [true, false]).await?;
    assert!(subjects()[0].contains("back to normal"));

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn restart_ignores_late_sample_stored_after_newer_one() -> Result<()> {
    // ---
    let store = Arc::new(SqliteStore::in_memory().await?);
    let now = Utc::now();
    // The last row is delivered late: observed before the 50% reading but
    // appended after it
    for (value, secs_ago) in [(30.0, 40), (50.0, 20), (30.0, 30)] {
        let at = now - chrono::Duration::seconds(secs_ago);
        let sample = Sample::new(Metric::Humidity, "dht22", value, at)?;
        store.append(&sample).await?;
    }

    let notifier = Arc::new(RecordingNotifier::default());
    let switch = Arc::new(RecordingSwitch::default());
    let collaborators = Collaborators {
        notifiers: vec![notifier.clone() as Arc<dyn Notifier>],
        switch: Some(switch.clone() as Arc<dyn PowerSwitch>),
        ..Collaborators::default()
    };
    let app = App::start(&test_config()?, store, collaborators).await?;
    let ctx = app.context();

    let restored = ctx.alerts.borrow().clone();
    assert_eq!(restored.len(), 1);
    assert_eq!(restored[0].status, AlertStatus::Normal);

    let board = ctx.board.borrow().clone();
    assert_eq!(board.latest.len(), 1);
    assert_eq!(board.latest[0].sample.value, 50.0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!switch.commands.lock().unwrap().contains(&true));
    assert!(notifier.subjects.lock().unwrap().is_empty());

    app.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn http_api_ingests_pico_lines_and_guards_thresholds() -> Result<()> {
    // ---
    let store = Arc::new(SqliteStore::in_memory().await?);
    let app = App::start(&test_config()?, store, Collaborators::default()).await?;

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let base = format!("http://{}", listener.local_addr()?);
    let router = routes::router(app.context());
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    let client = Client::new();

    let health: Value = client
        .get(format!("{base}/health"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(health["status"], "ok");

    // Ingestion
    let resp = client
        .post(format!("{base}/api/pico"))
        .body(r#"{"plant-1": {"percentage": 44.5, "raw": 36000}}"#)
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::ACCEPTED);

    let bad = client
        .post(format!("{base}/api/pico"))
        .body("not json")
        .send()
        .await?;
    assert_eq!(bad.status(), StatusCode::BAD_REQUEST);

    let mut latest = Value::Null;
    for _ in 0..200 {
        let resp = client
            .get(format!("{base}/api/latest?metric=moisture&source_id=plant-1"))
            .send()
            .await?;
        if resp.status() == StatusCode::OK {
            latest = resp.json().await?;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(latest["value"], 44.5);

    let stats: Value = client
        .get(format!("{base}/api/stats?metric=moisture&hours=1"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(stats["stats"]["count"], 1);

    let out_of_range = client
        .get(format!("{base}/api/series?metric=moisture&hours=0"))
        .send()
        .await?;
    assert_eq!(out_of_range.status(), StatusCode::BAD_REQUEST);

    // Thresholds: an inverted band is rejected and the old one stays live
    let mut settings: Value = client
        .get(format!("{base}/api/thresholds"))
        .send()
        .await?
        .json()
        .await?;
    settings["thresholds"]["temperature"]["min"] = json!(30.0);
    let rejected = client
        .put(format!("{base}/api/thresholds"))
        .json(&settings)
        .send()
        .await?;
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

    settings["thresholds"]["temperature"]["min"] = json!(16.0);
    let accepted = client
        .put(format!("{base}/api/thresholds"))
        .json(&settings)
        .send()
        .await?;
    assert_eq!(accepted.status(), StatusCode::OK);
    tokio_test::assert_ok!(app.context().settings.current().validate());
    let thresholds = app.context().settings.thresholds();
    assert_eq!(thresholds.temperature.min, Some(16.0));

    let status: Value = client
        .get(format!("{base}/api/status"))
        .send()
        .await?
        .json()
        .await?;
    assert!(status["latest"].as_array().is_some_and(|v| !v.is_empty()));
    assert!(status["bus"]["published"].as_u64().unwrap_or(0) >= 1);

    app.shutdown().await;
    Ok(())
}
