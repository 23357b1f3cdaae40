//! Entry point of the `garden-monitor` appliance.
//!
//! Startup sequence:
//! - Load `.env` and initialize structured logging/tracing
//! - Load and log the configuration
//! - Open the SQLite reading store (creating the schema if needed)
//! - Start the pipeline: sources, alert engine, notifier, humidifier, board
//! - Serve the HTTP API until SIGINT/SIGTERM, then shut the pipeline down
//!
//! # Environment Variables
//! See [`garden_monitor::config::load_from_env`]. Logging is controlled by
//! `RUST_LOG` or `APP_LOG_LEVEL` (default: `info`), `APP_SPAN_EVENTS` and
//! `FORCE_COLOR`.
use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use garden_monitor::store::SqliteStore;
use garden_monitor::{config, routes, shutdown, App, Collaborators};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    dotenv().ok();
    init_tracing();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    tracing::info!("Opening reading store: {}", cfg.db_url);
    let store = SqliteStore::connect(&cfg.db_url, cfg.db_pool_max)
        .await
        .with_context(|| format!("Failed to open reading store '{}'", cfg.db_url))?;
    tracing::info!("Reading store ready");

    let collaborators = Collaborators::from_config(&cfg)?;
    let app = App::start(&cfg, Arc::new(store), collaborators).await?;

    let router = routes::router(app.context());
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!("Listening on {}", addr);

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown::signal())
        .await;

    app.shutdown().await;
    served?;
    Ok(())
}

// ---

/// Initialize the global tracing subscriber.
///
/// - Target, file and line number are printed
/// - Colors: `FORCE_COLOR=1|true|yes` forces them on, `0|false|no` off,
///   anything else auto-detects a TTY
/// - `APP_SPAN_EVENTS`: `"full"` (enter, exit, close), `"enter_exit"`, or
///   close events only (default)
/// - Level from `RUST_LOG`, falling back to `APP_LOG_LEVEL`
fn init_tracing() {
    // ---
    let span_events = match env::var("APP_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("APP_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn,lettre=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
