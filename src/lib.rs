pub mod db;
pub mod delivery;
pub mod errors;
pub mod fire_time;
pub mod models;
pub mod permission;
pub mod poller;
pub mod scheduler;
pub mod service;

pub use crate::errors::{AppError, AppResult};
pub use crate::scheduler::Scheduler;
pub use crate::service::ReminderService;

use anyhow::Context;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

const DATA_DIR_ENV: &str = "REMINDERS_DATA_DIR";
const DEFAULT_DATA_DIR: &str = "reminders-data";

pub fn data_dir_from_env() -> PathBuf {
    std::env::var_os(DATA_DIR_ENV)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

pub fn init_tracing(app_data_dir: &Path) -> Result<(), String> {
    let log_dir = app_data_dir.join("logs");
    std::fs::create_dir_all(&log_dir).map_err(|error| error.to_string())?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "reminders.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| error.to_string())
}

/// Runs the reminder service until ctrl-c.
pub async fn run() -> anyhow::Result<()> {
    let app_data_dir = data_dir_from_env();
    std::fs::create_dir_all(&app_data_dir)
        .with_context(|| format!("failed to create data dir {}", app_data_dir.display()))?;
    init_tracing(&app_data_dir).map_err(anyhow::Error::msg)?;

    let service = ReminderService::new(app_data_dir).context("failed to open reminder store")?;
    service.start();

    let mut events = service.subscribe();
    let forward = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(error) => tracing::warn!(error = %error, "failed to encode scheduler event"),
            }
        }
    });

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");
    service.shutdown().await;
    forward.abort();
    Ok(())
}
