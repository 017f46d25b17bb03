use color_eyre::eyre::{
    Result,
    WrapErr,
};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub mod backend;
pub mod cache;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod ledger;
pub mod matches;
pub mod session;
pub mod test_helpers;
pub mod types;
pub mod ui;

pub use error::{
    Error,
    ValidationError,
};

const LOG_FILE_PREFIX: &str = "wager-client.log";

/// Routes `tracing` output to a daily rolling file under `log_dir`, keeping
/// the terminal free for the UI. Keep the returned guard alive until exit.
pub fn init_tracing(log_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)
        .wrap_err_with(|| format!("Failed to create log directory {}", log_dir.display()))?;
    let appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    Ok(guard)
}
