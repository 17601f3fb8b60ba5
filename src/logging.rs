//! Log setup for the coordinator binary.
//!
//! Records go to the systemd journal when it is reachable and to a daily
//! rolling file otherwise. Warnings and errors are also echoed to stderr so
//! a failing `bootstrap` or `upgrade` is visible from the terminal.

use anyhow::Result;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable holding the log filter, e.g. `VECDB_LOG=debug`.
pub const LOG_ENV: &str = "VECDB_LOG";

const LOG_FILE: &str = "vecdb-coordinator.log";

// Flushes the file writer on drop, so it lives for the rest of the process.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Install the global subscriber.
///
/// `VECDB_LOG` takes an `EnvFilter` directive; `debug` also shows advisory
/// lock traffic. The default is `info`. Without journald, logs are written
/// under `log_dir`, or [`default_log_dir`] when none is given.
pub fn init(log_dir: Option<PathBuf>) -> Result<()> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(journald) = tracing_journald::layer() {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(journald)
                .with(stderr_layer())
                .try_init()?;
            tracing::debug!("Logging to journald");
            return Ok(());
        }
    }

    let log_dir = log_dir.unwrap_or_else(default_log_dir);
    std::fs::create_dir_all(&log_dir)?;
    let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, LOG_FILE));
    let _ = FILE_GUARD.set(guard);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .with(stderr_layer())
        .try_init()?;
    tracing::debug!(directory = %log_dir.display(), "Logging to file");
    Ok(())
}

pub fn default_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("vecdb-coordinator")
        .join("logs")
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

fn stderr_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fmt::layer()
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .with_filter(LevelFilter::WARN)
}
