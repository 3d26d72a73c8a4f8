use anyhow::{Context, Result};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{Builder, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use dbconn_core::Settings;

/// Audit files are `dbconn.<date>.log`, one per day.
pub const LOG_PREFIX: &str = "dbconn";
pub const LOG_SUFFIX: &str = "log";
/// Days of audit log kept; older files are deleted on rollover.
pub const MAX_LOG_FILES: usize = 7;

fn stderr_filter(verbose: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        })
    })
}

/// Daily-rolling appender under `<root>/logs`, written from a background worker.
/// The guard flushes pending lines when dropped.
fn audit_writer(settings: &Settings) -> Result<(NonBlocking, WorkerGuard)> {
    let dir = settings.log_dir();
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;
    let appender = Builder::new()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_PREFIX)
        .filename_suffix(LOG_SUFFIX)
        .max_log_files(MAX_LOG_FILES)
        .build(&dir)
        .with_context(|| format!("opening audit log in {}", dir.display()))?;
    Ok(tracing_appender::non_blocking(appender))
}

/// Stderr gets `RUST_LOG` (default `warn`); the audit log under the config
/// root gets `settings.log_level` without ANSI colors. A log directory that
/// cannot be opened is reported and skipped.
///
/// Keep the returned guard alive until exit.
pub fn init(settings: &Settings, verbose: u8) -> Option<WorkerGuard> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter(verbose));

    let (file_layer, guard, file_error) = match audit_writer(settings) {
        Ok((writer, guard)) => {
            let filter = EnvFilter::try_new(&settings.log_level)
                .unwrap_or_else(|_| EnvFilter::new("info"));
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_filter(filter);
            (Some(layer), Some(guard), None)
        }
        Err(e) => (None, None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    if let Some(e) = file_error {
        tracing::warn!(error = %format!("{:#}", e), "Audit log disabled");
    }
    guard
}
