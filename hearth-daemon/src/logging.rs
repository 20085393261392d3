//! Tracing setup for the service process.
//!
//! Human-readable output goes to the service log file when one is given,
//! otherwise to stderr, filtered by `RUST_LOG` (default `info`). With a
//! trace path, every span and event at any level is also written there as
//! JSON lines.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::error::{io_err, DaemonError};

/// Install the global subscriber. A second call is a no-op.
pub fn init_tracing(log_file: Option<&Path>, trace_file: Option<&Path>) -> Result<(), DaemonError> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = match log_file {
        Some(path) => Some(
            fmt::layer()
                .with_writer(Mutex::new(open_append(path)?))
                .with_ansi(false)
                .with_target(false)
                .with_filter(filter()),
        ),
        None => None,
    };
    let stderr_layer = log_file.is_none().then(|| {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(filter())
    });
    let trace_layer = match trace_file {
        Some(path) => {
            let file = File::create(path).map_err(|e| io_err(path, e))?;
            Some(
                fmt::layer()
                    .json()
                    .with_writer(Mutex::new(file))
                    .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
                    .with_filter(LevelFilter::TRACE),
            )
        }
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(trace_layer)
        .try_init();
    Ok(())
}

fn open_append(path: &Path) -> Result<File, DaemonError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| io_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_log_directory_and_tolerates_reinit() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("logs").join("service.log");
        init_tracing(Some(&log), None).unwrap();
        init_tracing(Some(&log), None).unwrap();
        assert!(log.exists());
    }
}
