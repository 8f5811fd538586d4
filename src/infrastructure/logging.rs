use crate::infrastructure::error::InfraError;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

pub const LOG_FILE_NAME: &str = "daytrack.log";
const DEFAULT_FILTER: &str = "info";

pub fn log_file_path(logs_dir: &Path) -> PathBuf {
    logs_dir.join(LOG_FILE_NAME)
}

/// Installs the global JSON-lines subscriber writing to `logs/daytrack.log`.
/// `RUST_LOG` overrides the default `info` filter. Fails if a global
/// subscriber is already set.
pub fn init_logging(logs_dir: &Path) -> Result<(), InfraError> {
    fs::create_dir_all(logs_dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file_path(logs_dir))?;
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .with_writer(Mutex::new(file))
        .try_init()
        .map_err(|error| InfraError::Logging(error.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_log_file_and_refuses_second_install() {
        let logs_dir = std::env::temp_dir().join(format!(
            "daytrack-logging-tests-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&logs_dir);

        let first = init_logging(&logs_dir);
        assert!(log_file_path(&logs_dir).exists());
        if first.is_ok() {
            tracing::info!(command = "logging_test", "hello");
            assert!(matches!(
                init_logging(&logs_dir),
                Err(InfraError::Logging(_))
            ));
        }

        let _ = fs::remove_dir_all(&logs_dir);
    }
}
