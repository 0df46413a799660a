// Tracing subscriber installation

use crate::config::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "meshlink.log";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive, e.g. `info` or `meshlink_core::delivery=debug`
    pub level: String,
    /// Emit JSON lines instead of human-readable text
    pub json: bool,
    /// Also write daily-rotated files here
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

impl LoggingConfig {
    /// `RUST_LOG` wins over the configured level
    pub fn env_filter(&self) -> Result<EnvFilter, ConfigError> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => EnvFilter::try_new(&self.level)
                .map_err(|e| ConfigError::LogFilter(format!("{}: {}", self.level, e))),
        }
    }
}

/// Install the global subscriber.
///
/// When a log directory is configured the returned guard must be kept alive
/// for buffered lines to reach the file. If a subscriber is already
/// installed this is a no-op.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    let filter = config.env_filter()?;

    let (installed, guard) = match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let builder = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer);
            let installed = if config.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            (installed, Some(guard))
        }
        None => {
            let builder = tracing_subscriber::fmt().with_env_filter(filter);
            let installed = if config.json {
                builder.json().try_init()
            } else {
                builder.try_init()
            };
            (installed, None)
        }
    };

    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
    Ok(guard)
}
