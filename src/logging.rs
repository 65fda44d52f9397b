use std::path::PathBuf;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::DispatchError;

const DEFAULT_LOG_FILTER: &str = "info";
const LOG_FILE_PREFIX: &str = "dispatch_logs";

pub struct FileLogger {
    log_directory: PathBuf,
    rotation: Rotation,
}

impl FileLogger {
    pub fn new(log_directory: PathBuf) -> Self {
        Self {
            log_directory,
            rotation: Rotation::DAILY,
        }
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn setup_file_logging(&self) -> Result<(NonBlocking, WorkerGuard), DispatchError> {
        // Ensure log directory exists
        std::fs::create_dir_all(&self.log_directory).map_err(|e| {
            DispatchError::ConfigError(format!(
                "Failed to create log directory {:?}: {}",
                self.log_directory, e
            ))
        })?;

        let file_appender =
            RollingFileAppender::new(self.rotation.clone(), &self.log_directory, LOG_FILE_PREFIX);

        Ok(tracing_appender::non_blocking(file_appender))
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Installs the global subscriber: console output, plus rolling files when a
/// `FileLogger` is given. Keep the returned guard alive to flush file output.
pub fn setup_logging(
    file_logger: Option<&FileLogger>,
) -> Result<Option<WorkerGuard>, DispatchError> {
    let registry = tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer()); // Console output

    match file_logger {
        Some(file_logger) => {
            let (file_writer, guard) = file_logger.setup_file_logging()?;
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_writer)
                        .with_ansi(false), // Disable ANSI colors for file logs
                )
                .init();
            Ok(Some(guard))
        }
        None => {
            registry.init();
            Ok(None)
        }
    }
}
