//! Logging Module
//!
//! Installs the process-wide tracing subscriber: a compact console layer and a
//! daily-rolling application log under `{log_dir}/{hostname}/`.

use crate::{RelayError, Result};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "media-relay.log";

/// Rolled log files older than this are removed
const LOG_RETENTION_DAYS: u64 = 30;

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_dir: PathBuf,
    pub hostname: String,
    pub log_level: String,
    pub file_logging: bool,
}

/// Logger manager for the application log
pub struct LoggerManager {
    pub config: LoggingConfig,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    /// Create a new logger manager from config module types
    pub fn from_config(config: &crate::config::LoggingConfig, hostname: String) -> Self {
        Self::new(LoggingConfig {
            log_dir: config.log_dir.clone(),
            hostname,
            log_level: config.log_level.clone(),
            file_logging: config.file_logging,
        })
    }

    /// Directory that receives this host's log files
    pub fn host_log_dir(&self) -> PathBuf {
        self.config.log_dir.join(&self.config.hostname)
    }

    /// Initialize the logging system
    pub fn initialize(&mut self) -> Result<()> {
        self.setup_application_logging()?;
        if self.config.file_logging {
            let removed = cleanup_old_logs(&self.host_log_dir(), LOG_RETENTION_DAYS)?;
            if removed > 0 {
                info!("Removed {} expired log files", removed);
            }
        }
        info!("Logging system initialized");
        Ok(())
    }

    fn setup_application_logging(&self) -> Result<()> {
        let file_layer = if self.config.file_logging {
            let host_log_dir = self.host_log_dir();
            std::fs::create_dir_all(&host_log_dir).map_err(|e| {
                RelayError::IoError(format!("Failed to create app log directory: {}", e))
            })?;

            let file_appender =
                RollingFileAppender::new(Rotation::DAILY, host_log_dir, LOG_FILE_PREFIX);
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(file_appender)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true)
                    .with_level(true)
                    .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                    .compact(),
            )
        } else {
            None
        };

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        // RUST_LOG wins over the configured level
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(()) => {
                info!(
                    "Application logging initialized for host: {}",
                    self.config.hostname
                );
                if self.config.file_logging {
                    info!("Application logs will be written to: {:?}", self.host_log_dir());
                }
            }
            Err(_) => {
                // Already initialized, likely in tests
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        Ok(())
    }
}

/// Remove files in `log_dir` not modified for `keep_days`. Returns the count.
fn cleanup_old_logs(log_dir: &Path, keep_days: u64) -> Result<usize> {
    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(keep_days * 24 * 3600))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let mut removed = 0;
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return Ok(0);
    };
    for entry in entries.flatten() {
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if !metadata.is_file() {
            continue;
        }
        match metadata.modified() {
            Ok(modified) if modified < cutoff => match std::fs::remove_file(entry.path()) {
                Ok(()) => {
                    debug!("Removed old log file: {:?}", entry.path());
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove old log file {:?}: {}", entry.path(), e),
            },
            _ => {}
        }
    }
    Ok(removed)
}
