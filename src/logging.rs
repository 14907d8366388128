//! Logging module for the adc-batteryd daemon.
//!
//! This module configures tracing with JSON format output to both stderr
//! and a rotating log file at ~/.local/share/adc-batteryd/daemon.log.

use std::path::PathBuf;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, time::UtcTime},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

/// Default log directory relative to user's home
const LOG_DIR: &str = ".local/share/adc-batteryd";
/// Maximum number of log files to retain
const MAX_LOG_FILES: usize = 3;

/// Initialize the logging system with both stderr and file output.
///
/// Logs are written in JSON format to:
/// - stderr for immediate visibility
/// - ~/.local/share/adc-batteryd/daemon.log with rotation
///
/// Log rotation occurs daily, retaining the last 3 files.
pub fn init_logging() -> Result<LogGuard, LoggingError> {
    let log_dir = get_log_directory()?;

    // Ensure log directory exists
    std::fs::create_dir_all(&log_dir).map_err(|e| LoggingError::DirectoryCreationFailed {
        path: log_dir.display().to_string(),
        source: e,
    })?;

    // Create rolling file appender (rotates daily, keeps MAX_LOG_FILES)
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(MAX_LOG_FILES)
        .filename_prefix("daemon")
        .filename_suffix("log")
        .build(&log_dir)
        .map_err(|e| LoggingError::AppenderCreationFailed(e.to_string()))?;

    // Create non-blocking writer for file output
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    // Create non-blocking writer for stderr
    let (non_blocking_stderr, stderr_guard) = tracing_appender::non_blocking(std::io::stderr());

    // Environment filter for log level control
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // JSON layer for file output
    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(non_blocking_file);

    // JSON layer for stderr, for consistency with the file output
    let stderr_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_span_events(FmtSpan::CLOSE)
        .with_current_span(true)
        .with_writer(non_blocking_stderr);

    // Initialize the subscriber with both layers
    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(LogGuard {
        _file_guard: file_guard,
        _stderr_guard: stderr_guard,
    })
}

/// Get the log directory path, expanding ~ to user's home directory.
fn get_log_directory() -> Result<PathBuf, LoggingError> {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .map_err(|_| LoggingError::HomeDirectoryNotFound)?;

    Ok(PathBuf::from(home).join(LOG_DIR))
}

/// Guard that keeps the non-blocking writers alive.
/// Must be held for the lifetime of the application.
pub struct LogGuard {
    _file_guard: tracing_appender::non_blocking::WorkerGuard,
    _stderr_guard: tracing_appender::non_blocking::WorkerGuard,
}

/// Errors related to logging initialization.
#[derive(Debug)]
pub enum LoggingError {
    /// Home directory environment variable not found
    HomeDirectoryNotFound,
    /// Failed to create log directory
    DirectoryCreationFailed {
        path: String,
        source: std::io::Error,
    },
    /// Failed to create file appender
    AppenderCreationFailed(String),
}

impl std::fmt::Display for LoggingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoggingError::HomeDirectoryNotFound => {
                write!(
                    f,
                    "Could not determine home directory (HOME or USERPROFILE not set)"
                )
            }
            LoggingError::DirectoryCreationFailed { path, source } => {
                write!(f, "Failed to create log directory '{}': {}", path, source)
            }
            LoggingError::AppenderCreationFailed(msg) => {
                write!(f, "Failed to create log file appender: {}", msg)
            }
        }
    }
}

impl std::error::Error for LoggingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LoggingError::DirectoryCreationFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}
