//! Logging Module
//!
//! Sets up application logging with `tracing` and provides the access log and
//! error log used by the request handler. Access and error lines are ordinary
//! tracing events with dedicated targets, so they can be routed to their own
//! files while still appearing on the console.

use crate::config::LoggingConfig;
use crate::{CacheError, Result};
use std::path::Path;
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Target of access log events, one per request.
pub const ACCESS_LOG_TARGET: &str = "access_log";
/// Target of unexpected server errors.
pub const ERROR_LOG_TARGET: &str = "error_log";

/// One access log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogEntry {
    pub method: String,
    pub status: u16,
    /// Host portion of the remote address
    pub client: String,
    pub path: String,
}

impl AccessLogEntry {
    pub fn new(method: &str, status: u16, remote_addr: &str, path: &str) -> Self {
        Self {
            method: method.to_string(),
            status,
            client: client_host(remote_addr).to_string(),
            path: path.to_string(),
        }
    }

    /// `METHOD STATUS CLIENT PATH`, padded for column alignment.
    pub fn format_line(&self) -> String {
        format!(
            "{:>4} {} {:>15} {}",
            self.method, self.status, self.client, self.path
        )
    }

    /// Emit the entry on the access log.
    pub fn log(&self) {
        info!(target: ACCESS_LOG_TARGET, "{}", self.format_line());
    }
}

/// Host portion of a `host:port` address, or the input unchanged when it
/// cannot be split.
pub fn client_host(remote_addr: &str) -> &str {
    if let Some(rest) = remote_addr.strip_prefix('[') {
        // [v6]:port
        if let Some((host, port)) = rest.split_once("]:") {
            if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) {
                return host;
            }
        }
        return remote_addr;
    }
    match remote_addr.rsplit_once(':') {
        Some((host, port))
            if !host.is_empty()
                && !host.contains(':')
                && !port.is_empty()
                && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            host
        }
        _ => remote_addr,
    }
}

/// Logger manager for application, access and error logs
pub struct LoggerManager {
    pub config: LoggingConfig,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self { config }
    }

    /// Install the global tracing subscriber.
    ///
    /// The console receives everything allowed by `RUST_LOG` (or the
    /// configured level) plus all access lines. Optional access and error
    /// log files receive only their own targets.
    pub fn initialize(&mut self) -> Result<()> {
        let console_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{},{}=info",
                self.config.log_level, ACCESS_LOG_TARGET
            ))
        });

        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact()
            .with_filter(console_filter);

        let access_layer = match &self.config.access_log_file {
            Some(path) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Self::file_appender(path)?)
                    .with_ansi(false)
                    .with_target(false)
                    .with_level(false)
                    .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                    .compact()
                    .with_filter(
                        Targets::new().with_target(ACCESS_LOG_TARGET, LevelFilter::INFO),
                    ),
            ),
            None => None,
        };

        let error_layer = match &self.config.error_log_file {
            Some(path) => Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Self::file_appender(path)?)
                    .with_ansi(false)
                    .with_target(false)
                    .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                    .compact()
                    .with_filter(Targets::new().with_target(ERROR_LOG_TARGET, LevelFilter::TRACE)),
            ),
            None => None,
        };

        // Don't fail if a subscriber is already set (tests)
        match tracing_subscriber::registry()
            .with(console_layer)
            .with(access_layer)
            .with(error_layer)
            .try_init()
        {
            Ok(()) => info!("Logging system initialized"),
            Err(_) => debug!("Tracing subscriber already initialized, skipping"),
        }

        Ok(())
    }

    /// Daily-rotated appender for `path` (`<path>.YYYY-MM-DD`).
    fn file_appender(path: &Path) -> Result<RollingFileAppender> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let file_name = path.file_name().ok_or_else(|| {
            CacheError::ConfigError(format!("Log file path {:?} has no file name", path))
        })?;

        std::fs::create_dir_all(dir).map_err(|e| {
            CacheError::IoError(format!("Failed to create log directory {:?}: {}", dir, e))
        })?;

        Ok(RollingFileAppender::new(Rotation::DAILY, dir, file_name))
    }
}
