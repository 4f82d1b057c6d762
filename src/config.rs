//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! Supports YAML configuration files; later sources override earlier ones.

use crate::{CacheError, Result};
use clap::{Arg, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(expand_tilde(&s))
    }

    pub(crate) fn expand_tilde(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/") {
            if let Some(home) = std::env::var_os("HOME") {
                let mut result = PathBuf::from(home);
                result.push(rest);
                return result;
            }
        }
        PathBuf::from(path)
    }
}

/// Custom deserializer for byte sizes like "512", "100MB", "10GiB"
pub mod size_serde {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSize {
        Bytes(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawSize::deserialize(deserializer)? {
            RawSize::Bytes(n) => Ok(n),
            RawSize::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
        }
    }

    /// Parse a byte count with an optional decimal (KB, MB, GB, TB) or binary
    /// (KiB, MiB, GiB, TiB) unit. Units are case-insensitive.
    pub fn parse_size(s: &str) -> Result<u64, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty size string".to_string());
        }

        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());
        if num_end == 0 {
            return Err(format!("No number found in size string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim().to_ascii_lowercase();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let multiplier: u64 = match unit.as_str() {
            "" | "b" => 1,
            "k" | "kb" => 1_000,
            "m" | "mb" => 1_000_000,
            "g" | "gb" => 1_000_000_000,
            "t" | "tb" => 1_000_000_000_000,
            "kib" => 1 << 10,
            "mib" => 1 << 20,
            "gib" => 1 << 30,
            "tib" => 1 << 40,
            _ => return Err(format!("Unknown size unit: {}", unit)),
        };

        let bytes = value * multiplier as f64;
        if !bytes.is_finite() || bytes > u64::MAX as f64 {
            return Err(format!("Size out of range: {}", s));
        }
        Ok(bytes as u64)
    }
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Path of the JSON status page
    pub status_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            status_path: "/status".to_string(),
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(deserialize_with = "pathbuf_serde::deserialize")]
    pub dir: PathBuf,
    /// Storage budget in bytes
    #[serde(deserialize_with = "size_serde::deserialize")]
    pub max_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/cache/build-cache"),
            max_size: 10 * 1024 * 1024 * 1024, // 10 GiB
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    /// Access log file; console only when unset
    pub access_log_file: Option<PathBuf>,
    /// Error log file; console only when unset
    pub error_log_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            access_log_file: None,
            error_log_file: None,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration: defaults, then the YAML file given by `--config`,
    /// then environment variables, then command-line arguments.
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();
        Self::from_matches(&matches)
    }

    /// Same as [`Config::load`] but with explicit arguments.
    pub fn load_from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Self::build_cli()
            .try_get_matches_from(args)
            .map_err(|e| CacheError::ConfigError(e.to_string()))?;
        Self::from_matches(&matches)
    }

    fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config = Self::default();

        if let Some(config_path) = matches.get_one::<String>("config") {
            config = Self::load_from_file(config_path)?;
        }

        config.apply_env_overrides()?;
        config.apply_cli_overrides(matches)?;
        config.validate()?;

        Ok(config)
    }

    /// Build CLI argument parser
    fn build_cli() -> Command {
        Command::new("build-cache")
            .version(env!("CARGO_PKG_VERSION"))
            .about("HTTP cache server for remote build artifacts")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("dir")
                    .long("dir")
                    .value_name("DIR")
                    .help("Cache directory path"),
            )
            .arg(
                Arg::new("max-size")
                    .long("max-size")
                    .value_name("SIZE")
                    .help("Maximum cache size, e.g. 10GiB (default: 10GiB)"),
            )
            .arg(
                Arg::new("host")
                    .long("host")
                    .value_name("ADDRESS")
                    .help("Listen address (default: 0.0.0.0)"),
            )
            .arg(
                Arg::new("port")
                    .short('p')
                    .long("port")
                    .value_name("PORT")
                    .help("HTTP port (default: 8080)"),
            )
            .arg(
                Arg::new("status-path")
                    .long("status-path")
                    .value_name("PATH")
                    .help("Status page path (default: /status)"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level, overridden by RUST_LOG (default: info)"),
            )
            .arg(
                Arg::new("access-log-file")
                    .long("access-log-file")
                    .value_name("FILE")
                    .help("Write access log lines to this file"),
            )
            .arg(
                Arg::new("error-log-file")
                    .long("error-log-file")
                    .value_name("FILE")
                    .help("Write unexpected server errors to this file"),
            )
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            CacheError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_cli_overrides(&mut self, matches: &ArgMatches) -> Result<()> {
        self.apply_overrides(|key| {
            let arg = match key {
                "CACHE_DIR" => "dir",
                "CACHE_MAX_SIZE" => "max-size",
                "HTTP_HOST" => "host",
                "HTTP_PORT" => "port",
                "STATUS_PATH" => "status-path",
                "LOG_LEVEL" => "log-level",
                "ACCESS_LOG_FILE" => "access-log-file",
                "ERROR_LOG_FILE" => "error-log-file",
                _ => return None,
            };
            matches.get_one::<String>(arg).cloned()
        })
    }

    /// Apply overrides from a key lookup. Keys are the environment variable
    /// names; the CLI maps its flags onto the same keys.
    fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("CACHE_DIR") {
            self.cache.dir = pathbuf_serde::expand_tilde(&dir);
        }

        if let Some(size) = lookup("CACHE_MAX_SIZE") {
            self.cache.max_size = size_serde::parse_size(&size)
                .map_err(|e| CacheError::ConfigError(format!("Invalid max size: {}", e)))?;
        }

        if let Some(host) = lookup("HTTP_HOST") {
            self.server.host = host;
        }

        if let Some(port) = lookup("HTTP_PORT") {
            self.server.port = port.parse().map_err(|e| {
                CacheError::ConfigError(format!("Invalid port '{}': {}", port, e))
            })?;
        }

        if let Some(status_path) = lookup("STATUS_PATH") {
            self.server.status_path = status_path;
        }

        if let Some(log_level) = lookup("LOG_LEVEL") {
            self.logging.log_level = log_level;
        }

        if let Some(path) = lookup("ACCESS_LOG_FILE") {
            self.logging.access_log_file = Some(pathbuf_serde::expand_tilde(&path));
        }

        if let Some(path) = lookup("ERROR_LOG_FILE") {
            self.logging.error_log_file = Some(pathbuf_serde::expand_tilde(&path));
        }

        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_size == 0 {
            return Err(CacheError::ConfigError(
                "Maximum cache size must be greater than zero".to_string(),
            ));
        }

        if self.cache.dir.as_os_str().is_empty() {
            return Err(CacheError::ConfigError(
                "Cache directory cannot be empty".to_string(),
            ));
        }

        if self.server.host.parse::<std::net::IpAddr>().is_err() {
            return Err(CacheError::ConfigError(format!(
                "Listen address must be an IP address, got '{}'",
                self.server.host
            )));
        }

        let status_path = &self.server.status_path;
        if !status_path.starts_with('/') {
            return Err(CacheError::ConfigError(format!(
                "Status path must start with '/', got '{}'",
                status_path
            )));
        }
        if status_path.contains("/ac/") || status_path.contains("/cas/") {
            return Err(CacheError::ConfigError(format!(
                "Status path '{}' overlaps the cache key namespace",
                status_path
            )));
        }

        Ok(())
    }
}
