//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! Layers apply in order: defaults, YAML file, environment, command line.

use crate::{RelayError, Result};
use clap::{Arg, ArgAction, Command};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info};

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

    pub(super) fn expand_tilde(path: &str) -> PathBuf {
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

/// Custom deserializer for Duration from string format like "30s", "5m", "1h"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        // Find where the number ends and the unit begins
        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "d" | "day" | "days" => Duration::from_secs_f64(value * 86400.0),
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            "" => Duration::from_secs_f64(value), // Default to seconds if no unit
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// Main relay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub admission: AdmissionConfig,
    pub upstream: UpstreamConfig,
    pub catalog: CatalogConfig,
    pub logging: LoggingConfig,
}

/// HTTP front end configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub http_port: u16,
    /// Grace period for in-flight work once shutdown starts
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            http_port: 8080,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Disk cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(deserialize_with = "pathbuf_serde::deserialize")]
    pub cache_dir: PathBuf,
    /// Bytes per chunk, for remote reads and cache reads alike
    pub chunk_size: usize,
    /// Cache budget in bytes; objects of half this size or more are not cached
    pub max_cache_size: u64,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub cleanup_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache"),
            chunk_size: 1024 * 1024,
            max_cache_size: 5 * 1024 * 1024 * 1024,
            cleanup_interval: Duration::from_secs(3600),
        }
    }
}

/// Remote fetch admission configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    pub max_concurrent_fetches: usize,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub min_fetch_interval: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 3,
            min_fetch_interval: Duration::from_secs(1),
        }
    }
}

/// HTTP upstream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub base_url: String,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub request_timeout: Duration,
    /// Longest wait for a single chunk once streaming started
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub chunk_timeout: Duration,
    #[serde(deserialize_with = "duration_serde::deserialize")]
    pub pool_idle_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:9000".to_string(),
            request_timeout: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(60),
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Catalog snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    #[serde(deserialize_with = "pathbuf_serde::deserialize")]
    pub path: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./catalog.json"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: String,
    #[serde(deserialize_with = "pathbuf_serde::deserialize")]
    pub log_dir: PathBuf,
    pub file_logging: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: PathBuf::from("./logs"),
            file_logging: true,
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and command line
    pub fn load() -> Result<Self> {
        let matches = Self::build_cli().get_matches();

        let mut config = Self::default();

        // Load from config file if specified
        if let Some(config_path) = matches.get_one::<String>("config") {
            config = Self::load_from_file(config_path)?;
        }

        // Override with environment variables
        config.apply_env_overrides()?;

        // Override with command line arguments
        config.apply_cli_overrides(&matches)?;

        config.validate()?;

        info!(
            "Cache: dir={:?}, max_size={} bytes, chunk_size={} bytes, cleanup_interval={}s",
            config.cache.cache_dir,
            config.cache.max_cache_size,
            config.cache.chunk_size,
            config.cache.cleanup_interval.as_secs()
        );
        info!(
            "Admission: max_concurrent_fetches={}, min_fetch_interval={:?}",
            config.admission.max_concurrent_fetches, config.admission.min_fetch_interval
        );
        info!(
            "Upstream: base_url={}, request_timeout={}s, chunk_timeout={}s",
            config.upstream.base_url,
            config.upstream.request_timeout.as_secs(),
            config.upstream.chunk_timeout.as_secs()
        );

        info!("Configuration loaded successfully");
        debug!("Configuration: {:?}", config);

        Ok(config)
    }

    /// Build CLI argument parser
    pub fn build_cli() -> Command {
        Command::new("media-relay")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Streaming media relay with a size-bounded disk cache")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("http-port")
                    .long("http-port")
                    .value_name("PORT")
                    .help("HTTP port (default: 8080)"),
            )
            .arg(
                Arg::new("cache-dir")
                    .long("cache-dir")
                    .value_name("DIR")
                    .help("Cache directory"),
            )
            .arg(
                Arg::new("max-cache-size")
                    .long("max-cache-size")
                    .value_name("BYTES")
                    .help("Cache budget in bytes (default: 5 GiB)"),
            )
            .arg(
                Arg::new("max-concurrent-fetches")
                    .long("max-concurrent-fetches")
                    .value_name("N")
                    .help("Concurrent remote fetches (default: 3)"),
            )
            .arg(
                Arg::new("min-fetch-interval")
                    .long("min-fetch-interval")
                    .value_name("DURATION")
                    .help("Minimum spacing between remote fetch starts (default: 1s)"),
            )
            .arg(
                Arg::new("upstream-url")
                    .long("upstream-url")
                    .value_name("URL")
                    .help("Base URL of the media upstream"),
            )
            .arg(
                Arg::new("catalog")
                    .long("catalog")
                    .value_name("FILE")
                    .help("Catalog snapshot path"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (default: info)"),
            )
            .arg(
                Arg::new("no-file-logging")
                    .long("no-file-logging")
                    .action(ArgAction::SetTrue)
                    .help("Log to the console only"),
            )
    }

    /// Load configuration from YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RelayError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            RelayError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from a variable lookup, failing on unparsable values
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("CACHE_DIR") {
            self.cache.cache_dir = pathbuf_serde::expand_tilde(&value);
        }
        if let Some(value) = lookup("CHUNK_SIZE") {
            self.cache.chunk_size = parse_number("CHUNK_SIZE", &value)?;
        }
        if let Some(value) = lookup("MAX_CACHE_SIZE") {
            self.cache.max_cache_size = parse_number("MAX_CACHE_SIZE", &value)?;
        }
        if let Some(value) = lookup("CACHE_CLEANUP_INTERVAL") {
            self.cache.cleanup_interval = parse_duration_var("CACHE_CLEANUP_INTERVAL", &value)?;
        }
        if let Some(value) = lookup("MAX_CONCURRENT_DOWNLOADS") {
            self.admission.max_concurrent_fetches =
                parse_number("MAX_CONCURRENT_DOWNLOADS", &value)?;
        }
        if let Some(value) = lookup("RATE_LIMIT_DELAY") {
            self.admission.min_fetch_interval = parse_duration_var("RATE_LIMIT_DELAY", &value)?;
        }
        if let Some(value) = lookup("HTTP_PORT") {
            self.server.http_port = parse_number("HTTP_PORT", &value)?;
        }
        if let Some(value) = lookup("UPSTREAM_URL") {
            self.upstream.base_url = value;
        }
        if let Some(value) = lookup("CATALOG_PATH") {
            self.catalog.path = pathbuf_serde::expand_tilde(&value);
        }
        if let Some(value) = lookup("LOG_LEVEL") {
            self.logging.log_level = value;
        }
        if let Some(value) = lookup("LOG_DIR") {
            self.logging.log_dir = pathbuf_serde::expand_tilde(&value);
        }
        Ok(())
    }

    fn apply_cli_overrides(&mut self, matches: &clap::ArgMatches) -> Result<()> {
        if let Some(port) = matches.get_one::<String>("http-port") {
            self.server.http_port = parse_number("--http-port", port)?;
        }
        if let Some(cache_dir) = matches.get_one::<String>("cache-dir") {
            self.cache.cache_dir = pathbuf_serde::expand_tilde(cache_dir);
        }
        if let Some(size) = matches.get_one::<String>("max-cache-size") {
            self.cache.max_cache_size = parse_number("--max-cache-size", size)?;
        }
        if let Some(max) = matches.get_one::<String>("max-concurrent-fetches") {
            self.admission.max_concurrent_fetches = parse_number("--max-concurrent-fetches", max)?;
        }
        if let Some(interval) = matches.get_one::<String>("min-fetch-interval") {
            self.admission.min_fetch_interval =
                parse_duration_var("--min-fetch-interval", interval)?;
        }
        if let Some(url) = matches.get_one::<String>("upstream-url") {
            self.upstream.base_url = url.clone();
        }
        if let Some(catalog) = matches.get_one::<String>("catalog") {
            self.catalog.path = pathbuf_serde::expand_tilde(catalog);
        }
        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }
        if matches.get_flag("no-file-logging") {
            self.logging.file_logging = false;
        }
        Ok(())
    }

    /// Reject settings the relay cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.cache.chunk_size == 0 {
            return Err(RelayError::ConfigError(
                "cache.chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.cache.max_cache_size == 0 {
            return Err(RelayError::ConfigError(
                "cache.max_cache_size must be greater than zero".to_string(),
            ));
        }
        if self.cache.cleanup_interval.is_zero() {
            return Err(RelayError::ConfigError(
                "cache.cleanup_interval must be greater than zero".to_string(),
            ));
        }
        if self.admission.max_concurrent_fetches == 0 {
            return Err(RelayError::ConfigError(
                "admission.max_concurrent_fetches must be at least 1".to_string(),
            ));
        }
        if self.upstream.base_url.trim().is_empty() {
            return Err(RelayError::ConfigError(
                "upstream.base_url must not be empty".to_string(),
            ));
        }
        if self.upstream.chunk_timeout.is_zero() {
            return Err(RelayError::ConfigError(
                "upstream.chunk_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_number<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| RelayError::ConfigError(format!("Invalid value '{}' for {}: {}", value, name, e)))
}

fn parse_duration_var(name: &str, value: &str) -> Result<Duration> {
    duration_serde::parse_duration(value)
        .map_err(|e| RelayError::ConfigError(format!("Invalid duration for {}: {}", name, e)))
}
