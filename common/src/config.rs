use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Path of the server's JSON status endpoint.
pub const STATUS_PATH: &str = "/status";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    pub streams: Vec<StreamConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Delay before reconnecting after a transient upstream failure.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// How many consecutive unexpected (non-200, non-503) statuses are
    /// retried before the connector gives up.
    #[serde(default)]
    pub status_retries: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// One upstream MJPEG source served under `path`.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub path: String,
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Seconds without client requests before the upstream is closed.
    /// Zero keeps the connection open forever once opened.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Serve `Last-Modified` and honour `If-Modified-Since` instead of
    /// sending no-cache headers.
    #[serde(default)]
    pub conditional_get: bool,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            backoff_ms: default_backoff_ms(),
            status_retries: 0,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl StreamConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.streams.is_empty() {
            return Err(ConfigError::Invalid("no [[streams]] configured".into()));
        }
        let mut seen = HashSet::new();
        for stream in &self.streams {
            if !stream.path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "stream path {:?} must start with '/'",
                    stream.path
                )));
            }
            if stream.path == STATUS_PATH {
                return Err(ConfigError::Invalid(format!(
                    "stream path {STATUS_PATH} is reserved for the status endpoint"
                )));
            }
            if stream.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "stream {} has an empty url",
                    stream.path
                )));
            }
            if !seen.insert(stream.path.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "stream path {} is configured twice",
                    stream.path
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_listen() -> String {
    "0.0.0.0:8080".into()
}
fn default_backoff_ms() -> u64 {
    2000
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_idle_timeout() -> u64 {
    30
}
fn default_max_frame_bytes() -> usize {
    625_000
}
fn default_log_level() -> String {
    "info".into()
}
