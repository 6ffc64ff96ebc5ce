//! Configuration management for key provisioning components

use crate::{
    record::{RetentionPolicy, MAX_RETENTION_TTL_SECS},
    Error, Result,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Key provisioning context configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ContextConfig {
    /// Flat key file, one token per line, appended to by the QKD device
    pub source_path: PathBuf,

    /// Maximum number of tokens held in memory ahead of dispensing
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// How long `start` waits for the first token (milliseconds)
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// Loader sleep when the source has no new complete line (milliseconds)
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,

    /// Upper bound on waiting for the loader to exit (milliseconds)
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// Keep at most this many served records (unbounded if unset)
    #[serde(default)]
    pub retention_max_records: Option<usize>,

    /// Forget served records older than this (never if unset)
    #[serde(default)]
    pub retention_ttl_secs: Option<u64>,
}

impl ContextConfig {
    /// Configuration with defaults for everything but the source path
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            buffer_capacity: default_buffer_capacity(),
            startup_timeout_ms: default_startup_timeout_ms(),
            idle_backoff_ms: default_idle_backoff_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            retention_max_records: None,
            retention_ttl_secs: None,
        }
    }

    /// Parse a YAML document holding only context settings
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.source_path.as_os_str().is_empty() {
            return Err(Error::Config("source_path cannot be empty".to_string()));
        }

        if self.buffer_capacity == 0 {
            return Err(Error::Config("buffer_capacity must be > 0".to_string()));
        }

        if self.startup_timeout_ms == 0 {
            return Err(Error::Config("startup_timeout_ms must be > 0".to_string()));
        }

        if self.idle_backoff_ms == 0 {
            return Err(Error::Config("idle_backoff_ms must be > 0".to_string()));
        }

        if self.stop_timeout_ms == 0 {
            return Err(Error::Config("stop_timeout_ms must be > 0".to_string()));
        }

        if self.retention_max_records == Some(0) {
            return Err(Error::Config(
                "retention_max_records must be > 0 when set".to_string(),
            ));
        }

        if let Some(ttl) = self.retention_ttl_secs {
            if ttl == 0 || ttl > MAX_RETENTION_TTL_SECS {
                return Err(Error::Config(format!(
                    "retention_ttl_secs must be between 1 and {} when set",
                    MAX_RETENTION_TTL_SECS
                )));
            }
        }

        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_records: self.retention_max_records,
            ttl_secs: self.retention_ttl_secs,
        }
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self::new(default_source_path())
    }
}

/// Key Gateway configuration
///
/// Kept flat so the same struct loads from a YAML file or from `QKEY_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Bind address for HTTP server
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Directory of static web assets served under `/` (disabled if unset)
    #[serde(default = "default_static_dir")]
    pub static_dir: Option<PathBuf>,

    /// Raw device log to chunk into `source_path` before starting
    #[serde(default)]
    pub keylog_input: Option<PathBuf>,

    /// Characters per key when chunking the device log
    #[serde(default = "default_chunk_width")]
    pub chunk_width: usize,

    #[serde(default = "default_source_path")]
    pub source_path: PathBuf,

    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,

    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    #[serde(default)]
    pub retention_max_records: Option<usize>,

    #[serde(default)]
    pub retention_ttl_secs: Option<u64>,
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let config: Self = envy::prefixed("QKEY_").from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML, TOML or JSON file (by extension)
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let config: Self = config::Config::builder()
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.chunk_width == 0 {
            return Err(Error::Config("chunk_width must be > 0".to_string()));
        }

        if let Some(input) = &self.keylog_input {
            if input == &self.source_path {
                return Err(Error::Config(
                    "keylog_input and source_path must be different files".to_string(),
                ));
            }
        }

        self.context_config().validate()
    }

    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_address.parse().map_err(|e| {
            Error::Config(format!(
                "Invalid listen_address '{}': {}",
                self.listen_address, e
            ))
        })
    }

    /// Settings handed to the key provisioning context
    pub fn context_config(&self) -> ContextConfig {
        ContextConfig {
            source_path: self.source_path.clone(),
            buffer_capacity: self.buffer_capacity,
            startup_timeout_ms: self.startup_timeout_ms,
            idle_backoff_ms: self.idle_backoff_ms,
            stop_timeout_ms: self.stop_timeout_ms,
            retention_max_records: self.retention_max_records,
            retention_ttl_secs: self.retention_ttl_secs,
        }
    }
}

// Default value functions
fn default_source_path() -> PathBuf {
    PathBuf::from("keys.txt")
}

fn default_buffer_capacity() -> usize {
    crate::DEFAULT_BUFFER_CAPACITY
}

fn default_startup_timeout_ms() -> u64 {
    1000
}

fn default_idle_backoff_ms() -> u64 {
    50
}

fn default_stop_timeout_ms() -> u64 {
    500
}

fn default_listen_address() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_static_dir() -> Option<PathBuf> {
    Some(PathBuf::from("./static/web"))
}

fn default_chunk_width() -> usize {
    crate::DEFAULT_CHUNK_WIDTH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_config_defaults() {
        let config = ContextConfig::new("keyDB.txt");
        assert_eq!(config.buffer_capacity, 1024);
        assert_eq!(config.startup_timeout(), Duration::from_secs(1));
        assert!(config.retention().is_unbounded());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_context_config_validation() {
        let mut config = ContextConfig::new("");
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.source_path = PathBuf::from("keys.txt");
        config.buffer_capacity = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.buffer_capacity = 16;
        config.retention_max_records = Some(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_retention_ttl_bounds() {
        let mut config = ContextConfig::new("keys.txt");

        for ttl in [0, MAX_RETENTION_TTL_SECS + 1, 10_000_000_000_000_000, u64::MAX] {
            config.retention_ttl_secs = Some(ttl);
            assert!(matches!(config.validate(), Err(Error::Config(_))), "ttl {}", ttl);
        }

        config.retention_ttl_secs = Some(MAX_RETENTION_TTL_SECS);
        assert!(config.validate().is_ok());

        let result = ContextConfig::from_yaml_str(
            "source_path: keys.txt\nretention_ttl_secs: 18446744073709551615\n",
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_context_config_from_yaml() {
        let config = ContextConfig::from_yaml_str(
            "source_path: /var/lib/qkd/keyDB.txt\nbuffer_capacity: 64\nretention_ttl_secs: 3600\n",
        )
        .unwrap();
        assert_eq!(config.source_path, PathBuf::from("/var/lib/qkd/keyDB.txt"));
        assert_eq!(config.buffer_capacity, 64);
        assert_eq!(config.retention().ttl_secs, Some(3600));
    }

    #[test]
    fn test_context_config_missing_source_path() {
        let result = ContextConfig::from_yaml_str("buffer_capacity: 64\n");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_gateway_config_from_yaml() {
        let config = GatewayConfig::from_yaml_str(
            "listen_address: 127.0.0.1:9000\nkeylog_input: SecretKey.log\nsource_path: keyDB.txt\n",
        )
        .unwrap();
        assert_eq!(config.listen_addr().unwrap().port(), 9000);
        assert_eq!(config.chunk_width, 767);
        assert_eq!(config.static_dir, Some(PathBuf::from("./static/web")));

        let context = config.context_config();
        assert_eq!(context.source_path, PathBuf::from("keyDB.txt"));
        assert_eq!(context.buffer_capacity, 1024);
    }

    #[test]
    fn test_gateway_config_validation() {
        let result = GatewayConfig::from_yaml_str("listen_address: not-an-address\n");
        assert!(matches!(result, Err(Error::Config(_))));

        let result = GatewayConfig::from_yaml_str(
            "keylog_input: keys.txt\nsource_path: keys.txt\n",
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_gateway_config_missing_file() {
        let result = GatewayConfig::from_file("/nonexistent/qkey-gateway.yaml");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
