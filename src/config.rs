//! Configuration management for Keygate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::counter::StorageBackend;
use crate::error::{KeygateError, Result};
use crate::ratelimit::{
    BackoffPolicy, KeySource, BASE_WAIT_TIME_MS, GRACE_PERIOD_MS, MAX_WAIT_TIME_MS,
};

/// Prefix for environment variable overrides, e.g. `KEYGATE_SERVER__HTTP_ADDR`.
pub const ENV_PREFIX: &str = "KEYGATE";

/// Main configuration for the Keygate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeygateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Counter storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8787))
}

/// Adaptive limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Spacing armed after an admitted request, in milliseconds
    #[serde(default = "default_base_wait")]
    pub base_wait_ms: u64,

    /// Cap on a single penalty, in milliseconds
    #[serde(default = "default_max_wait")]
    pub max_wait_ms: u64,

    /// Slack subtracted from reported waits, in milliseconds
    #[serde(default = "default_grace_period")]
    pub grace_period_ms: u64,

    /// Request attribute the limiter key is derived from
    #[serde(default)]
    pub key_source: KeySource,

    /// Idle time after which per-key state is dropped from memory
    #[serde(default = "default_idle_eviction")]
    pub idle_eviction_secs: u64,

    /// How often the idle sweeper runs
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            base_wait_ms: default_base_wait(),
            max_wait_ms: default_max_wait(),
            grace_period_ms: default_grace_period(),
            key_source: KeySource::default(),
            idle_eviction_secs: default_idle_eviction(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_base_wait() -> u64 {
    BASE_WAIT_TIME_MS
}

fn default_max_wait() -> u64 {
    MAX_WAIT_TIME_MS
}

fn default_grace_period() -> u64 {
    GRACE_PERIOD_MS
}

fn default_idle_eviction() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

impl LimiterConfig {
    /// Build the backoff policy described by this configuration.
    pub fn policy(&self) -> Result<BackoffPolicy> {
        BackoffPolicy::new(self.base_wait_ms, self.max_wait_ms, self.grace_period_ms)
    }

    pub fn idle_eviction(&self) -> Duration {
        Duration::from_secs(self.idle_eviction_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Counter storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// Directory holding one file per key for the file backend
    #[serde(default = "default_storage_path")]
    pub path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
        }
    }
}

fn default_storage_path() -> Option<PathBuf> {
    Some(PathBuf::from("keygate-data"))
}

impl KeygateConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `KEYGATE_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: KeygateConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| KeygateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: KeygateConfig =
            serde_yaml::from_str(yaml).map_err(|e| KeygateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.limiter.policy()?;
        if self.limiter.sweep_interval_secs == 0 {
            return Err(KeygateError::Config(
                "limiter.sweep_interval_secs must be positive".into(),
            ));
        }
        if self.storage.backend == StorageBackend::File && self.storage.path.is_none() {
            return Err(KeygateError::Config(
                "storage.path is required for the file backend".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KeygateConfig::default();
        assert_eq!(config.server.http_addr, "127.0.0.1:8787".parse().unwrap());
        assert_eq!(config.limiter.policy().unwrap(), BackoffPolicy::default());
        assert_eq!(config.limiter.key_source, KeySource::Path);
        assert_eq!(config.limiter.idle_eviction(), Duration::from_secs(300));
        assert_eq!(config.storage.backend, StorageBackend::File);
        assert_eq!(config.storage.path, Some(PathBuf::from("keygate-data")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_yaml_partial() {
        let config = KeygateConfig::from_yaml(
            r#"
server:
  http_addr: "0.0.0.0:9000"
limiter:
  base_wait_ms: 250
  key_source: client_addr
storage:
  backend: memory
"#,
        )
        .unwrap();

        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.limiter.base_wait_ms, 250);
        assert_eq!(config.limiter.max_wait_ms, MAX_WAIT_TIME_MS);
        assert_eq!(config.limiter.key_source, KeySource::ClientAddr);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let result = KeygateConfig::from_yaml("limiter:\n  base_wait_ms: 0\n");
        assert!(matches!(result, Err(KeygateError::Config(_))));
    }

    #[test]
    fn test_file_backend_without_path_rejected() {
        let mut config = KeygateConfig::default();
        config.storage.path = None;
        assert!(matches!(config.validate(), Err(KeygateError::Config(_))));

        config.storage.backend = StorageBackend::Memory;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keygate.yaml");
        std::fs::write(&path, "limiter:\n  grace_period_ms: 1000\n").unwrap();

        let config = KeygateConfig::load(Some(path.as_path())).unwrap();
        assert_eq!(config.limiter.grace_period_ms, 1000);
        assert_eq!(config.limiter.base_wait_ms, BASE_WAIT_TIME_MS);

        let from_file = KeygateConfig::from_file(&path).unwrap();
        assert_eq!(from_file.limiter.grace_period_ms, 1000);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let result = KeygateConfig::load(Some(dir.path().join("absent.yaml").as_path()));
        assert!(matches!(result, Err(KeygateError::Config(_))));
    }
}
