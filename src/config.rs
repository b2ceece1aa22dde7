//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::nodes::{BuilderSettings, PartitionSettings, RetryPolicy, SourceConfiguration};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub source: SourceConfiguration,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Search backend connection
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub url: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Attempts per partition, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
}

fn default_backend_url() -> String {
    "http://localhost:9200".to_string()
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    500
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            request_timeout_ms: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff(),
        }
    }
}

impl BackendConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries,
            Duration::from_millis(self.retry_backoff_ms),
        )
    }
}

/// Query shape and partitioning
#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "default_group_bucket_limit")]
    pub group_bucket_limit: u32,

    #[serde(default = "default_node_bucket_limit")]
    pub node_bucket_limit: u32,

    #[serde(default = "default_partition_size")]
    pub partition_size: u32,

    #[serde(default = "default_partition_factor")]
    pub partition_factor: f64,

    #[serde(default = "default_max_partitions")]
    pub max_partitions: u32,

    #[serde(default = "default_partition_timeout")]
    pub partition_timeout_ms: u64,
}

fn default_group_bucket_limit() -> u32 {
    20
}

fn default_node_bucket_limit() -> u32 {
    1000
}

fn default_partition_size() -> u32 {
    75
}

fn default_partition_factor() -> f64 {
    1.2
}

fn default_max_partitions() -> u32 {
    32
}

fn default_partition_timeout() -> u64 {
    30_000
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            group_bucket_limit: default_group_bucket_limit(),
            node_bucket_limit: default_node_bucket_limit(),
            partition_size: default_partition_size(),
            partition_factor: default_partition_factor(),
            max_partitions: default_max_partitions(),
            partition_timeout_ms: default_partition_timeout(),
        }
    }
}

impl QueryConfig {
    pub fn builder_settings(&self) -> BuilderSettings {
        BuilderSettings {
            group_bucket_limit: self.group_bucket_limit,
            node_bucket_limit: self.node_bucket_limit,
        }
    }

    pub fn partition_settings(&self) -> PartitionSettings {
        PartitionSettings {
            partition_size: self.partition_size,
            partition_factor: self.partition_factor,
            max_partitions: self.max_partitions,
        }
    }

    pub fn partition_timeout(&self) -> Duration {
        Duration::from_millis(self.partition_timeout_ms)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn default_paths() -> [Option<PathBuf>; 3] {
        [
            dirs::config_dir().map(|p| p.join("infra-nodes").join("config.toml")),
            Some(PathBuf::from("/etc/infra-nodes/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ]
    }

    /// First config file present in the default locations
    pub fn default_path() -> Option<PathBuf> {
        Self::default_paths()
            .into_iter()
            .flatten()
            .find(|path| path.exists())
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        for path in Self::default_paths().iter().flatten() {
            if path.exists() {
                match Self::load_with_env(path) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Load from an explicit path when given, else from the first default
    /// location present, else from the environment.
    ///
    /// Unlike [`Config::load_default`], a file that exists but cannot be
    /// loaded is an error. Nothing is logged, so this can run before the
    /// subscriber is installed.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path.map(Path::to_path_buf).or_else(Self::default_path) {
            Some(path) => Self::load_with_env(&path),
            None => Ok(Self::from_env()),
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from a variable lookup
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("INFRA_NODES_BACKEND_URL") {
            self.backend.url = url;
        }
        if let Some(alias) = lookup("INFRA_NODES_METRIC_ALIAS") {
            self.source.metric_alias = alias;
        }
        if let Some(level) = lookup("INFRA_NODES_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = lookup("INFRA_NODES_LOG_FORMAT") {
            self.logging.format = format;
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# infra-nodes Configuration
#
# Environment variables override these settings:
# - INFRA_NODES_BACKEND_URL
# - INFRA_NODES_METRIC_ALIAS
# - INFRA_NODES_LOG_LEVEL
# - INFRA_NODES_LOG_FORMAT

[backend]
# Search service base URL (the multi-search endpoint is <url>/_msearch)
url = "http://localhost:9200"

# Timeout of a single HTTP request (ms)
request_timeout_ms = 30000

# Attempts per partition, including the first
max_retries = 3

# Base delay between attempts (ms); grows quadratically
retry_backoff_ms = 500

[query]
# Maximum buckets per terms group-by level
group_bucket_limit = 20

# Maximum node buckets per group and partition
node_bucket_limit = 1000

# Nodes per partition when estimating the partition count
partition_size = 75

# Headroom applied to the node count when estimating
partition_factor = 1.2

# Upper bound on partitions for one request
max_partitions = 32

# Timeout of one partition attempt (ms)
partition_timeout_ms = 30000

[source]
# Index patterns holding metrics and logs
metric_alias = "metricbeat-*"
log_alias = "filebeat-*"

[source.fields]
timestamp = "@timestamp"
host = "host.name"
pod = "kubernetes.pod.uid"
container = "container.id"
service = "service.name"

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
