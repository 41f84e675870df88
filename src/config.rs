//! Service configuration.
//!
//! Connection settings, store key layout and the timing policy of the
//! scheduler, message queue and compute service.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::messages::MessageQueueConfig;
use crate::scheduler::SchedulerConfig;

/// Configuration for a compute service deployment.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    // Store settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix for every key the service writes.
    pub key_prefix: String,

    // Scheduler timing
    /// A queue without dequeue activity for longer than this is expired.
    pub stale_queue_after: Duration,
    /// Interval between expiry sweeps.
    pub sweep_interval: Duration,
    /// Interval after which the local liveness set is discarded.
    pub active_reset_interval: Duration,

    // Message settings
    /// Lifetime of a status channel after its latest post.
    pub message_ttl: Duration,

    // Cache settings
    /// Sliding expiry of cached requirements.
    pub requirements_ttl: Duration,
    /// How long a fetched cluster list is reused.
    pub cluster_refresh: Duration,

    // Collaborators
    /// YAML file with cluster definitions. Uses a single default cluster
    /// when unset.
    pub clusters_file: Option<PathBuf>,
    /// Root directory of the filesystem blob store.
    pub blob_root: PathBuf,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "compute".to_string(),

            stale_queue_after: Duration::from_secs(600), // 10 minutes
            sweep_interval: Duration::from_secs(120),
            active_reset_interval: Duration::from_secs(10),

            message_ttl: Duration::from_secs(30),

            requirements_ttl: Duration::from_secs(600),
            cluster_refresh: Duration::from_secs(120),

            clusters_file: None,
            blob_root: PathBuf::from("./blobs"),
        }
    }
}

impl ServiceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `FARM_REDIS_URL`: Redis connection URL (default: redis://127.0.0.1:6379)
    /// - `FARM_KEY_PREFIX`: Store key prefix (default: compute)
    /// - `FARM_STALE_QUEUE_SECS`: Queue staleness window (default: 600)
    /// - `FARM_SWEEP_INTERVAL_SECS`: Expiry sweep interval (default: 120)
    /// - `FARM_ACTIVE_RESET_SECS`: Local liveness reset interval (default: 10)
    /// - `FARM_MESSAGE_TTL_SECS`: Status channel TTL (default: 30)
    /// - `FARM_REQUIREMENTS_TTL_SECS`: Requirements cache expiry (default: 600)
    /// - `FARM_CLUSTER_REFRESH_SECS`: Cluster list refresh (default: 120)
    /// - `FARM_CLUSTERS_FILE`: YAML cluster definitions (optional)
    /// - `FARM_BLOB_ROOT`: Blob store directory (default: ./blobs)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the
    /// resulting configuration does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("FARM_REDIS_URL") {
            config.redis_url = val;
        }

        if let Ok(val) = std::env::var("FARM_KEY_PREFIX") {
            config.key_prefix = val;
        }

        if let Ok(val) = std::env::var("FARM_STALE_QUEUE_SECS") {
            config.stale_queue_after = parse_env_secs(&val, "FARM_STALE_QUEUE_SECS")?;
        }

        if let Ok(val) = std::env::var("FARM_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = parse_env_secs(&val, "FARM_SWEEP_INTERVAL_SECS")?;
        }

        if let Ok(val) = std::env::var("FARM_ACTIVE_RESET_SECS") {
            config.active_reset_interval = parse_env_secs(&val, "FARM_ACTIVE_RESET_SECS")?;
        }

        if let Ok(val) = std::env::var("FARM_MESSAGE_TTL_SECS") {
            config.message_ttl = parse_env_secs(&val, "FARM_MESSAGE_TTL_SECS")?;
        }

        if let Ok(val) = std::env::var("FARM_REQUIREMENTS_TTL_SECS") {
            config.requirements_ttl = parse_env_secs(&val, "FARM_REQUIREMENTS_TTL_SECS")?;
        }

        if let Ok(val) = std::env::var("FARM_CLUSTER_REFRESH_SECS") {
            config.cluster_refresh = parse_env_secs(&val, "FARM_CLUSTER_REFRESH_SECS")?;
        }

        if let Ok(val) = std::env::var("FARM_CLUSTERS_FILE") {
            config.clusters_file = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var("FARM_BLOB_ROOT") {
            config.blob_root = PathBuf::from(val);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.key_prefix.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "key_prefix cannot be empty".to_string(),
            ));
        }

        let timings = [
            ("stale_queue_after", self.stale_queue_after),
            ("sweep_interval", self.sweep_interval),
            ("active_reset_interval", self.active_reset_interval),
            ("message_ttl", self.message_ttl),
            ("requirements_ttl", self.requirements_ttl),
        ];
        for (name, value) in timings {
            if value.is_zero() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        // Queues must be able to stay active between two write-throughs.
        if self.active_reset_interval >= self.stale_queue_after {
            return Err(ConfigError::ValidationFailed(
                "active_reset_interval must be shorter than stale_queue_after".to_string(),
            ));
        }

        Ok(())
    }

    /// Scheduler settings derived from this configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::new(format!("{}/tasks", self.key_prefix))
            .with_stale_after(self.stale_queue_after)
            .with_active_reset_interval(self.active_reset_interval)
    }

    /// Message queue settings derived from this configuration.
    pub fn message_queue_config(&self) -> MessageQueueConfig {
        MessageQueueConfig::new(format!("{}/messages", self.key_prefix))
            .with_message_ttl(self.message_ttl)
    }

    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_stale_queue_after(mut self, window: Duration) -> Self {
        self.stale_queue_after = window;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_active_reset_interval(mut self, interval: Duration) -> Self {
        self.active_reset_interval = interval;
        self
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = ttl;
        self
    }

    pub fn with_requirements_ttl(mut self, ttl: Duration) -> Self {
        self.requirements_ttl = ttl;
        self
    }

    pub fn with_cluster_refresh(mut self, refresh: Duration) -> Self {
        self.cluster_refresh = refresh;
        self
    }

    pub fn with_clusters_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.clusters_file = Some(path.into());
        self
    }

    pub fn with_blob_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.blob_root = path.into();
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable holding a number of seconds.
fn parse_env_secs(value: &str, key: &str) -> Result<Duration, ConfigError> {
    parse_env_value::<u64>(value, key).map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.stale_queue_after, Duration::from_secs(600));
        assert_eq!(config.sweep_interval, Duration::from_secs(120));
        assert_eq!(config.message_ttl, Duration::from_secs(30));
        assert_eq!(config.requirements_ttl, Duration::from_secs(600));
        assert_eq!(config.cluster_refresh, Duration::from_secs(120));
        assert_eq!(config.active_reset_interval, Duration::from_secs(10));
        assert!(config.clusters_file.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_derived_key_prefixes() {
        let config = ServiceConfig::new().with_key_prefix("farm");

        assert_eq!(config.scheduler_config().key_prefix, "farm/tasks");
        assert_eq!(config.message_queue_config().key_prefix, "farm/messages");
        assert_eq!(
            config.scheduler_config().stale_after,
            config.stale_queue_after
        );
    }

    #[test]
    fn test_validation_zero_timing() {
        let config = ServiceConfig::default().with_message_ttl(Duration::ZERO);
        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("message_ttl"));
    }

    #[test]
    fn test_validation_reset_longer_than_window() {
        let config = ServiceConfig::default()
            .with_stale_queue_after(Duration::from_secs(5))
            .with_active_reset_interval(Duration::from_secs(10));
        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("active_reset_interval"));
    }

    #[test]
    fn test_validation_empty_prefix() {
        let config = ServiceConfig::default().with_key_prefix("");
        assert!(config.validate().unwrap_err().to_string().contains("key_prefix"));
    }

    #[test]
    fn test_parse_env_secs() {
        assert_eq!(
            parse_env_secs(" 45 ", "FARM_MESSAGE_TTL_SECS").unwrap(),
            Duration::from_secs(45)
        );
        let err = parse_env_secs("soon", "FARM_MESSAGE_TTL_SECS").unwrap_err();
        assert!(err.to_string().contains("FARM_MESSAGE_TTL_SECS"));
    }
}
