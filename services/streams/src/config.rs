use friendlink_pipeline::KafkaConfig;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Streams service configuration.
///
/// Read from `config/streams.*`, then `/etc/friendlink/streams.*`, then
/// `STREAMS__`-prefixed environment variables, later sources winning.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    /// Brokers, consumer group and the upload/click topics
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    /// Bucket holding the linked files
    pub s3: S3Config,
    /// PostgreSQL holding `friend_urls`
    pub database: DatabaseConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Port of the Prometheus scrape endpoint
    pub metrics_port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "friendlink-streams".to_string(),
            log_level: "info".to_string(),
            metrics_port: 9090,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Directory holding one RocksDB database per partition
    pub dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/friendlink/streams"),
        }
    }
}

/// Timers and cleanup dispatch
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Period of the expiry sweep in seconds
    pub sweep_interval_secs: u64,
    /// Period of the click counter flush in seconds
    pub flush_interval_secs: u64,
    /// Maximum number of cleanup jobs running at once
    pub cleanup_concurrency: usize,
    /// Capacity of the cleanup job queue shared by all partitions
    pub cleanup_queue_capacity: usize,
    /// Capacity of each partition worker's inbox
    pub worker_channel_capacity: usize,
    /// How long a stopping worker waits for in-flight cleanup reports
    pub shutdown_grace_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            flush_interval_secs: 20,
            cleanup_concurrency: 8,
            cleanup_queue_capacity: 256,
            worker_channel_capacity: 1024,
            shutdown_grace_secs: 30,
        }
    }
}

impl ProcessingConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket holding uploaded files
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// Admin API listen address
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config: Self = config::Config::builder()
            .add_source(config::File::with_name("config/streams").required(false))
            .add_source(config::File::with_name("/etc/friendlink/streams").required(false))
            // STREAMS__KAFKA__BOOTSTRAP_SERVERS -> kafka.bootstrap_servers
            .add_source(
                config::Environment::with_prefix("STREAMS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        self.kafka.validate()?;

        let processing = &self.processing;
        if processing.sweep_interval_secs == 0 || processing.flush_interval_secs == 0 {
            anyhow::bail!("processing intervals must be greater than zero");
        }
        if processing.cleanup_concurrency == 0
            || processing.cleanup_queue_capacity == 0
            || processing.worker_channel_capacity == 0
        {
            anyhow::bail!("processing concurrency and capacities must be greater than zero");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> Config {
        serde_json::from_value(serde_json::json!({
            "kafka": { "bootstrap_servers": "broker:9092" },
            "s3": { "bucket": "friend-files" },
            "database": { "url": "postgres://localhost/friendlink" }
        }))
        .unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = minimal_config();
        assert_eq!(config.processing.sweep_interval(), Duration::from_secs(30));
        assert_eq!(config.processing.flush_interval(), Duration::from_secs(20));
        assert_eq!(config.service.name, "friendlink-streams");
        assert_eq!(config.kafka.topics.uploads, "friend-file-upload-events");
        assert_eq!(config.s3.region, "us-east-1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = minimal_config();
        config.processing.flush_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = minimal_config();
        config.processing.cleanup_concurrency = 0;
        assert!(config.validate().is_err());
    }
}
