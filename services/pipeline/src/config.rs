//! Kafka settings shared by the publisher and the streams service.
//!
//! The streams service embeds [`KafkaConfig`] as the `kafka` section of its own
//! configuration; the publisher reads it from `KAFKA_*` environment variables.

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: &'static str, message: String },
}

/// Transport used to reach the brokers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SecurityProtocol {
    #[default]
    Plaintext,
    Ssl,
    SaslPlaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "plaintext",
            SecurityProtocol::Ssl => "ssl",
            SecurityProtocol::SaslPlaintext => "sasl_plaintext",
            SecurityProtocol::SaslSsl => "sasl_ssl",
        }
    }

    pub fn uses_sasl(self) -> bool {
        matches!(self, SecurityProtocol::SaslPlaintext | SecurityProtocol::SaslSsl)
    }
}

impl FromStr for SecurityProtocol {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "plaintext" => Ok(SecurityProtocol::Plaintext),
            "ssl" => Ok(SecurityProtocol::Ssl),
            "sasl_plaintext" => Ok(SecurityProtocol::SaslPlaintext),
            "sasl_ssl" => Ok(SecurityProtocol::SaslSsl),
            other => Err(ConfigError::InvalidValue {
                key: "security.protocol",
                message: format!("unknown protocol {}", other),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SaslMechanism {
    #[default]
    #[serde(rename = "PLAIN")]
    Plain,
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    #[serde(rename = "SCRAM-SHA-512")]
    ScramSha512,
}

impl SaslMechanism {
    pub fn as_str(self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
        }
    }
}

/// Broker authentication and TLS
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub protocol: SecurityProtocol,
    pub sasl_mechanism: SaslMechanism,
    pub username: Option<String>,
    pub password: Option<String>,
    /// CA bundle used to verify the brokers
    pub ca_location: Option<String>,
    pub certificate_location: Option<String>,
    pub key_location: Option<String>,
    pub key_password: Option<String>,
    pub verify_certificates: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            protocol: SecurityProtocol::default(),
            sasl_mechanism: SaslMechanism::default(),
            username: None,
            password: None,
            ca_location: None,
            certificate_location: None,
            key_location: None,
            key_password: None,
            verify_certificates: true,
        }
    }
}

/// Delivery settings for published events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Required acknowledgments: "0", "1" or "all"
    pub acks: String,
    pub idempotent: bool,
    pub retries: u32,
    pub retry_backoff_ms: u64,
    pub linger_ms: u64,
    /// none, gzip, snappy, lz4 or zstd
    pub compression: String,
    /// How long a publish waits for the broker's acknowledgment
    pub delivery_timeout_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            acks: "all".to_string(),
            idempotent: true,
            retries: 3,
            retry_backoff_ms: 100,
            linger_ms: 5,
            compression: "lz4".to_string(),
            delivery_timeout_ms: 30_000,
        }
    }
}

/// Where a new consumer group starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

/// Consumer group settings. Offsets are always committed manually.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub group_id: String,
    pub auto_offset_reset: OffsetReset,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_poll_interval_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group_id: "friendlink-streams".to_string(),
            auto_offset_reset: OffsetReset::default(),
            session_timeout_ms: 30_000,
            heartbeat_interval_ms: 3_000,
            max_poll_interval_ms: 300_000,
        }
    }
}

/// Topics carrying friend link events.
///
/// Both topics must have the same partition count so a friend code lands on
/// the same partition number in each.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// Link creation events
    pub uploads: String,
    /// Link click events
    pub clicks: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            uploads: "friend-file-upload-events".to_string(),
            clicks: "friend-click-events".to_string(),
        }
    }
}

/// Kafka connection and client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated list of broker addresses
    pub bootstrap_servers: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
    #[serde(default)]
    pub topics: TopicConfig,
    /// Raw librdkafka properties applied last
    #[serde(default)]
    pub extra_properties: HashMap<String, String>,
}

fn default_client_id() -> String {
    "friendlink".to_string()
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self::new("localhost:9092")
    }
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            client_id: default_client_id(),
            security: SecurityConfig::default(),
            producer: ProducerConfig::default(),
            consumer: ConsumerConfig::default(),
            topics: TopicConfig::default(),
            extra_properties: HashMap::new(),
        }
    }

    /// Load configuration from `KAFKA_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = |name: &str| std::env::var(name).ok();

        let mut config =
            Self::new(env("KAFKA_BOOTSTRAP_SERVERS").unwrap_or_else(|| "localhost:9092".to_string()));

        if let Some(client_id) = env("KAFKA_CLIENT_ID") {
            config.client_id = client_id;
        }
        if let Some(group_id) = env("KAFKA_GROUP_ID") {
            config.consumer.group_id = group_id;
        }
        if let Some(topic) = env("KAFKA_UPLOAD_TOPIC") {
            config.topics.uploads = topic;
        }
        if let Some(topic) = env("KAFKA_CLICK_TOPIC") {
            config.topics.clicks = topic;
        }
        if let Some(protocol) = env("KAFKA_SECURITY_PROTOCOL") {
            config.security.protocol = protocol.parse()?;
        }
        config.security.username = env("KAFKA_SASL_USERNAME");
        config.security.password = env("KAFKA_SASL_PASSWORD");
        config.security.ca_location = env("KAFKA_SSL_CA_LOCATION");

        Ok(config)
    }

    /// Connection and authentication properties common to both clients
    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        let security = &self.security;

        config
            .set("bootstrap.servers", &self.bootstrap_servers)
            .set("client.id", &self.client_id)
            .set("security.protocol", security.protocol.as_str());

        let optional = [
            ("ssl.ca.location", &security.ca_location),
            ("ssl.certificate.location", &security.certificate_location),
            ("ssl.key.location", &security.key_location),
            ("ssl.key.password", &security.key_password),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                config.set(key, value);
            }
        }
        if !security.verify_certificates {
            config.set("enable.ssl.certificate.verification", "false");
        }

        if security.protocol.uses_sasl() {
            config.set("sasl.mechanism", security.sasl_mechanism.as_str());
            if let Some(ref username) = security.username {
                config.set("sasl.username", username);
            }
            if let Some(ref password) = security.password {
                config.set("sasl.password", password);
            }
        }

        for (key, value) in &self.extra_properties {
            config.set(key, value);
        }

        config
    }

    pub fn producer_client_config(&self) -> ClientConfig {
        let producer = &self.producer;
        let mut config = self.client_config();

        config
            .set("acks", &producer.acks)
            .set("enable.idempotence", producer.idempotent.to_string())
            .set("retries", producer.retries.to_string())
            .set("retry.backoff.ms", producer.retry_backoff_ms.to_string())
            .set("linger.ms", producer.linger_ms.to_string())
            .set("compression.type", &producer.compression)
            .set("message.timeout.ms", producer.delivery_timeout_ms.to_string());

        config
    }

    pub fn consumer_client_config(&self) -> ClientConfig {
        let consumer = &self.consumer;
        let mut config = self.client_config();

        config
            .set("group.id", &consumer.group_id)
            .set("auto.offset.reset", consumer.auto_offset_reset.as_str())
            // Offsets are committed only after the owning partition worker applied the record
            .set("enable.auto.commit", "false")
            .set("session.timeout.ms", consumer.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", consumer.heartbeat_interval_ms.to_string())
            .set("max.poll.interval.ms", consumer.max_poll_interval_ms.to_string());

        config
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.producer.delivery_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bootstrap_servers.trim().is_empty() {
            return Err(ConfigError::MissingRequired("bootstrap_servers"));
        }
        if self.consumer.group_id.trim().is_empty() {
            return Err(ConfigError::MissingRequired("consumer.group_id"));
        }
        if self.topics.uploads.is_empty() || self.topics.clicks.is_empty() {
            return Err(ConfigError::MissingRequired("topics"));
        }
        if self.topics.uploads == self.topics.clicks {
            return Err(ConfigError::InvalidValue {
                key: "topics",
                message: "uploads and clicks must use distinct topics".to_string(),
            });
        }
        if self.security.protocol.uses_sasl() && self.security.username.is_none() {
            return Err(ConfigError::MissingRequired("security.username"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = KafkaConfig::default();
        assert_eq!(config.bootstrap_servers, "localhost:9092");
        assert_eq!(config.client_id, "friendlink");
        assert_eq!(config.consumer.group_id, "friendlink-streams");
        assert_eq!(config.topics.uploads, "friend-file-upload-events");
        assert_eq!(config.topics.clicks, "friend-click-events");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_shared_topic() {
        let mut config = KafkaConfig::default();
        config.topics.clicks = config.topics.uploads.clone();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key: "topics", .. })
        ));
    }

    #[test]
    fn test_validate_requires_sasl_username() {
        let mut config = KafkaConfig::default();
        config.security.protocol = SecurityProtocol::SaslSsl;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired("security.username"))
        ));

        config.security.username = Some("api-key".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("SASL_SSL".parse::<SecurityProtocol>().unwrap(), SecurityProtocol::SaslSsl);
        assert!("carrier-pigeon".parse::<SecurityProtocol>().is_err());
    }

    #[test]
    fn test_consumer_never_auto_commits() {
        let config = KafkaConfig::new("broker:9092").consumer_client_config();

        assert_eq!(config.get("group.id"), Some("friendlink-streams"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
        assert_eq!(config.get("sasl.mechanism"), None);
    }

    #[test]
    fn test_producer_is_idempotent_by_default() {
        let config = KafkaConfig::new("broker:9092").producer_client_config();

        assert_eq!(config.get("acks"), Some("all"));
        assert_eq!(config.get("enable.idempotence"), Some("true"));
        assert_eq!(config.get("message.timeout.ms"), Some("30000"));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: KafkaConfig = serde_json::from_str(
            r#"{"bootstrap_servers": "broker:9092", "security": {"protocol": "sasl_ssl", "sasl_mechanism": "SCRAM-SHA-512"}}"#,
        )
        .unwrap();

        assert_eq!(config.bootstrap_servers, "broker:9092");
        assert_eq!(config.topics.clicks, "friend-click-events");
        assert_eq!(config.security.sasl_mechanism, SaslMechanism::ScramSha512);
        assert!(config.security.verify_certificates);
    }
}
