//! Friendlink Pipeline - Kafka event pipeline for friend links
//!
//! This library carries the two event streams of the friend link service:
//!
//! - Upload events, published when a shareable link is created for a file
//! - Click events, published every time a link is opened
//!
//! The streams service consumes both topics to expire links and persist click
//! counts; the link service publishes them through [`EventProducer`].
//!
//! # Example
//!
//! ```rust,no_run
//! use friendlink_pipeline::{ClickEvent, EventProducer, KafkaConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = KafkaConfig::from_env()?;
//!     let producer = EventProducer::new(config)?;
//!
//!     let event = ClickEvent::new("9b2f6c1e-4a7d-4e0b-9a51-0c1d2e3f4a5b", 1_705_314_600_000);
//!     producer.publish_click_event(&event).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumer;
pub mod events;
pub mod producer;

// Re-export main types
pub use config::{
    ConfigError, ConsumerConfig, KafkaConfig, OffsetReset, ProducerConfig, SaslMechanism,
    SecurityConfig, SecurityProtocol, TopicConfig,
};
pub use consumer::{
    async_trait, AppliedOffsets, ConsumerError, EventConsumer, IncomingMessage, MessageHandler,
    MessageMetadata,
};
pub use events::{ClickEvent, EventError, UploadEvent, MAX_EXPIRY_MILLIS};
pub use producer::{Delivery, EventProducer, ProducerError, CLICK_EVENT_TYPE, UPLOAD_EVENT_TYPE};
