//! Kafka producer for friend link events.
//!
//! Events are JSON encoded and keyed by friend code so that the upload and the
//! clicks of one link are routed to the same partition number on both topics.

use crate::config::KafkaConfig;
use crate::events::{ClickEvent, EventError, UploadEvent};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// `message-type` header value for upload events
pub const UPLOAD_EVENT_TYPE: &str = "upload_event";
/// `message-type` header value for click events
pub const CLICK_EVENT_TYPE: &str = "click_event";

#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Refusing to publish invalid event: {0}")]
    InvalidEvent(#[from] EventError),

    #[error("Failed to serialize event: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Failed to deliver to topic {topic}: {message}")]
    DeliveryError { topic: String, message: String },

    #[error("Producer flush timed out after {0:?}")]
    Timeout(Duration),
}

/// Broker position of a published event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// An encoded event addressed to its topic
#[derive(Debug)]
struct EventRecord<'a> {
    topic: &'a str,
    friend_code: &'a str,
    event_type: &'static str,
    payload: Vec<u8>,
}

impl<'a> EventRecord<'a> {
    fn encode<T: Serialize>(
        topic: &'a str,
        friend_code: &'a str,
        event_type: &'static str,
        event: &T,
    ) -> Result<Self, ProducerError> {
        Ok(Self {
            topic,
            friend_code,
            event_type,
            payload: serde_json::to_vec(event)?,
        })
    }

    fn upload(config: &'a KafkaConfig, event: &'a UploadEvent) -> Result<Self, ProducerError> {
        event.validate()?;
        Self::encode(&config.topics.uploads, &event.friend_code, UPLOAD_EVENT_TYPE, event)
    }

    fn click(config: &'a KafkaConfig, event: &'a ClickEvent) -> Result<Self, ProducerError> {
        Self::encode(&config.topics.clicks, &event.friend_code, CLICK_EVENT_TYPE, event)
    }

    fn headers(&self) -> OwnedHeaders {
        let correlation_id = Uuid::new_v4().to_string();
        OwnedHeaders::new()
            .insert(Header {
                key: "message-type",
                value: Some(self.event_type),
            })
            .insert(Header {
                key: "correlation-id",
                value: Some(correlation_id.as_str()),
            })
    }
}

/// Publishes upload and click events
pub struct EventProducer {
    producer: FutureProducer,
    config: KafkaConfig,
}

impl EventProducer {
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!(brokers = %config.bootstrap_servers, "Creating Kafka producer");

        let producer: FutureProducer = config
            .producer_client_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        Ok(Self { producer, config })
    }

    /// Publish a link creation event to the uploads topic
    pub async fn publish_upload_event(&self, event: &UploadEvent) -> Result<Delivery, ProducerError> {
        self.deliver(EventRecord::upload(&self.config, event)?).await
    }

    /// Publish a link click event to the clicks topic
    pub async fn publish_click_event(&self, event: &ClickEvent) -> Result<Delivery, ProducerError> {
        self.deliver(EventRecord::click(&self.config, event)?).await
    }

    #[instrument(skip(self, record), fields(topic = %record.topic, friend_code = %record.friend_code))]
    async fn deliver(&self, record: EventRecord<'_>) -> Result<Delivery, ProducerError> {
        let kafka_record = FutureRecord::to(record.topic)
            .key(record.friend_code)
            .payload(&record.payload)
            .headers(record.headers());

        let (partition, offset) = self
            .producer
            .send(kafka_record, Timeout::After(self.config.delivery_timeout()))
            .await
            .map_err(|(e, _)| ProducerError::DeliveryError {
                topic: record.topic.to_string(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Event delivered");

        Ok(Delivery {
            topic: record.topic.to_string(),
            partition,
            offset,
        })
    }

    /// Wait for queued events to be acknowledged
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

impl Drop for EventProducer {
    fn drop(&mut self) {
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!(error = %e, "Failed to flush producer on shutdown");
        }
    }
}
