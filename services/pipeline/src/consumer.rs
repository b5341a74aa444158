//! Kafka consumer for friend link events.
//!
//! Records are handed to a [`MessageHandler`] one at a time. The consumer's
//! position is committed only after the handler returns `Ok`, so a record whose
//! effects were not applied is redelivered after a restart or rebalance.

use crate::config::KafkaConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, error, info, instrument, warn};

pub use async_trait::async_trait;

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Failed to create consumer: {0}")]
    CreationError(String),

    #[error("Failed to subscribe to topics: {0}")]
    SubscriptionError(String),

    #[error("Failed to commit offset: {0}")]
    CommitError(String),

    /// The record was skipped; consumption continues.
    #[error("Message processing error: {0}")]
    ProcessingError(String),

    /// The handler can no longer make progress; consumption stops.
    #[error("Fatal processing error: {0}")]
    Fatal(String),
}

impl ConsumerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsumerError::Fatal(_))
    }
}

/// Where a record came from
#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    /// Broker or producer timestamp in milliseconds
    pub timestamp: Option<i64>,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    /// Record key, when present and valid UTF-8. Producers key by friend code.
    pub fn key(&self) -> Option<&str> {
        self.metadata
            .key
            .as_deref()
            .and_then(|k| std::str::from_utf8(k).ok())
    }

    fn from_kafka<M: Message>(msg: &M) -> Self {
        let headers = msg
            .headers()
            .map(|headers| {
                headers
                    .iter()
                    .filter_map(|h| {
                        let value = std::str::from_utf8(h.value?).ok()?;
                        Some((h.key.to_string(), value.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            payload: msg.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            metadata: MessageMetadata {
                topic: msg.topic().to_string(),
                partition: msg.partition(),
                offset: msg.offset(),
                key: msg.key().map(<[u8]>::to_vec),
                timestamp: msg.timestamp().to_millis(),
                headers,
            },
        }
    }
}

/// Receives every consumed record in partition order
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Apply a record. Returning `Ok` allows its offset to be committed.
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError>;

    /// Called for records that failed with a non-fatal error
    async fn on_error(&self, message: IncomingMessage, error: ConsumerError) {
        warn!(
            topic = %message.metadata.topic,
            partition = message.metadata.partition,
            offset = message.metadata.offset,
            error = %error,
            "Skipping record"
        );
    }
}

/// Consumer for the upload and click topics
pub struct EventConsumer {
    consumer: StreamConsumer,
    config: Arc<KafkaConfig>,
    shutdown_tx: broadcast::Sender<()>,
}

impl EventConsumer {
    pub fn new(config: KafkaConfig) -> Result<Self, ConsumerError> {
        info!(
            brokers = %config.bootstrap_servers,
            group = %config.consumer.group_id,
            "Creating Kafka consumer"
        );

        let consumer: StreamConsumer = config
            .consumer_client_config()
            .create()
            .map_err(|e| ConsumerError::CreationError(e.to_string()))?;

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            consumer,
            config: Arc::new(config),
            shutdown_tx,
        })
    }

    /// Subscribe to both the upload and the click topic
    pub fn subscribe_events(&self) -> Result<(), ConsumerError> {
        let topics = [
            self.config.topics.uploads.as_str(),
            self.config.topics.clicks.as_str(),
        ];
        info!(?topics, "Subscribing to event topics");

        self.consumer
            .subscribe(&topics)
            .map_err(|e| ConsumerError::SubscriptionError(e.to_string()))
    }

    /// Stop [`EventConsumer::run`] after the record in progress
    pub fn shutdown(&self) {
        info!("Signaling consumer shutdown");
        let _ = self.shutdown_tx.send(());
    }

    /// Consume until shutdown or a fatal handler error.
    ///
    /// Each applied record is committed on its own. Records rejected with a
    /// non-fatal error go to [`MessageHandler::on_error`] and are only covered
    /// once a later record of the same partition is applied. A fatal error
    /// stops the loop without committing anything further, so the failed
    /// record is redelivered after a restart.
    #[instrument(skip(self, handler))]
    pub async fn run<H: MessageHandler>(&self, handler: Arc<H>) -> Result<(), ConsumerError> {
        use tokio_stream::StreamExt;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let stream = self.consumer.stream();
        tokio::pin!(stream);

        let mut applied = AppliedOffsets::default();

        info!("Starting message consumption loop");

        let outcome = loop {
            let next = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break Ok(());
                }
                next = stream.next() => next,
            };

            let borrowed = match next {
                Some(Ok(borrowed)) => borrowed,
                Some(Err(e)) => {
                    error!(error = %e, "Kafka error");
                    continue;
                }
                None => {
                    debug!("Stream ended");
                    break Ok(());
                }
            };
            let message = IncomingMessage::from_kafka(&borrowed);

            debug!(
                topic = %message.metadata.topic,
                partition = message.metadata.partition,
                offset = message.metadata.offset,
                "Received record"
            );

            match deliver(handler.as_ref(), message, &mut applied).await {
                Ok(true) => {
                    if let Err(e) = self.consumer.commit_message(&borrowed, CommitMode::Async) {
                        warn!(error = %e, "Failed to commit offset");
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    error!(error = %e, "Stopping consumer");
                    break Err(e);
                }
            }
        };

        if outcome.is_ok() {
            if let Err(e) = self.commit_applied(&applied) {
                warn!(error = %e, "Failed to commit on shutdown");
            }
        }

        outcome
    }

    /// Synchronously commit the positions reached by applied records
    fn commit_applied(&self, applied: &AppliedOffsets) -> Result<(), ConsumerError> {
        if applied.is_empty() {
            return Ok(());
        }
        self.consumer
            .commit(&applied.partition_list()?, CommitMode::Sync)
            .map_err(|e| ConsumerError::CommitError(e.to_string()))
    }
}

/// Next offset to consume per topic partition, advanced only by applied records
#[derive(Debug, Default)]
pub struct AppliedOffsets {
    next: HashMap<(String, i32), i64>,
}

impl AppliedOffsets {
    pub fn record(&mut self, metadata: &MessageMetadata) {
        let next = metadata.offset + 1;
        self.next
            .entry((metadata.topic.clone(), metadata.partition))
            .and_modify(|current| *current = (*current).max(next))
            .or_insert(next);
    }

    pub fn next_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.next.get(&(topic.to_string(), partition)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.next.is_empty()
    }

    fn partition_list(&self) -> Result<TopicPartitionList, ConsumerError> {
        let mut list = TopicPartitionList::new();
        for ((topic, partition), offset) in &self.next {
            list.add_partition_offset(topic, *partition, Offset::Offset(*offset))
                .map_err(|e| ConsumerError::CommitError(e.to_string()))?;
        }
        Ok(list)
    }
}

/// Hand one record to the handler.
///
/// Returns `Ok(true)` when the record was applied and may be committed,
/// `Ok(false)` when it was skipped, and the error when it was fatal. Only an
/// applied record advances `applied`.
async fn deliver<H: MessageHandler>(
    handler: &H,
    message: IncomingMessage,
    applied: &mut AppliedOffsets,
) -> Result<bool, ConsumerError> {
    match handler.handle(message.clone()).await {
        Ok(()) => {
            applied.record(&message.metadata);
            Ok(true)
        }
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            handler.on_error(message, e).await;
            Ok(false)
        }
    }
}
