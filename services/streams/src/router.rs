//! Routes consumed records to partition workers.

use crate::cleanup::CleanupDispatcher;
use crate::store::Checkpoint;
use crate::worker::{PartitionEvent, PartitionStats, PartitionWorker, WorkerClient, WorkerError, WorkerHandle, WorkerSettings};
use friendlink_pipeline::{
    async_trait, ClickEvent, ConsumerError, EventError, IncomingMessage, MessageHandler, TopicConfig,
    UploadEvent,
};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Message handler that owns one worker per assigned partition.
///
/// Workers are started on the first record of their partition. Uploads and
/// clicks sharing a partition number share a worker, which relies on both
/// topics having the same partition count.
///
/// Rebalances are not tracked. A worker whose partition is revoked keeps
/// running until shutdown, and `/partitions` keeps reporting it. Partition
/// state lives only in the local RocksDB directory with no changelog topic,
/// so a partition moved to another host starts over from an empty store
/// there, and the state is lost with the host.
///
/// A worker that stops on an error trips [`EventRouter::failed`]. Records
/// for any partition are rejected as fatal from then on.
pub struct EventRouter {
    topics: TopicConfig,
    state_dir: PathBuf,
    settings: WorkerSettings,
    dispatcher: CleanupDispatcher,
    cancel: CancellationToken,
    failed: CancellationToken,
    workers: Mutex<HashMap<i32, WorkerHandle>>,
}

impl EventRouter {
    pub fn new(
        topics: TopicConfig,
        state_dir: PathBuf,
        settings: WorkerSettings,
        dispatcher: CleanupDispatcher,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            topics,
            state_dir,
            settings,
            dispatcher,
            cancel,
            failed: CancellationToken::new(),
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn decode(&self, message: &IncomingMessage) -> Result<Result<PartitionEvent, EventError>, ConsumerError> {
        let topic = message.metadata.topic.as_str();
        if topic == self.topics.uploads {
            Ok(UploadEvent::decode(&message.payload).map(PartitionEvent::Upload))
        } else if topic == self.topics.clicks {
            Ok(ClickEvent::decode(&message.payload).map(PartitionEvent::Click))
        } else {
            Err(ConsumerError::ProcessingError(format!(
                "record from unexpected topic {}",
                topic
            )))
        }
    }

    fn worker(&self, partition: i32) -> Result<WorkerClient, WorkerError> {
        let mut workers = self.workers.lock();
        if let Some(handle) = workers.get(&partition) {
            return Ok(handle.client());
        }

        let handle = PartitionWorker::spawn(
            partition,
            &self.state_dir,
            self.dispatcher.clone(),
            self.settings.clone(),
            self.cancel.child_token(),
            self.failed.clone(),
        )?;
        let client = handle.client();
        workers.insert(partition, handle);

        metrics::gauge!("streams.partitions.active").set(workers.len() as f64);
        Ok(client)
    }

    /// Resolves once any partition worker has stopped on an error
    pub async fn failed(&self) {
        self.failed.cancelled().await
    }

    pub fn has_failed(&self) -> bool {
        self.failed.is_cancelled()
    }

    /// State of every running partition, ordered by partition
    pub async fn stats(&self) -> Result<Vec<PartitionStats>, WorkerError> {
        let mut clients: Vec<WorkerClient> = self.workers.lock().values().map(WorkerHandle::client).collect();
        clients.sort_by_key(WorkerClient::partition);

        join_all(clients.iter().map(WorkerClient::stats))
            .await
            .into_iter()
            .collect()
    }

    /// Stop every worker and wait for them to release their stores
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        self.cancel.cancel();

        let handles: Vec<WorkerHandle> = self.workers.lock().drain().map(|(_, handle)| handle).collect();
        info!(workers = handles.len(), "Stopping partition workers");

        let mut outcome = Ok(());
        for result in join_all(handles.into_iter().map(WorkerHandle::join)).await {
            if let Err(e) = result {
                error!(error = %e, "Partition worker did not stop cleanly");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }
}

#[async_trait]
impl MessageHandler for EventRouter {
    #[instrument(skip_all, fields(topic = %message.metadata.topic, partition = message.metadata.partition, offset = message.metadata.offset))]
    async fn handle(&self, message: IncomingMessage) -> Result<(), ConsumerError> {
        if self.has_failed() {
            return Err(ConsumerError::Fatal("a partition worker has failed".to_string()));
        }

        let event = match self.decode(&message)? {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, key = ?message.key(), "Dropping malformed record");
                metrics::counter!("streams.events.malformed").increment(1);
                return Ok(());
            }
        };

        if self.cancel.is_cancelled() {
            return Err(ConsumerError::ProcessingError("shutting down".to_string()));
        }

        let metadata = message.metadata;
        let checkpoint = Checkpoint::new(metadata.topic, metadata.offset);

        let client = self
            .worker(metadata.partition)
            .map_err(|e| ConsumerError::Fatal(e.to_string()))?;
        client
            .apply(event, checkpoint)
            .await
            .map_err(|e| ConsumerError::Fatal(e.to_string()))?;

        metrics::counter!("streams.events.applied").increment(1);
        Ok(())
    }
}
