//! Partition workers.
//!
//! Each assigned partition gets one task that owns the partition's state store
//! and both processors. Records, timer ticks, cleanup reports and stats
//! requests are all handled inside that task's `select!` loop, one at a time.

use crate::cleanup::{CleanupDispatcher, CleanupJob, CleanupReport, DispatchRequest};
use crate::config::ProcessingConfig;
use crate::processor::{ClickProcessor, InFlight, UploadProcessor};
use crate::store::{Checkpoint, StateStore, StoreError};
use chrono::Utc;
use friendlink_pipeline::{ClickEvent, UploadEvent};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("partition {0} worker has stopped")]
    Stopped(i32),

    #[error("partition {partition} worker panicked: {reason}")]
    Panicked { partition: i32, reason: String },
}

/// A decoded record routed to its partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionEvent {
    Upload(UploadEvent),
    Click(ClickEvent),
}

pub enum WorkerMessage {
    /// Apply a record; `ack` fires once its effects are in the store
    Event {
        event: PartitionEvent,
        checkpoint: Checkpoint,
        ack: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<PartitionStats>,
    },
}

/// Snapshot of one partition's state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionStats {
    pub partition: i32,
    pub expiry_entries: usize,
    pub pending_counters: usize,
    pub inflight_expiries: usize,
    pub inflight_flushes: usize,
}

/// Timer and channel settings shared by all workers
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub sweep_interval: Duration,
    pub flush_interval: Duration,
    pub shutdown_grace: Duration,
    pub channel_capacity: usize,
}

impl From<&ProcessingConfig> for WorkerSettings {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            sweep_interval: config.sweep_interval(),
            flush_interval: config.flush_interval(),
            shutdown_grace: config.shutdown_grace(),
            channel_capacity: config.worker_channel_capacity,
        }
    }
}

/// Directory of a partition's database under the state root
pub fn partition_dir(state_dir: &Path, partition: i32) -> PathBuf {
    state_dir.join(format!("partition-{}", partition))
}

pub struct PartitionWorker {
    partition: i32,
    store: StateStore,
    uploads: UploadProcessor,
    clicks: ClickProcessor,
    inflight: InFlight,
    dispatcher: CleanupDispatcher,
    reports_tx: mpsc::UnboundedSender<CleanupReport>,
    settings: WorkerSettings,
    /// Cancelled when this worker stops on an error
    failed: CancellationToken,
}

impl PartitionWorker {
    /// Open the partition's store. The worker does nothing until spawned.
    pub fn open(
        partition: i32,
        state_dir: &Path,
        dispatcher: CleanupDispatcher,
        settings: WorkerSettings,
        failed: CancellationToken,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CleanupReport>), WorkerError> {
        let store = StateStore::open(&partition_dir(state_dir, partition))?;
        let uploads = UploadProcessor::new(partition, store.expiry(), store.clicks());
        let clicks = ClickProcessor::new(partition, store.clicks());
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();

        let worker = Self {
            partition,
            store,
            uploads,
            clicks,
            inflight: InFlight::new(),
            dispatcher,
            reports_tx,
            settings,
            failed,
        };
        Ok((worker, reports_rx))
    }

    /// Open the partition's store and start its task.
    ///
    /// `failed` is cancelled if the task stops on an error, including errors
    /// raised by a sweep or flush tick with no record in flight.
    pub fn spawn(
        partition: i32,
        state_dir: &Path,
        dispatcher: CleanupDispatcher,
        settings: WorkerSettings,
        cancel: CancellationToken,
        failed: CancellationToken,
    ) -> Result<WorkerHandle, WorkerError> {
        let (worker, reports) = Self::open(partition, state_dir, dispatcher, settings, failed)?;
        let (tx, inbox) = mpsc::channel(worker.settings.channel_capacity);

        let join = tokio::spawn(worker.run(inbox, reports, cancel));

        info!(partition, "Partition worker started");

        Ok(WorkerHandle {
            client: WorkerClient { partition, tx },
            join,
        })
    }

    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<WorkerMessage>,
        mut reports: mpsc::UnboundedReceiver<CleanupReport>,
        cancel: CancellationToken,
    ) -> Result<(), WorkerError> {
        // trips on an error return and on a panic unwinding through here
        let failure = self.failed.clone().drop_guard();
        let outcome = self.run_until_stopped(&mut inbox, &mut reports, &cancel).await;

        match &outcome {
            Ok(()) => {
                failure.disarm();
                info!(partition = self.partition, "Partition worker stopped");
            }
            Err(e) => {
                error!(partition = self.partition, error = %e, "Partition worker failed");
                metrics::counter!("streams.workers.failed").increment(1);
            }
        }
        outcome
    }

    async fn run_until_stopped(
        &mut self,
        inbox: &mut mpsc::Receiver<WorkerMessage>,
        reports: &mut mpsc::UnboundedReceiver<CleanupReport>,
        cancel: &CancellationToken,
    ) -> Result<(), WorkerError> {
        self.event_loop(inbox, reports, cancel).await?;
        self.drain(reports).await?;
        self.store.flush()?;
        Ok(())
    }

    async fn event_loop(
        &mut self,
        inbox: &mut mpsc::Receiver<WorkerMessage>,
        reports: &mut mpsc::UnboundedReceiver<CleanupReport>,
        cancel: &CancellationToken,
    ) -> Result<(), WorkerError> {
        let start = Instant::now();
        let mut sweep = interval_at(start + self.settings.sweep_interval, self.settings.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut flush = interval_at(start + self.settings.flush_interval, self.settings.flush_interval);
        flush.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                Some(report) = reports.recv() => self.apply_report(report)?,
                message = inbox.recv() => match message {
                    Some(message) => self.handle_message(message)?,
                    None => return Ok(()),
                },
                _ = sweep.tick() => self.sweep(Utc::now().timestamp_millis())?,
                _ = flush.tick() => self.flush()?,
            }
        }
    }

    fn handle_message(&mut self, message: WorkerMessage) -> Result<(), WorkerError> {
        match message {
            WorkerMessage::Event {
                event,
                checkpoint,
                ack,
            } => {
                self.apply_event(&event, &checkpoint)?;
                // Router may have given up waiting
                let _ = ack.send(());
            }
            WorkerMessage::Stats { reply } => {
                let _ = reply.send(self.stats()?);
            }
        }
        Ok(())
    }

    fn apply_event(&mut self, event: &PartitionEvent, checkpoint: &Checkpoint) -> Result<(), WorkerError> {
        if let Some(applied) = self.store.applied_offset(&checkpoint.topic)? {
            if checkpoint.offset <= applied {
                debug!(
                    partition = self.partition,
                    topic = %checkpoint.topic,
                    offset = checkpoint.offset,
                    applied,
                    "Skipping redelivered record"
                );
                metrics::counter!("streams.events.redelivered").increment(1);
                return Ok(());
            }
        }

        match event {
            PartitionEvent::Upload(upload) => {
                self.uploads.process(upload, Some(checkpoint))?;
            }
            PartitionEvent::Click(click) => {
                self.clicks.process(click, Some(checkpoint))?;
            }
        }
        Ok(())
    }

    fn sweep(&mut self, now_ms: i64) -> Result<(), WorkerError> {
        let jobs = self.uploads.sweep(now_ms, &mut self.inflight)?;
        self.submit_all(jobs);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), WorkerError> {
        let jobs = self.clicks.flush(&mut self.inflight)?;
        self.submit_all(jobs);
        Ok(())
    }

    fn submit_all(&mut self, jobs: Vec<CleanupJob>) {
        for job in jobs {
            let request = DispatchRequest {
                partition: self.partition,
                job,
                reply: self.reports_tx.clone(),
            };
            if let Err(rejected) = self.dispatcher.try_submit(request) {
                debug!(
                    partition = self.partition,
                    friend_code = %rejected.job.friend_code(),
                    "Cleanup queue full, retrying on next tick"
                );
                self.inflight.release(&rejected.job);
            }
        }
        self.record_inflight();
    }

    fn apply_report(&mut self, report: CleanupReport) -> Result<(), WorkerError> {
        self.inflight.release(&report.job);

        match &report.job {
            CleanupJob::FlushClicks { friend_code, count } => {
                self.clicks.complete(friend_code, *count, &report.result)?;
            }
            CleanupJob::Expire {
                key,
                pending_clicks,
                ..
            } => {
                self.uploads
                    .complete(key, *pending_clicks, report.clicks_flushed, &report.result)?;
            }
        }

        self.record_inflight();
        Ok(())
    }

    /// Wait for reports of jobs still running, up to the shutdown grace
    async fn drain(
        &mut self,
        reports: &mut mpsc::UnboundedReceiver<CleanupReport>,
    ) -> Result<(), WorkerError> {
        if self.inflight.is_empty() {
            return Ok(());
        }

        debug!(
            partition = self.partition,
            expiries = self.inflight.expiry_count(),
            flushes = self.inflight.flush_count(),
            "Waiting for in-flight cleanup"
        );

        let deadline = tokio::time::sleep(self.settings.shutdown_grace);
        tokio::pin!(deadline);

        while !self.inflight.is_empty() {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(
                        partition = self.partition,
                        expiries = self.inflight.expiry_count(),
                        flushes = self.inflight.flush_count(),
                        "Shutdown grace elapsed with cleanup still in flight"
                    );
                    break;
                }
                Some(report) = reports.recv() => self.apply_report(report)?,
            }
        }

        Ok(())
    }

    fn stats(&self) -> Result<PartitionStats, WorkerError> {
        Ok(PartitionStats {
            partition: self.partition,
            expiry_entries: self.uploads.tracked()?,
            pending_counters: self.clicks.pending()?,
            inflight_expiries: self.inflight.expiry_count(),
            inflight_flushes: self.inflight.flush_count(),
        })
    }

    fn record_inflight(&self) {
        let partition = self.partition.to_string();
        metrics::gauge!("streams.cleanup.inflight", "partition" => partition)
            .set((self.inflight.expiry_count() + self.inflight.flush_count()) as f64);
    }
}

/// Cloneable sender side of a worker's inbox
#[derive(Clone)]
pub struct WorkerClient {
    partition: i32,
    tx: mpsc::Sender<WorkerMessage>,
}

impl WorkerClient {
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Hand a record to the worker and wait until it has been applied
    pub async fn apply(&self, event: PartitionEvent, checkpoint: Checkpoint) -> Result<(), WorkerError> {
        let (ack, acked) = oneshot::channel();
        self.tx
            .send(WorkerMessage::Event {
                event,
                checkpoint,
                ack,
            })
            .await
            .map_err(|_| WorkerError::Stopped(self.partition))?;

        acked.await.map_err(|_| WorkerError::Stopped(self.partition))
    }

    pub async fn stats(&self) -> Result<PartitionStats, WorkerError> {
        let (reply, stats) = oneshot::channel();
        self.tx
            .send(WorkerMessage::Stats { reply })
            .await
            .map_err(|_| WorkerError::Stopped(self.partition))?;

        stats.await.map_err(|_| WorkerError::Stopped(self.partition))
    }
}

/// A running worker
pub struct WorkerHandle {
    client: WorkerClient,
    join: JoinHandle<Result<(), WorkerError>>,
}

impl WorkerHandle {
    pub fn client(&self) -> WorkerClient {
        self.client.clone()
    }

    /// Wait for the worker task to finish
    pub async fn join(self) -> Result<(), WorkerError> {
        let partition = self.client.partition;
        drop(self.client);

        self.join.await.map_err(|e| WorkerError::Panicked {
            partition,
            reason: e.to_string(),
        })?
    }
}
