//! Bounded, concurrency-limited execution of cleanup jobs.

use super::{execute, CleanupJob, CleanupReport, CleanupService};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// A job and the channel its report goes back on
#[derive(Debug)]
pub struct DispatchRequest {
    pub partition: i32,
    pub job: CleanupJob,
    pub reply: mpsc::UnboundedSender<CleanupReport>,
}

/// Handle for submitting jobs to the shared cleanup queue
#[derive(Clone)]
pub struct CleanupDispatcher {
    tx: mpsc::Sender<DispatchRequest>,
}

impl CleanupDispatcher {
    /// Start the dispatch loop.
    ///
    /// The loop ends once every handle has been dropped and the queue drained;
    /// jobs already running finish and deliver their reports.
    pub fn start(
        service: Arc<dyn CleanupService>,
        queue_capacity: usize,
        concurrency: usize,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let handle = tokio::spawn(run(service, rx, Arc::new(Semaphore::new(concurrency))));

        info!(queue_capacity, concurrency, "Cleanup dispatcher started");

        (Self { tx }, handle)
    }

    /// Queue a job without waiting. A full or closed queue hands the request
    /// back to the caller.
    pub fn try_submit(&self, request: DispatchRequest) -> Result<(), DispatchRequest> {
        match self.tx.try_send(request) {
            Ok(()) => {
                metrics::counter!("streams.cleanup.submitted").increment(1);
                Ok(())
            }
            Err(e) => {
                metrics::counter!("streams.cleanup.rejected").increment(1);
                Err(e.into_inner())
            }
        }
    }
}

async fn run(
    service: Arc<dyn CleanupService>,
    mut rx: mpsc::Receiver<DispatchRequest>,
    permits: Arc<Semaphore>,
) {
    while let Some(request) = rx.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let service = service.clone();

        tokio::spawn(async move {
            let DispatchRequest {
                partition,
                job,
                reply,
            } = request;

            let report = execute(service.as_ref(), job).await;
            drop(permit);

            let outcome = if report.result.is_ok() { "ok" } else { "failed" };
            metrics::counter!("streams.cleanup.completed", "kind" => report.job.kind(), "outcome" => outcome)
                .increment(1);

            if reply.send(report).is_err() {
                debug!(partition, "Partition worker gone, dropping cleanup report");
            }
        });
    }

    debug!("Cleanup dispatcher stopped");
}
