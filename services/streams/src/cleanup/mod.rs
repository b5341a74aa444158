//! Side effects against the system of record.
//!
//! Processors never call the collaborator directly. They describe the work as
//! a [`CleanupJob`], the [`dispatcher`] runs it off the partition worker, and
//! the resulting [`CleanupReport`] goes back to the worker, which only then
//! removes the store state the job covered.

pub mod dispatcher;
mod links;
mod objects;

pub use dispatcher::{CleanupDispatcher, DispatchRequest};
pub use links::{LinkCleanupService, LinkRepository};
pub use objects::ObjectStore;

use crate::store::{ExpiryEntry, ExpiryKey};
use async_trait::async_trait;
use thiserror::Error;
use tracing::{instrument, warn};

/// Errors reported by a cleanup collaborator
#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("friend code {0} is not a valid link identifier")]
    InvalidFriendCode(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("object storage error: {0}")]
    Storage(String),
}

impl CleanupError {
    /// Retrying a permanent failure can never succeed
    pub fn is_permanent(&self) -> bool {
        matches!(self, CleanupError::InvalidFriendCode(_))
    }
}

/// The system of record for friend links
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CleanupService: Send + Sync {
    /// Add `count` clicks to the link's persisted click count
    async fn flush_click_count(&self, friend_code: &str, count: i64) -> Result<(), CleanupError>;

    /// Deactivate the link and delete its backing object.
    ///
    /// Calling this again for an already expired link must succeed without
    /// further effect.
    async fn handle_expiry(&self, friend_code: &str, storage_key: &str)
        -> Result<(), CleanupError>;
}

/// Work claimed by a partition worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupJob {
    /// Persist a pending click counter
    FlushClicks { friend_code: String, count: i64 },
    /// Flush any pending clicks, then expire the link
    Expire {
        key: ExpiryKey,
        entry: ExpiryEntry,
        pending_clicks: i64,
    },
}

impl CleanupJob {
    pub fn friend_code(&self) -> &str {
        match self {
            CleanupJob::FlushClicks { friend_code, .. } => friend_code,
            CleanupJob::Expire { key, .. } => key.friend_code(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CleanupJob::FlushClicks { .. } => "flush",
            CleanupJob::Expire { .. } => "expire",
        }
    }
}

/// Outcome of a job, returned to the worker that submitted it
#[derive(Debug)]
pub struct CleanupReport {
    pub job: CleanupJob,
    /// Whether the clicks carried by the job were persisted
    pub clicks_flushed: bool,
    pub result: Result<(), CleanupError>,
}

/// Run one job against the collaborator
#[instrument(skip(service, job), fields(kind = job.kind(), friend_code = job.friend_code()))]
pub async fn execute(service: &dyn CleanupService, job: CleanupJob) -> CleanupReport {
    let (clicks_flushed, result) = match &job {
        CleanupJob::FlushClicks { friend_code, count } => {
            let result = service.flush_click_count(friend_code, *count).await;
            (result.is_ok(), result)
        }
        CleanupJob::Expire {
            entry,
            pending_clicks,
            ..
        } => {
            let mut clicks_flushed = false;
            let mut result = Ok(());

            if *pending_clicks > 0 {
                result = service
                    .flush_click_count(&entry.friend_code, *pending_clicks)
                    .await;
                clicks_flushed = result.is_ok();
            }

            if result.is_ok() {
                result = service
                    .handle_expiry(&entry.friend_code, &entry.storage_key)
                    .await;
            }

            (clicks_flushed, result)
        }
    };

    if let Err(e) = &result {
        warn!(error = %e, permanent = e.is_permanent(), "Cleanup job failed");
    }

    CleanupReport {
        job,
        clicks_flushed,
        result,
    }
}
