//! Upload and click processors.
//!
//! Both processors run on their partition's worker task. They mutate the
//! local stores synchronously and turn timer ticks into [`CleanupJob`]s,
//! recording every claimed job in [`InFlight`] until its report arrives.

mod click;
mod upload;

pub use click::ClickProcessor;
pub use upload::UploadProcessor;

use crate::cleanup::CleanupJob;
use crate::store::ExpiryKey;
use std::collections::{HashMap, HashSet};

/// Jobs submitted by one partition and not yet reported back
#[derive(Debug, Default)]
pub struct InFlight {
    expiries: HashSet<ExpiryKey>,
    /// Claimed click count per friend code
    flushes: HashMap<String, i64>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expiry_in_flight(&self, key: &ExpiryKey) -> bool {
        self.expiries.contains(key)
    }

    pub fn flush_in_flight(&self, friend_code: &str) -> bool {
        self.flushes.contains_key(friend_code)
    }

    /// Record a job as submitted
    pub fn claim(&mut self, job: &CleanupJob) {
        match job {
            CleanupJob::FlushClicks { friend_code, count } => {
                self.flushes.insert(friend_code.clone(), *count);
            }
            CleanupJob::Expire {
                key,
                pending_clicks,
                ..
            } => {
                self.expiries.insert(key.clone());
                if *pending_clicks > 0 {
                    self.flushes
                        .insert(key.friend_code().to_string(), *pending_clicks);
                }
            }
        }
    }

    /// Forget a job, either because its report arrived or because it could
    /// not be queued
    pub fn release(&mut self, job: &CleanupJob) {
        match job {
            CleanupJob::FlushClicks { friend_code, .. } => {
                self.flushes.remove(friend_code);
            }
            CleanupJob::Expire {
                key,
                pending_clicks,
                ..
            } => {
                self.expiries.remove(key);
                if *pending_clicks > 0 {
                    self.flushes.remove(key.friend_code());
                }
            }
        }
    }

    pub fn expiry_count(&self) -> usize {
        self.expiries.len()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expiries.is_empty() && self.flushes.is_empty()
    }
}
