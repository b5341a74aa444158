use super::InFlight;
use crate::cleanup::{CleanupError, CleanupJob};
use crate::store::{Checkpoint, ClickStore, ExpiryEntry, ExpiryKey, ExpiryStore, Result};
use friendlink_pipeline::UploadEvent;
use tracing::{debug, error, info, warn};

/// Tracks uploaded links and expires them once their time has passed
pub struct UploadProcessor {
    partition: i32,
    expiry: ExpiryStore,
    clicks: ClickStore,
}

impl UploadProcessor {
    pub fn new(partition: i32, expiry: ExpiryStore, clicks: ClickStore) -> Self {
        Self {
            partition,
            expiry,
            clicks,
        }
    }

    /// Start tracking a validated upload
    pub fn process(&self, event: &UploadEvent, checkpoint: Option<&Checkpoint>) -> Result<ExpiryKey> {
        let key = ExpiryKey::new(event.expires_at, event.friend_code.as_str())?;
        let entry = ExpiryEntry {
            friend_code: event.friend_code.clone(),
            storage_key: event.storage_key.clone(),
        };
        self.expiry.put(&key, &entry, checkpoint)?;

        debug!(
            partition = self.partition,
            friend_code = %event.friend_code,
            expires_at = event.expires_at,
            "Tracking upload"
        );
        metrics::counter!("streams.uploads.tracked").increment(1);

        Ok(key)
    }

    /// Claim an expiry job for every entry due at `now_ms`.
    ///
    /// Entries whose job is still running are skipped, as are entries whose
    /// friend code has a click flush running; the next sweep picks them up.
    pub fn sweep(&self, now_ms: i64, inflight: &mut InFlight) -> Result<Vec<CleanupJob>> {
        let mut jobs = Vec::new();

        for (key, entry) in self.expiry.due(now_ms)? {
            if inflight.expiry_in_flight(&key) || inflight.flush_in_flight(key.friend_code()) {
                continue;
            }

            let pending_clicks = self.clicks.get(key.friend_code())?.unwrap_or(0).max(0);
            let job = CleanupJob::Expire {
                key,
                entry,
                pending_clicks,
            };
            inflight.claim(&job);
            jobs.push(job);
        }

        if !jobs.is_empty() {
            debug!(partition = self.partition, due = jobs.len(), "Sweep claimed expired links");
        }

        Ok(jobs)
    }

    /// Apply the outcome of an expiry job
    pub fn complete(
        &self,
        key: &ExpiryKey,
        pending_clicks: i64,
        clicks_flushed: bool,
        result: &std::result::Result<(), CleanupError>,
    ) -> Result<()> {
        let friend_code = key.friend_code();

        if clicks_flushed {
            self.clicks.settle(friend_code, pending_clicks)?;
        }

        match result {
            Ok(()) => {
                self.expiry.delete(key)?;
                info!(
                    partition = self.partition,
                    friend_code = %friend_code,
                    expires_at = key.expires_at(),
                    flushed_clicks = if clicks_flushed { pending_clicks } else { 0 },
                    "Link expired"
                );
                metrics::counter!("streams.links.expired").increment(1);
            }
            Err(e) if e.is_permanent() => {
                self.expiry.delete(key)?;
                error!(
                    partition = self.partition,
                    friend_code = %friend_code,
                    error = %e,
                    "Dropping link that can never be expired"
                );
                metrics::counter!("streams.links.dropped").increment(1);
            }
            Err(e) => {
                warn!(
                    partition = self.partition,
                    friend_code = %friend_code,
                    error = %e,
                    "Expiry failed, retrying on next sweep"
                );
            }
        }

        Ok(())
    }

    pub fn tracked(&self) -> Result<usize> {
        self.expiry.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleanup::{execute, MockCleanupService};
    use crate::processor::ClickProcessor;
    use crate::store::StateStore;
    use friendlink_pipeline::ClickEvent;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use tempfile::{tempdir, TempDir};

    const CODE: &str = "9b2f6c1e-4a7d-4e0b-9a51-0c1d2e3f4a5b";

    fn open() -> (TempDir, StateStore) {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        (dir, store)
    }

    fn processor(store: &StateStore) -> UploadProcessor {
        UploadProcessor::new(0, store.expiry(), store.clicks())
    }

    fn upload(code: &str, expires_at: i64) -> UploadEvent {
        UploadEvent::new(code, format!("files/{}.pdf", code), 0, expires_at)
    }

    fn complete(
        processor: &UploadProcessor,
        job: &CleanupJob,
        flushed: bool,
        result: std::result::Result<(), CleanupError>,
    ) {
        match job {
            CleanupJob::Expire {
                key,
                pending_clicks,
                ..
            } => processor
                .complete(key, *pending_clicks, flushed, &result)
                .unwrap(),
            other => panic!("unexpected job {:?}", other),
        }
    }

    #[test]
    fn test_no_premature_expiry() {
        let (_dir, store) = open();
        let uploads = processor(&store);
        let mut inflight = InFlight::new();

        uploads.process(&upload(CODE, 1000), None).unwrap();

        assert!(uploads.sweep(999, &mut inflight).unwrap().is_empty());
        assert_eq!(uploads.sweep(1000, &mut inflight).unwrap().len(), 1);
    }

    #[test]
    fn test_in_flight_entry_is_not_resubmitted() {
        let (_dir, store) = open();
        let uploads = processor(&store);
        let mut inflight = InFlight::new();

        uploads.process(&upload(CODE, 1000), None).unwrap();

        let jobs = uploads.sweep(2000, &mut inflight).unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(uploads.sweep(3000, &mut inflight).unwrap().is_empty());

        inflight.release(&jobs[0]);
        assert_eq!(uploads.sweep(4000, &mut inflight).unwrap().len(), 1);
    }

    #[test]
    fn test_sweep_defers_entry_while_flush_in_flight() {
        let (_dir, store) = open();
        let uploads = processor(&store);
        let mut inflight = InFlight::new();

        uploads.process(&upload(CODE, 1000), None).unwrap();
        inflight.claim(&CleanupJob::FlushClicks {
            friend_code: CODE.to_string(),
            count: 2,
        });

        assert!(uploads.sweep(2000, &mut inflight).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_uploads_only_carry_clicks_once() {
        let (_dir, store) = open();
        let uploads = processor(&store);
        let mut inflight = InFlight::new();

        uploads.process(&upload(CODE, 1000), None).unwrap();
        uploads.process(&upload(CODE, 1500), None).unwrap();
        store.clicks().increment(CODE, None).unwrap();

        let jobs = uploads.sweep(2000, &mut inflight).unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(matches!(jobs[0], CleanupJob::Expire { pending_clicks: 1, .. }));
    }

    #[test]
    fn test_failed_expiry_keeps_entry() {
        let (_dir, store) = open();
        let uploads = processor(&store);
        let mut inflight = InFlight::new();

        uploads.process(&upload(CODE, 1000), None).unwrap();
        let jobs = uploads.sweep(2000, &mut inflight).unwrap();
        inflight.release(&jobs[0]);
        complete(
            &uploads,
            &jobs[0],
            false,
            Err(CleanupError::Storage("unavailable".to_string())),
        );

        assert_eq!(uploads.tracked().unwrap(), 1);
        assert_eq!(uploads.sweep(3000, &mut inflight).unwrap().len(), 1);
    }

    #[test]
    fn test_permanent_failure_drops_entry() {
        let (_dir, store) = open();
        let uploads = processor(&store);
        let mut inflight = InFlight::new();

        uploads.process(&upload("not-a-uuid", 1000), None).unwrap();
        let jobs = uploads.sweep(2000, &mut inflight).unwrap();
        complete(
            &uploads,
            &jobs[0],
            false,
            Err(CleanupError::InvalidFriendCode("not-a-uuid".to_string())),
        );

        assert_eq!(uploads.tracked().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clicks_flushed_before_expiry() {
        let (_dir, store) = open();
        let uploads = processor(&store);
        let clicks = ClickProcessor::new(0, store.clicks());
        let mut inflight = InFlight::new();

        uploads.process(&upload(CODE, 1000), None).unwrap();
        for clicked_at in [100, 200, 300] {
            clicks.process(&ClickEvent::new(CODE, clicked_at), None).unwrap();
        }

        let mut service = MockCleanupService::new();
        let mut seq = Sequence::new();
        service
            .expect_flush_click_count()
            .with(eq(CODE), eq(3))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        service
            .expect_handle_expiry()
            .withf(|code, storage_key| code == CODE && storage_key == format!("files/{}.pdf", CODE))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));

        let jobs = uploads.sweep(1020, &mut inflight).unwrap();
        assert_eq!(jobs.len(), 1);

        for job in jobs {
            let report = execute(&service, job).await;
            inflight.release(&report.job);
            complete(&uploads, &report.job, report.clicks_flushed, report.result);
        }

        assert_eq!(uploads.tracked().unwrap(), 0);
        assert_eq!(store.clicks().get(CODE).unwrap(), None);
        assert!(inflight.is_empty());
        assert!(uploads.sweep(2000, &mut inflight).unwrap().is_empty());
    }
}
