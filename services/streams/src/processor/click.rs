use super::InFlight;
use crate::cleanup::{CleanupError, CleanupJob};
use crate::store::{Checkpoint, ClickStore, Result};
use friendlink_pipeline::ClickEvent;
use tracing::{debug, error, warn};

/// Counts clicks locally and flushes them to the system of record in batches
pub struct ClickProcessor {
    partition: i32,
    clicks: ClickStore,
}

impl ClickProcessor {
    pub fn new(partition: i32, clicks: ClickStore) -> Self {
        Self { partition, clicks }
    }

    /// Count one click, returning the pending total for the link
    pub fn process(&self, event: &ClickEvent, checkpoint: Option<&Checkpoint>) -> Result<i64> {
        let count = self.clicks.increment(&event.friend_code, checkpoint)?;
        metrics::counter!("streams.clicks.counted").increment(1);
        Ok(count)
    }

    /// Claim a flush job for every pending counter with no flush running
    pub fn flush(&self, inflight: &mut InFlight) -> Result<Vec<CleanupJob>> {
        let mut jobs = Vec::new();

        for (friend_code, count) in self.clicks.all()? {
            if count <= 0 {
                self.clicks.delete(&friend_code)?;
                continue;
            }
            if inflight.flush_in_flight(&friend_code) {
                continue;
            }

            let job = CleanupJob::FlushClicks { friend_code, count };
            inflight.claim(&job);
            jobs.push(job);
        }

        if !jobs.is_empty() {
            debug!(partition = self.partition, counters = jobs.len(), "Flushing click counters");
        }

        Ok(jobs)
    }

    /// Apply the outcome of a flush job
    pub fn complete(
        &self,
        friend_code: &str,
        count: i64,
        result: &std::result::Result<(), CleanupError>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                let remaining = self.clicks.settle(friend_code, count)?;
                debug!(
                    partition = self.partition,
                    friend_code = %friend_code,
                    flushed = count,
                    remaining,
                    "Flushed clicks"
                );
                metrics::counter!("streams.clicks.flushed").increment(count as u64);
            }
            Err(e) if e.is_permanent() => {
                self.clicks.delete(friend_code)?;
                error!(
                    partition = self.partition,
                    friend_code = %friend_code,
                    error = %e,
                    "Dropping clicks that can never be flushed"
                );
            }
            Err(e) => {
                warn!(
                    partition = self.partition,
                    friend_code = %friend_code,
                    error = %e,
                    "Click flush failed, retrying on next tick"
                );
            }
        }
        Ok(())
    }

    pub fn pending(&self) -> Result<usize> {
        self.clicks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use tempfile::{tempdir, TempDir};

    fn open() -> (TempDir, ClickProcessor) {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let processor = ClickProcessor::new(0, store.clicks());
        (dir, processor)
    }

    fn click(code: &str) -> ClickEvent {
        ClickEvent::new(code, 0)
    }

    #[test]
    fn test_clicks_accumulate_into_one_flush() {
        let (_dir, clicks) = open();
        let mut inflight = InFlight::new();

        for _ in 0..5 {
            clicks.process(&click("a"), None).unwrap();
        }
        clicks.process(&click("b"), None).unwrap();

        let jobs = clicks.flush(&mut inflight).unwrap();
        assert_eq!(
            jobs,
            vec![
                CleanupJob::FlushClicks {
                    friend_code: "a".to_string(),
                    count: 5
                },
                CleanupJob::FlushClicks {
                    friend_code: "b".to_string(),
                    count: 1
                },
            ]
        );
        assert_eq!(inflight.flush_count(), 2);
    }

    #[test]
    fn test_clicks_during_flush_survive() {
        let (_dir, clicks) = open();
        let mut inflight = InFlight::new();

        for _ in 0..3 {
            clicks.process(&click("a"), None).unwrap();
        }
        let jobs = clicks.flush(&mut inflight).unwrap();

        // arrives while the flush of 3 is running
        clicks.process(&click("a"), None).unwrap();
        assert!(clicks.flush(&mut inflight).unwrap().is_empty());

        inflight.release(&jobs[0]);
        clicks.complete("a", 3, &Ok(())).unwrap();

        let jobs = clicks.flush(&mut inflight).unwrap();
        assert_eq!(
            jobs,
            vec![CleanupJob::FlushClicks {
                friend_code: "a".to_string(),
                count: 1
            }]
        );
    }

    #[test]
    fn test_failed_flush_keeps_counter() {
        let (_dir, clicks) = open();
        let mut inflight = InFlight::new();

        clicks.process(&click("a"), None).unwrap();
        clicks.process(&click("a"), None).unwrap();
        let jobs = clicks.flush(&mut inflight).unwrap();
        inflight.release(&jobs[0]);
        clicks
            .complete("a", 2, &Err(CleanupError::Storage("down".to_string())))
            .unwrap();

        assert_eq!(clicks.pending().unwrap(), 1);
        assert_eq!(clicks.flush(&mut inflight).unwrap(), jobs);
    }

    #[test]
    fn test_permanent_failure_drops_counter() {
        let (_dir, clicks) = open();

        clicks.process(&click("bad"), None).unwrap();
        clicks
            .complete(
                "bad",
                1,
                &Err(CleanupError::InvalidFriendCode("bad".to_string())),
            )
            .unwrap();

        assert_eq!(clicks.pending().unwrap(), 0);
    }

    #[test]
    fn test_successful_flush_empties_store() {
        let (_dir, clicks) = open();
        let mut inflight = InFlight::new();

        clicks.process(&click("a"), None).unwrap();
        let jobs = clicks.flush(&mut inflight).unwrap();
        inflight.release(&jobs[0]);
        clicks.complete("a", 1, &Ok(())).unwrap();

        assert_eq!(clicks.pending().unwrap(), 0);
        assert!(clicks.flush(&mut inflight).unwrap().is_empty());
    }
}
