use super::{column_family, decode_i64, stage_checkpoint, Checkpoint, Db, Result, CLICK_CF};
use rocksdb::{IteratorMode, WriteBatch};
use std::sync::Arc;

/// Pending click counters keyed by friend code.
///
/// A counter holds clicks seen since the last confirmed flush. It never holds
/// zero: a counter that reaches zero or below is deleted.
#[derive(Clone)]
pub struct ClickStore {
    db: Arc<Db>,
}

impl ClickStore {
    pub(crate) fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    pub fn get(&self, friend_code: &str) -> Result<Option<i64>> {
        let cf = column_family(&self.db, CLICK_CF)?;
        self.db
            .get_cf(&cf, friend_code.as_bytes())?
            .map(|bytes| decode_i64(friend_code, &bytes))
            .transpose()
    }

    /// Add one click, returning the new count
    pub fn increment(&self, friend_code: &str, checkpoint: Option<&Checkpoint>) -> Result<i64> {
        let count = self.get(friend_code)?.unwrap_or(0).saturating_add(1);

        let cf = column_family(&self.db, CLICK_CF)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, friend_code.as_bytes(), count.to_be_bytes());
        stage_checkpoint(&self.db, &mut batch, checkpoint)?;
        self.db.write(batch)?;

        Ok(count)
    }

    /// Subtract a confirmed flush from the counter, returning what remains.
    ///
    /// Clicks that arrived while the flush was running are kept.
    pub fn settle(&self, friend_code: &str, flushed: i64) -> Result<i64> {
        let remaining = self.get(friend_code)?.unwrap_or(0).saturating_sub(flushed);

        let cf = column_family(&self.db, CLICK_CF)?;
        if remaining > 0 {
            self.db
                .put_cf(&cf, friend_code.as_bytes(), remaining.to_be_bytes())?;
        } else {
            self.db.delete_cf(&cf, friend_code.as_bytes())?;
        }

        Ok(remaining.max(0))
    }

    pub fn delete(&self, friend_code: &str) -> Result<()> {
        let cf = column_family(&self.db, CLICK_CF)?;
        self.db.delete_cf(&cf, friend_code.as_bytes())?;
        Ok(())
    }

    /// Snapshot of every counter
    pub fn all(&self) -> Result<Vec<(String, i64)>> {
        let cf = column_family(&self.db, CLICK_CF)?;
        let mut counters = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, value) = item?;
            let friend_code = String::from_utf8_lossy(&key).into_owned();
            let count = decode_i64(&friend_code, &value)?;
            counters.push((friend_code, count));
        }
        Ok(counters)
    }

    pub fn len(&self) -> Result<usize> {
        let cf = column_family(&self.db, CLICK_CF)?;
        let mut count = 0;
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
