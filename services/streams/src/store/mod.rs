//! Per-partition local state.
//!
//! Every partition owns one RocksDB database with three column families:
//!
//! - `expiry-store`: composite expiry key to `{friendCode, storageKey}`
//! - `click-store`: friend code to pending click counter
//! - `source-offsets`: topic name to last applied record offset
//!
//! Store mutations caused by a record are written in the same batch as that
//! record's offset, so a redelivered record can be recognised and skipped.

mod clicks;
mod expiry;

pub use clicks::ClickStore;
pub use expiry::{ExpiryEntry, ExpiryKey, ExpiryStore, KEY_SEPARATOR, KEY_TIMESTAMP_WIDTH};

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options, WriteBatch,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub const EXPIRY_CF: &str = "expiry-store";
pub const CLICK_CF: &str = "click-store";
pub const OFFSETS_CF: &str = "source-offsets";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("rocksdb error: {0}")]
    Rocks(#[from] rocksdb::Error),

    #[error("column family {0} is missing")]
    MissingColumnFamily(&'static str),

    #[error("corrupt value under key {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid expiry key: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub(crate) type Db = DBWithThreadMode<MultiThreaded>;

/// Position of the record that caused a store mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub topic: String,
    pub offset: i64,
}

impl Checkpoint {
    pub fn new(topic: impl Into<String>, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            offset,
        }
    }
}

/// The RocksDB database backing one partition
pub struct StateStore {
    db: Arc<Db>,
    path: PathBuf,
}

impl StateStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);

        let families = [EXPIRY_CF, CLICK_CF, OFFSETS_CF]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()));

        let db = Db::open_cf_descriptors(&options, path, families)?;

        info!(path = %path.display(), "Opened partition state store");

        Ok(Self {
            db: Arc::new(db),
            path: path.to_path_buf(),
        })
    }

    pub fn expiry(&self) -> ExpiryStore {
        ExpiryStore::new(self.db.clone())
    }

    pub fn clicks(&self) -> ClickStore {
        ClickStore::new(self.db.clone())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last applied offset for `topic`, if any record from it was applied
    pub fn applied_offset(&self, topic: &str) -> Result<Option<i64>> {
        let cf = column_family(&self.db, OFFSETS_CF)?;
        self.db
            .get_cf(&cf, topic.as_bytes())?
            .map(|bytes| decode_i64(topic, &bytes))
            .transpose()
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<()> {
        for name in [EXPIRY_CF, CLICK_CF, OFFSETS_CF] {
            self.db.flush_cf(&column_family(&self.db, name)?)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn put_raw(&self, family: &'static str, key: &[u8], value: &[u8]) -> Result<()> {
        let cf = column_family(&self.db, family)?;
        self.db.put_cf(&cf, key, value)?;
        Ok(())
    }
}

pub(crate) fn column_family<'a>(
    db: &'a Db,
    name: &'static str,
) -> Result<Arc<BoundColumnFamily<'a>>> {
    db.cf_handle(name).ok_or(StoreError::MissingColumnFamily(name))
}

/// Add the checkpoint write to a batch
pub(crate) fn stage_checkpoint(
    db: &Db,
    batch: &mut WriteBatch,
    checkpoint: Option<&Checkpoint>,
) -> Result<()> {
    if let Some(checkpoint) = checkpoint {
        let cf = column_family(db, OFFSETS_CF)?;
        batch.put_cf(&cf, checkpoint.topic.as_bytes(), checkpoint.offset.to_be_bytes());
    }
    Ok(())
}

pub(crate) fn decode_i64(key: &str, bytes: &[u8]) -> Result<i64> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("expected 8 bytes, found {}", bytes.len()),
    })?;
    Ok(i64::from_be_bytes(array))
}
