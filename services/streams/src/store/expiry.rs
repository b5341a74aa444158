use super::{column_family, stage_checkpoint, Checkpoint, Db, Result, StoreError, EXPIRY_CF};
use friendlink_pipeline::MAX_EXPIRY_MILLIS;
use rocksdb::{IteratorMode, ReadOptions, WriteBatch};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Width of the zero-padded expiry timestamp prefix
pub const KEY_TIMESTAMP_WIDTH: usize = 16;
pub const KEY_SEPARATOR: char = '_';

/// Composite key `<16-digit expiresAt>_<friendCode>`.
///
/// Byte order of encoded keys equals the derived `Ord` of this struct: the
/// padded prefix orders by expiry time, the friend code breaks ties.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExpiryKey {
    expires_at: i64,
    friend_code: String,
}

impl ExpiryKey {
    pub fn new(expires_at: i64, friend_code: impl Into<String>) -> Result<Self> {
        if !(0..=MAX_EXPIRY_MILLIS).contains(&expires_at) {
            return Err(StoreError::InvalidKey(format!(
                "expiry {} does not fit in {} digits",
                expires_at, KEY_TIMESTAMP_WIDTH
            )));
        }
        let friend_code = friend_code.into();
        if friend_code.is_empty() {
            return Err(StoreError::InvalidKey("empty friend code".to_string()));
        }
        Ok(Self {
            expires_at,
            friend_code,
        })
    }

    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    pub fn friend_code(&self) -> &str {
        &self.friend_code
    }

    pub fn encode(&self) -> String {
        format!(
            "{:0width$}{}{}",
            self.expires_at,
            KEY_SEPARATOR,
            self.friend_code,
            width = KEY_TIMESTAMP_WIDTH
        )
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw = std::str::from_utf8(bytes)
            .map_err(|_| StoreError::InvalidKey(String::from_utf8_lossy(bytes).into_owned()))?;

        let invalid = || StoreError::InvalidKey(raw.to_string());

        let timestamp = raw.get(..KEY_TIMESTAMP_WIDTH).ok_or_else(invalid)?;
        let rest = raw.get(KEY_TIMESTAMP_WIDTH..).ok_or_else(invalid)?;
        let friend_code = rest.strip_prefix(KEY_SEPARATOR).ok_or_else(invalid)?;
        if !timestamp.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let expires_at = timestamp.parse().map_err(|_| invalid())?;

        Self::new(expires_at, friend_code)
    }

    /// Exclusive upper bound of a scan returning every key due at `now_ms`.
    ///
    /// `None` when `now_ms` is past the representable range, meaning every key
    /// is due.
    pub fn due_bound(now_ms: i64) -> Option<Vec<u8>> {
        if now_ms >= MAX_EXPIRY_MILLIS {
            return None;
        }
        let next = now_ms.max(-1) + 1;
        Some(format!("{:0width$}", next, width = KEY_TIMESTAMP_WIDTH).into_bytes())
    }
}

impl fmt::Display for ExpiryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Value stored for every tracked link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpiryEntry {
    pub friend_code: String,
    pub storage_key: String,
}

/// Ordered map from expiry key to link, range-scanned by the sweep
#[derive(Clone)]
pub struct ExpiryStore {
    db: Arc<Db>,
}

impl ExpiryStore {
    pub(crate) fn new(db: Arc<Db>) -> Self {
        Self { db }
    }

    /// Upsert an entry, recording `checkpoint` in the same batch
    pub fn put(
        &self,
        key: &ExpiryKey,
        entry: &ExpiryEntry,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<()> {
        let cf = column_family(&self.db, EXPIRY_CF)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, key.encode(), serde_json::to_vec(entry)?);
        stage_checkpoint(&self.db, &mut batch, checkpoint)?;
        self.db.write(batch)?;
        Ok(())
    }

    pub fn get(&self, key: &ExpiryKey) -> Result<Option<ExpiryEntry>> {
        let cf = column_family(&self.db, EXPIRY_CF)?;
        match self.db.get_cf(&cf, key.encode())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, key: &ExpiryKey) -> Result<()> {
        let cf = column_family(&self.db, EXPIRY_CF)?;
        self.db.delete_cf(&cf, key.encode())?;
        Ok(())
    }

    /// All entries with `expiresAt <= now_ms`, in key order
    pub fn due(&self, now_ms: i64) -> Result<Vec<(ExpiryKey, ExpiryEntry)>> {
        if now_ms < 0 {
            return Ok(Vec::new());
        }

        let cf = column_family(&self.db, EXPIRY_CF)?;
        let mut options = ReadOptions::default();
        if let Some(bound) = ExpiryKey::due_bound(now_ms) {
            options.set_iterate_upper_bound(bound);
        }

        let mut due = Vec::new();
        for item in self.db.iterator_cf_opt(&cf, options, IteratorMode::Start) {
            let (key, value) = item?;
            let key = ExpiryKey::decode(&key)?;
            let entry: ExpiryEntry = serde_json::from_slice(&value)?;
            due.push((key, entry));
        }
        Ok(due)
    }

    /// Number of tracked entries
    pub fn len(&self) -> Result<usize> {
        let cf = column_family(&self.db, EXPIRY_CF)?;
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StateStore;
    use tempfile::tempdir;

    fn entry(code: &str) -> ExpiryEntry {
        ExpiryEntry {
            friend_code: code.to_string(),
            storage_key: format!("2024-01-15/{}.pdf", code),
        }
    }

    fn put(store: &ExpiryStore, expires_at: i64, code: &str) -> ExpiryKey {
        let key = ExpiryKey::new(expires_at, code).unwrap();
        store.put(&key, &entry(code), None).unwrap();
        key
    }

    #[test]
    fn test_key_encoding() {
        let key = ExpiryKey::new(1000, "abc").unwrap();
        assert_eq!(key.encode(), "0000000000001000_abc");
        assert_eq!(ExpiryKey::decode(key.encode().as_bytes()).unwrap(), key);
    }

    #[test]
    fn test_key_decode_rejects_garbage() {
        assert!(ExpiryKey::decode(b"short").is_err());
        assert!(ExpiryKey::decode(b"00000000000010x0_abc").is_err());
        assert!(ExpiryKey::decode(b"0000000000001000-abc").is_err());
        assert!(ExpiryKey::decode(b"0000000000001000_").is_err());
    }

    #[test]
    fn test_key_rejects_out_of_range() {
        assert!(ExpiryKey::new(-1, "abc").is_err());
        assert!(ExpiryKey::new(MAX_EXPIRY_MILLIS + 1, "abc").is_err());
        assert!(ExpiryKey::new(MAX_EXPIRY_MILLIS, "abc").is_ok());
    }

    #[test]
    fn test_encoded_order_matches_time_order() {
        let mut keys = vec![
            ExpiryKey::new(10_000, "a").unwrap(),
            ExpiryKey::new(9, "z").unwrap(),
            ExpiryKey::new(1_000, "b").unwrap(),
            ExpiryKey::new(1_000, "a").unwrap(),
        ];
        let mut encoded: Vec<String> = keys.iter().map(ExpiryKey::encode).collect();
        keys.sort();
        encoded.sort();

        let decoded: Vec<ExpiryKey> = encoded
            .iter()
            .map(|k| ExpiryKey::decode(k.as_bytes()).unwrap())
            .collect();
        assert_eq!(decoded, keys);
        assert_eq!(keys[0].expires_at(), 9);
    }

    #[test]
    fn test_due_includes_ties_at_now() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap().expiry();

        put(&store, 999, "early");
        let at_now = put(&store, 1000, "~tilde-sorts-high");
        put(&store, 1001, "late");

        let due = store.due(1000).unwrap();
        let codes: Vec<&str> = due.iter().map(|(k, _)| k.friend_code()).collect();
        assert_eq!(codes, vec!["early", "~tilde-sorts-high"]);
        assert_eq!(due[1].0, at_now);
        assert_eq!(due[1].1, entry("~tilde-sorts-high"));
    }

    #[test]
    fn test_due_before_first_expiry_is_empty() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap().expiry();

        put(&store, 5_000, "code");
        assert!(store.due(4_999).unwrap().is_empty());
        assert!(store.due(-1).unwrap().is_empty());
        assert_eq!(store.due(i64::MAX).unwrap().len(), 1);
    }

    #[test]
    fn test_put_is_upsert_and_delete_removes() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap().expiry();

        let key = put(&store, 1000, "code");
        let replacement = ExpiryEntry {
            friend_code: "code".to_string(),
            storage_key: "other.pdf".to_string(),
        };
        store.put(&key, &replacement, None).unwrap();

        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.get(&key).unwrap(), Some(replacement));

        store.delete(&key).unwrap();
        assert!(store.is_empty().unwrap());
        assert_eq!(store.get(&key).unwrap(), None);
    }

    #[test]
    fn test_same_code_different_expiry_are_independent() {
        let dir = tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap().expiry();

        put(&store, 1000, "code");
        put(&store, 2000, "code");

        assert_eq!(store.len().unwrap(), 2);
        assert_eq!(store.due(1500).unwrap().len(), 1);
    }
}
