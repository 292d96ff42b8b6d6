//! Persistent storage using Sled DB.
//!
//! One sled database holds every table the scheduler persists:
//! - catalog tables (`providers`, `models`, `policies`)
//! - the request ledger (`ledger_journal`, `ledger_requests`, `ledger_by_enqueue`)
//! - capacity snapshots (`snapshots`)
//!
//! Keys that must sort chronologically or by sequence are big-endian `u64`.

pub mod catalog;
pub mod ledger;
pub mod snapshots;

pub use catalog::CatalogRepository;
pub use ledger::SledLedgerStore;
pub use snapshots::SnapshotStore;

use std::path::Path;

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("corrupt key in tree '{0}'")]
    CorruptKey(&'static str),
}

/// Handle to the scheduler's sled database.
#[derive(Clone)]
pub struct Storage {
    db: sled::Db,
}

impl Storage {
    /// Open or create the database at the specified path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path_ref = path.as_ref();
        let db = sled::open(path_ref)?;
        tracing::info!(path = ?path_ref, "Storage opened");
        Ok(Self { db })
    }

    /// Throwaway database removed on drop.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    pub fn catalog(&self) -> Result<CatalogRepository, StorageError> {
        CatalogRepository::open(&self.db)
    }

    pub fn ledger(&self) -> Result<SledLedgerStore, StorageError> {
        SledLedgerStore::open(&self.db)
    }

    pub fn snapshots(&self) -> Result<SnapshotStore, StorageError> {
        SnapshotStore::open(&self.db)
    }

    /// Flush pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

/// Decode a big-endian `u64` key.
pub(crate) fn decode_seq(key: &[u8], tree: &'static str) -> Result<u64, StorageError> {
    let bytes: [u8; 8] = key
        .get(..8)
        .and_then(|k| k.try_into().ok())
        .ok_or(StorageError::CorruptKey(tree))?;
    Ok(u64::from_be_bytes(bytes))
}

/// Nanosecond timestamp key, clamped to zero for pre-epoch times.
pub(crate) fn time_key(ts: chrono::DateTime<chrono::Utc>) -> [u8; 8] {
    let nanos = ts
        .timestamp_nanos_opt()
        .unwrap_or_else(|| ts.timestamp().saturating_mul(1_000_000_000));
    u64::try_from(nanos).unwrap_or(0).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_storage_open() {
        let temp_dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        storage.flush().unwrap();
        assert!(storage.catalog().is_ok());
    }

    #[test]
    fn test_time_keys_sort_chronologically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 1).unwrap();
        assert!(time_key(early) < time_key(late));
        assert_eq!(decode_seq(&42u64.to_be_bytes(), "t").unwrap(), 42);
        assert!(decode_seq(&[1, 2], "t").is_err());
    }
}
