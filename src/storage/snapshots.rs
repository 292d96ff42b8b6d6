//! Capacity snapshot table.
//!
//! Snapshots are keyed by an insertion sequence, not by their timestamp, so
//! a snapshot that arrives late still gets a fresh sequence and is pushed to
//! feed subscribers exactly once.

use chrono::{DateTime, Utc};
use std::sync::Mutex;

use super::{decode_seq, StorageError};
use crate::types::ProviderSnapshot;

pub struct SnapshotStore {
    tree: sled::Tree,
    next_seq: Mutex<u64>,
}

impl SnapshotStore {
    pub(super) fn open(db: &sled::Db) -> Result<Self, StorageError> {
        let tree = db.open_tree("snapshots")?;
        let next_seq = match tree.last()? {
            Some((key, _)) => decode_seq(&key, "snapshots")? + 1,
            None => 1,
        };
        Ok(Self {
            tree,
            next_seq: Mutex::new(next_seq),
        })
    }

    /// Persist a snapshot, assigning its sequence number.
    pub fn append(&self, snapshot: &mut ProviderSnapshot) -> Result<u64, StorageError> {
        let mut next_seq = self.next_seq.lock().unwrap_or_else(|e| e.into_inner());
        snapshot.seq = *next_seq;
        let value = serde_json::to_vec(&*snapshot)?;
        self.tree.insert(snapshot.seq.to_be_bytes(), value)?;
        *next_seq += 1;
        Ok(snapshot.seq)
    }

    /// Snapshots with a sequence greater than `seq`, oldest first.
    pub fn after(&self, seq: u64, limit: usize) -> Result<Vec<ProviderSnapshot>, StorageError> {
        let start = seq.saturating_add(1).to_be_bytes();
        let mut out = Vec::new();
        for item in self.tree.range(start..) {
            if out.len() >= limit {
                break;
            }
            let (_key, value) = item?;
            out.push(serde_json::from_slice(&value)?);
        }
        Ok(out)
    }

    /// Snapshots taken within `[start, end)`, optionally for one provider,
    /// ordered by `taken_at`.
    pub fn between(
        &self,
        provider_id: Option<&str>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ProviderSnapshot>, StorageError> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (_key, value) = item?;
            let snapshot: ProviderSnapshot = match serde_json::from_slice(&value) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping undecodable snapshot row");
                    continue;
                }
            };
            if snapshot.taken_at < start || snapshot.taken_at >= end {
                continue;
            }
            if provider_id.is_some_and(|p| p != snapshot.provider_id) {
                continue;
            }
            out.push(snapshot);
        }
        out.sort_by_key(|s| (s.taken_at, s.seq));
        Ok(out)
    }

    pub fn head_seq(&self) -> u64 {
        self.next_seq
            .lock()
            .map_or_else(|e| *e.into_inner(), |guard| *guard)
            .saturating_sub(1)
    }

    /// Delete snapshots taken before `cutoff`.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut keys_to_delete = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item?;
            match serde_json::from_slice::<ProviderSnapshot>(&value) {
                Ok(s) if s.taken_at < cutoff => keys_to_delete.push(key),
                Ok(_) => {}
                // Corrupted entries go too
                Err(_) => keys_to_delete.push(key),
            }
        }

        let deleted = keys_to_delete.len();
        for key in keys_to_delete {
            self.tree.remove(key)?;
        }
        if deleted > 0 {
            self.tree.flush()?;
            tracing::info!(deleted, "Pruned old capacity snapshots");
        }
        Ok(deleted)
    }

    pub fn count(&self) -> usize {
        self.tree.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::types::LoadedModel;
    use chrono::Duration;

    fn snapshot(provider: &str, taken_at: DateTime<Utc>, used_mb: u64) -> ProviderSnapshot {
        ProviderSnapshot {
            provider_id: provider.to_string(),
            seq: 0,
            taken_at,
            total_mb: 8000,
            used_mb,
            loaded: vec![LoadedModel { model_id: "llama".into(), used_mb }],
        }
    }

    #[test]
    fn test_late_snapshot_gets_fresh_sequence() {
        let storage = Storage::temporary().unwrap();
        let store = storage.snapshots().unwrap();
        let now = Utc::now();

        let first = store.append(&mut snapshot("gpu", now, 100)).unwrap();
        // Arrives after, but was taken earlier.
        let late = store.append(&mut snapshot("gpu", now - Duration::minutes(1), 50)).unwrap();
        assert!(late > first);

        let fresh = store.after(first, 10).unwrap();
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].used_mb, 50);
        assert!(store.after(late, 10).unwrap().is_empty());
    }

    #[test]
    fn test_between_filters_and_orders() {
        let storage = Storage::temporary().unwrap();
        let store = storage.snapshots().unwrap();
        let now = Utc::now();

        store.append(&mut snapshot("gpu", now, 300)).unwrap();
        store.append(&mut snapshot("gpu", now - Duration::minutes(2), 100)).unwrap();
        store.append(&mut snapshot("other", now, 999)).unwrap();

        let rows = store
            .between(Some("gpu"), now - Duration::minutes(10), now + Duration::seconds(1))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].used_mb, 100);
        assert_eq!(rows[1].used_mb, 300);
    }

    #[test]
    fn test_prune_before() {
        let storage = Storage::temporary().unwrap();
        let store = storage.snapshots().unwrap();
        let now = Utc::now();

        store.append(&mut snapshot("gpu", now - Duration::days(10), 1)).unwrap();
        store.append(&mut snapshot("gpu", now, 2)).unwrap();

        assert_eq!(store.prune_before(now - Duration::days(7)).unwrap(), 1);
        assert_eq!(store.count(), 1);
    }
}
