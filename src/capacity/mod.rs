//! Capacity Monitor - the latest capacity and quota view per provider.
//!
//! The [`SnapshotBoard`] holds one immutable snapshot per provider behind an
//! `ArcSwap`, so a reader sees either the old snapshot or the new one, never
//! a half-written mix. Every replacement is announced on a broadcast channel
//! that the dispatch trigger listens to.

pub mod monitor;
pub mod probe;

pub use monitor::{run_snapshot_retention, MonitorSupervisor};
pub use probe::{quota_from_headers, CapacityProbe, HttpProbe, ProbeError, ProbeReading};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::types::{ProviderId, ProviderSnapshot, QuotaSnapshot};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Announcement that a provider's view changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityChange {
    Capacity(ProviderId),
    Quota(ProviderId),
    Removed(ProviderId),
}

impl CapacityChange {
    pub fn provider_id(&self) -> &str {
        match self {
            Self::Capacity(id) | Self::Quota(id) | Self::Removed(id) => id,
        }
    }
}

type SnapshotMap<T> = HashMap<ProviderId, Arc<T>>;

/// Latest snapshots, replaced atomically per provider.
pub struct SnapshotBoard {
    capacity: ArcSwap<SnapshotMap<ProviderSnapshot>>,
    quota: ArcSwap<SnapshotMap<QuotaSnapshot>>,
    changes: broadcast::Sender<CapacityChange>,
}

impl Default for SnapshotBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotBoard {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            capacity: ArcSwap::from_pointee(HashMap::new()),
            quota: ArcSwap::from_pointee(HashMap::new()),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CapacityChange> {
        self.changes.subscribe()
    }

    /// Replace the provider's capacity snapshot. A snapshot older than the
    /// one already published is ignored.
    pub fn publish_capacity(&self, snapshot: ProviderSnapshot) -> bool {
        let provider_id = snapshot.provider_id.clone();
        let snapshot = Arc::new(snapshot);
        let mut accepted = false;
        self.capacity.rcu(|current| {
            let newer = current
                .get(&provider_id)
                .map_or(true, |prev| prev.taken_at <= snapshot.taken_at);
            accepted = newer;
            let mut next = HashMap::clone(current);
            if newer {
                next.insert(provider_id.clone(), Arc::clone(&snapshot));
            }
            next
        });
        if accepted {
            // No subscribers is fine.
            let _ = self.changes.send(CapacityChange::Capacity(provider_id));
        }
        accepted
    }

    /// Replace the provider's quota snapshot under the same rule.
    pub fn publish_quota(&self, snapshot: QuotaSnapshot) -> bool {
        let provider_id = snapshot.provider_id.clone();
        let snapshot = Arc::new(snapshot);
        let mut accepted = false;
        self.quota.rcu(|current| {
            let newer = current
                .get(&provider_id)
                .map_or(true, |prev| prev.taken_at <= snapshot.taken_at);
            accepted = newer;
            let mut next = HashMap::clone(current);
            if newer {
                next.insert(provider_id.clone(), Arc::clone(&snapshot));
            }
            next
        });
        if accepted {
            let _ = self.changes.send(CapacityChange::Quota(provider_id));
        }
        accepted
    }

    pub fn remove(&self, provider_id: &str) {
        self.capacity.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(provider_id);
            next
        });
        self.quota.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(provider_id);
            next
        });
        let _ = self.changes.send(CapacityChange::Removed(provider_id.to_string()));
    }

    pub fn capacity(&self, provider_id: &str) -> Option<Arc<ProviderSnapshot>> {
        self.capacity.load().get(provider_id).cloned()
    }

    pub fn quota(&self, provider_id: &str) -> Option<Arc<QuotaSnapshot>> {
        self.quota.load().get(provider_id).cloned()
    }

    /// Age of every published snapshot, oldest first.
    pub fn ages(&self, now: DateTime<Utc>) -> Vec<SnapshotAge> {
        let mut ages: Vec<SnapshotAge> = self
            .capacity
            .load()
            .values()
            .map(|s| SnapshotAge::new(&s.provider_id, "capacity", s.taken_at, now))
            .chain(
                self.quota
                    .load()
                    .values()
                    .map(|s| SnapshotAge::new(&s.provider_id, "quota", s.taken_at, now)),
            )
            .collect();
        ages.sort_by(|a, b| b.age_secs.cmp(&a.age_secs).then(a.provider_id.cmp(&b.provider_id)));
        ages
    }
}

/// How old a provider's latest snapshot is.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotAge {
    pub provider_id: ProviderId,
    pub kind: &'static str,
    pub taken_at: DateTime<Utc>,
    pub age_secs: i64,
}

impl SnapshotAge {
    fn new(provider_id: &str, kind: &'static str, taken_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            provider_id: provider_id.to_string(),
            kind,
            taken_at,
            age_secs: (now - taken_at).num_seconds().max(0),
        }
    }
}
