//! Stats Projector - read-side views over the ledger and capacity history.
//!
//! - **Pull**: [`StatsProjector::requests`] and [`StatsProjector::capacity_day`]
//!   aggregate an arbitrary range into friendly-width buckets.
//! - **Push**: [`StatsProjector::latest_since`] and
//!   [`StatsProjector::capacity_since`] return deltas past a cursor; the API's
//!   feed socket drives them on independent cadences.
//!
//! Nothing here touches dispatch state.

pub mod aggregate;
pub mod buckets;
pub mod capacity;
pub mod feed;

pub use aggregate::{aggregate_requests, DepthPercentiles, ModelBreakdown, RequestBucket, RequestStats, StartSplit};
pub use buckets::{nice_width_secs, BucketPlan};
pub use capacity::{capacity_for_day, day_bounds, CapacityDay, CapacityPoint, ProviderCapacitySeries};
pub use feed::{FeedCursors, FeedMessage, FeedStream};

use chrono::{DateTime, NaiveDate, Utc};
use std::sync::Arc;
use thiserror::Error;

use crate::config::defaults::MAX_BUCKETS;
use crate::ledger::{EventLedger, LedgerError};
use crate::storage::{SnapshotStore, StorageError};

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct StatsProjector {
    ledger: Arc<EventLedger>,
    snapshots: Option<Arc<SnapshotStore>>,
}

impl StatsProjector {
    pub fn new(ledger: Arc<EventLedger>, snapshots: Option<Arc<SnapshotStore>>) -> Self {
        Self { ledger, snapshots }
    }

    fn check_buckets(buckets: u32) -> Result<(), StatsError> {
        if buckets == 0 || buckets > MAX_BUCKETS {
            return Err(StatsError::InvalidRange(format!(
                "buckets must be between 1 and {MAX_BUCKETS}, got {buckets}"
            )));
        }
        Ok(())
    }

    /// Request aggregates for requests enqueued in `[start, end)`, with
    /// capacity averages joined from the snapshot history.
    pub fn requests(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        buckets: u32,
    ) -> Result<RequestStats, StatsError> {
        if end <= start {
            return Err(StatsError::InvalidRange("end must be after start".into()));
        }
        Self::check_buckets(buckets)?;

        let events = self.ledger.events_between(start, end)?;
        let snapshots = match &self.snapshots {
            Some(store) => store.between(None, start, end)?,
            None => Vec::new(),
        };
        Ok(aggregate_requests(&events, &snapshots, start, end, buckets))
    }

    pub fn capacity_day(
        &self,
        day: NaiveDate,
        provider_id: Option<&str>,
        buckets: u32,
    ) -> Result<CapacityDay, StatsError> {
        Self::check_buckets(buckets)?;
        let (start, end) = day_bounds(day);
        let snapshots = match &self.snapshots {
            Some(store) => store.between(provider_id, start, end)?,
            None => Vec::new(),
        };
        Ok(capacity_for_day(&snapshots, day, buckets))
    }

    /// Ledger rows recorded after `cursor`. The returned cursor is the last
    /// row's sequence, or `cursor` itself when nothing is new.
    pub fn latest_since(&self, cursor: u64, limit: usize) -> Result<FeedMessage, StatsError> {
        let entries = self.ledger.entries_after(cursor, limit)?;
        let next = entries.last().map_or(cursor, |e| e.seq);
        Ok(FeedMessage::Latest {
            cursor: next,
            events: entries.into_iter().map(|e| e.event).collect(),
        })
    }

    /// Snapshot rows stored after `cursor`.
    pub fn capacity_since(&self, cursor: u64, limit: usize) -> Result<FeedMessage, StatsError> {
        let snapshots = match &self.snapshots {
            Some(store) => store.after(cursor, limit)?,
            None => Vec::new(),
        };
        let next = snapshots.last().map_or(cursor, |s| s.seq);
        Ok(FeedMessage::Capacity { cursor: next, snapshots })
    }

    /// Current head of each stream, for clients that only want new data.
    pub fn heads(&self) -> FeedCursors {
        FeedCursors {
            latest: self.ledger.head_seq(),
            capacity: self.snapshots.as_ref().map_or(0, |s| s.head_seq()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::RetryPolicy;
    use crate::storage::Storage;
    use crate::types::{EventSeed, ProviderSnapshot, RejectReason, RequestEvent};
    use chrono::Duration;

    fn projector() -> (StatsProjector, Arc<EventLedger>, Arc<SnapshotStore>) {
        let storage = Storage::temporary().unwrap();
        let (ledger, _worker) = EventLedger::new(Arc::new(storage.ledger().unwrap()), RetryPolicy::default());
        let snapshots = Arc::new(storage.snapshots().unwrap());
        (
            StatsProjector::new(Arc::clone(&ledger), Some(Arc::clone(&snapshots))),
            ledger,
            snapshots,
        )
    }

    fn rejected(id: &str) -> RequestEvent {
        RequestEvent::rejected(
            EventSeed {
                request_id: id.to_string(),
                policy_id: None,
                topic: "nothing".into(),
                priority: 0,
                timeout_secs: None,
                failover_of: None,
            },
            RejectReason::NoMatchingPolicy,
            Utc::now(),
        )
    }

    #[test]
    fn test_latest_feed_delivers_each_row_once() {
        let (projector, ledger, _) = projector();
        ledger.record(&rejected("a")).unwrap();
        ledger.record(&rejected("b")).unwrap();

        let first = projector.latest_since(0, 10).unwrap();
        assert_eq!(first.cursor(), 2);
        ledger.record(&rejected("c")).unwrap();

        let FeedMessage::Latest { cursor, events } = projector.latest_since(first.cursor(), 10).unwrap() else {
            panic!("wrong stream");
        };
        assert_eq!(cursor, 3);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_id, "c");

        let idle = projector.latest_since(cursor, 10).unwrap();
        assert!(idle.is_empty());
        assert_eq!(idle.cursor(), 3);
    }

    #[test]
    fn test_late_snapshot_is_still_delivered() {
        let (projector, _, snapshots) = projector();
        let now = Utc::now();
        let mut fresh = ProviderSnapshot {
            provider_id: "gpu".into(),
            seq: 0,
            taken_at: now,
            total_mb: 8000,
            used_mb: 100,
            loaded: vec![],
        };
        snapshots.append(&mut fresh).unwrap();
        let cursor = projector.capacity_since(0, 10).unwrap().cursor();

        let mut late = ProviderSnapshot {
            taken_at: now - Duration::minutes(5),
            ..fresh.clone()
        };
        snapshots.append(&mut late).unwrap();

        let delta = projector.capacity_since(cursor, 10).unwrap();
        assert_eq!(delta.cursor(), 2);
        assert!(!delta.is_empty());
    }

    #[test]
    fn test_rejects_bad_ranges() {
        let (projector, _, _) = projector();
        let now = Utc::now();
        assert!(matches!(
            projector.requests(now, now, 10),
            Err(StatsError::InvalidRange(_))
        ));
        assert!(projector.requests(now - Duration::hours(1), now, 0).is_err());
        assert!(projector.requests(now - Duration::hours(1), now, 24).is_ok());
    }
}
