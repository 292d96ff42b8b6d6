//! Event Ledger - append-only record of request lifecycle transitions.
//!
//! The ledger is the system of record for analytics, but it is never allowed
//! to stall dispatch. A write that fails is handed to a background retry
//! worker; while that worker still holds rows, later rows queue behind them
//! so per-request order is preserved. Rows that exhaust their retries are
//! counted as dropped and the ledger reports itself degraded.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::stats::{self, RequestStats};
use crate::types::{RequestEvent, RequestState};

/// One persisted ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Global append sequence, used as the feed cursor
    pub seq: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: RequestEvent,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    /// The row would move a request backwards or past a terminal state.
    #[error("request {request_id}: {attempted} cannot follow recorded {recorded}")]
    Rewrite {
        request_id: String,
        recorded: RequestState,
        attempted: RequestState,
    },
    #[error("ledger storage error: {0}")]
    Storage(String),
    #[error("ledger serialization error: {0}")]
    Serialization(String),
}

impl LedgerError {
    /// Only storage faults are worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

/// Storage backend for the ledger.
pub trait LedgerStore: Send + Sync {
    /// Append a row, rejecting rows that violate lifecycle order.
    fn append(&self, event: &RequestEvent) -> Result<LedgerEntry, LedgerError>;

    /// Rows with `seq` greater than the cursor, oldest first.
    fn entries_after(&self, seq: u64, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Latest state of the most recently touched requests, newest first.
    fn latest(&self, limit: usize) -> Result<Vec<RequestEvent>, LedgerError>;

    /// Latest state of every request enqueued within `[start, end)`.
    fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RequestEvent>, LedgerError>;

    fn get(&self, request_id: &str) -> Result<Option<RequestEvent>, LedgerError>;

    fn head_seq(&self) -> u64;

    fn backend_name(&self) -> &'static str;
}

/// Backoff settings for failed writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(16);
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);
        let jitter_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(0);
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..jitter_ms)
        } else {
            0
        };
        backoff + Duration::from_millis(jitter)
    }
}

/// Observability health of the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerHealth {
    pub backend: &'static str,
    pub head_seq: u64,
    pub pending_retries: u64,
    pub recovered_writes: u64,
    pub dropped_writes: u64,
    pub last_failure: Option<String>,
}

impl LedgerHealth {
    pub fn is_degraded(&self) -> bool {
        self.dropped_writes > 0 || self.pending_retries > 0
    }
}

#[derive(Default)]
struct Counters {
    pending: AtomicU64,
    recovered: AtomicU64,
    dropped: AtomicU64,
    last_failure: Mutex<Option<String>>,
}

impl Counters {
    fn note_failure(&self, err: &LedgerError) {
        let mut slot = self.last_failure.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(err.to_string());
    }
}

/// What happened to a recorded row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// Persisted with this sequence number
    Written(u64),
    /// Handed to the retry worker
    Deferred,
}

/// The ledger facade used by dispatch and the stats projector.
pub struct EventLedger {
    store: Arc<dyn LedgerStore>,
    retry_tx: mpsc::UnboundedSender<RequestEvent>,
    counters: Arc<Counters>,
}

/// Background task that drains failed writes.
pub struct RetryWorker {
    store: Arc<dyn LedgerStore>,
    retry_rx: mpsc::UnboundedReceiver<RequestEvent>,
    counters: Arc<Counters>,
    policy: RetryPolicy,
}

impl EventLedger {
    /// Create the ledger and its retry worker. The worker must be spawned
    /// for deferred rows to be written.
    pub fn new(store: Arc<dyn LedgerStore>, policy: RetryPolicy) -> (Arc<Self>, RetryWorker) {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let ledger = Arc::new(Self {
            store: Arc::clone(&store),
            retry_tx,
            counters: Arc::clone(&counters),
        });
        let worker = RetryWorker {
            store,
            retry_rx,
            counters,
            policy,
        };
        (ledger, worker)
    }

    /// Record a lifecycle row.
    ///
    /// Never blocks on storage retries. Lifecycle violations are returned to
    /// the caller; transient storage faults are deferred.
    pub fn record(&self, event: &RequestEvent) -> Result<Recorded, LedgerError> {
        if self.counters.pending.load(Ordering::Acquire) > 0 {
            return Ok(self.defer(event.clone()));
        }

        match self.store.append(event) {
            Ok(entry) => {
                debug!(
                    request_id = %event.request_id,
                    state = %event.state,
                    seq = entry.seq,
                    "Ledger row recorded"
                );
                Ok(Recorded::Written(entry.seq))
            }
            Err(e) if e.is_transient() => {
                warn!(request_id = %event.request_id, error = %e, "Ledger write failed, queued for retry");
                self.counters.note_failure(&e);
                Ok(self.defer(event.clone()))
            }
            Err(e) => {
                warn!(request_id = %event.request_id, error = %e, "Ledger row refused");
                Err(e)
            }
        }
    }

    fn defer(&self, event: RequestEvent) -> Recorded {
        self.counters.pending.fetch_add(1, Ordering::AcqRel);
        if self.retry_tx.send(event).is_err() {
            // Worker gone (shutdown). Nothing will drain this row.
            self.counters.pending.fetch_sub(1, Ordering::AcqRel);
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            error!("Ledger retry worker unavailable, row dropped");
        }
        Recorded::Deferred
    }

    /// Most recent `n` requests, newest first.
    pub fn latest(&self, n: usize) -> Result<Vec<RequestEvent>, LedgerError> {
        self.store.latest(n)
    }

    pub fn get(&self, request_id: &str) -> Result<Option<RequestEvent>, LedgerError> {
        self.store.get(request_id)
    }

    pub fn entries_after(&self, seq: u64, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
        self.store.entries_after(seq, limit)
    }

    pub fn events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RequestEvent>, LedgerError> {
        self.store.events_between(start, end)
    }

    pub fn head_seq(&self) -> u64 {
        self.store.head_seq()
    }

    /// Time-bucketed request statistics for requests enqueued in `[start, end)`.
    ///
    /// Ledger-only view: bucket capacity averages stay empty. The stats
    /// projector joins capacity snapshots in.
    pub fn aggregate(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        bucket_count: u32,
    ) -> Result<RequestStats, LedgerError> {
        let events = self.store.events_between(start, end)?;
        Ok(stats::aggregate_requests(&events, &[], start, end, bucket_count))
    }

    pub fn health(&self) -> LedgerHealth {
        LedgerHealth {
            backend: self.store.backend_name(),
            head_seq: self.store.head_seq(),
            pending_retries: self.counters.pending.load(Ordering::Acquire),
            recovered_writes: self.counters.recovered.load(Ordering::Relaxed),
            dropped_writes: self.counters.dropped.load(Ordering::Relaxed),
            last_failure: self
                .counters
                .last_failure
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

impl RetryWorker {
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(max_attempts = self.policy.max_attempts, "Ledger retry worker started");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.retry_rx.recv() => match next {
                    Some(event) => event,
                    None => break,
                },
            };
            self.write_with_retry(&event, &cancel).await;
            self.counters.pending.fetch_sub(1, Ordering::AcqRel);
        }

        // Best-effort single attempt for whatever is still queued.
        while let Ok(event) = self.retry_rx.try_recv() {
            if self.store.append(&event).is_err() {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            self.counters.pending.fetch_sub(1, Ordering::AcqRel);
        }
        info!("Ledger retry worker stopped");
    }

    async fn write_with_retry(&self, event: &RequestEvent, cancel: &CancellationToken) {
        for attempt in 0..self.policy.max_attempts {
            match self.store.append(event) {
                Ok(entry) => {
                    self.counters.recovered.fetch_add(1, Ordering::Relaxed);
                    debug!(request_id = %event.request_id, seq = entry.seq, attempt, "Deferred ledger row written");
                    return;
                }
                Err(e) if !e.is_transient() => {
                    warn!(request_id = %event.request_id, error = %e, "Deferred ledger row refused");
                    self.counters.note_failure(&e);
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) => {
                    self.counters.note_failure(&e);
                    let delay = self.policy.delay(attempt);
                    warn!(
                        request_id = %event.request_id,
                        error = %e,
                        attempt = attempt + 1,
                        next_retry_ms = delay.as_millis() as u64,
                        "Ledger retry failed, backing off"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        error!(
            request_id = %event.request_id,
            state = %event.state,
            "Ledger row dropped after retries; observability degraded"
        );
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;

    /// In-memory store with a switch to simulate storage outages.
    #[derive(Default)]
    pub struct FlakyStore {
        pub failing: AtomicBool,
        pub(crate) rows: Mutex<Vec<LedgerEntry>>,
    }

    impl FlakyStore {
        fn rows(&self) -> std::sync::MutexGuard<'_, Vec<LedgerEntry>> {
            self.rows.lock().unwrap()
        }

        fn current(&self, id: &str) -> Option<RequestEvent> {
            self.rows()
                .iter()
                .rev()
                .find(|r| r.event.request_id == id)
                .map(|r| r.event.clone())
        }
    }

    impl LedgerStore for FlakyStore {
        fn append(&self, event: &RequestEvent) -> Result<LedgerEntry, LedgerError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(LedgerError::Storage("disk unavailable".into()));
            }
            if let Some(prev) = self.current(&event.request_id) {
                if !event.state.may_follow(prev.state) {
                    return Err(LedgerError::Rewrite {
                        request_id: event.request_id.clone(),
                        recorded: prev.state,
                        attempted: event.state,
                    });
                }
            }
            let mut rows = self.rows();
            let entry = LedgerEntry {
                seq: rows.len() as u64 + 1,
                recorded_at: Utc::now(),
                event: event.clone(),
            };
            rows.push(entry.clone());
            Ok(entry)
        }

        fn entries_after(&self, seq: u64, limit: usize) -> Result<Vec<LedgerEntry>, LedgerError> {
            Ok(self.rows().iter().filter(|r| r.seq > seq).take(limit).cloned().collect())
        }

        fn latest(&self, limit: usize) -> Result<Vec<RequestEvent>, LedgerError> {
            let mut seen = HashMap::new();
            let mut out = Vec::new();
            for row in self.rows().iter().rev() {
                if seen.insert(row.event.request_id.clone(), ()).is_none() {
                    out.push(row.event.clone());
                }
            }
            out.truncate(limit);
            Ok(out)
        }

        fn events_between(
            &self,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<RequestEvent>, LedgerError> {
            Ok(self
                .latest(usize::MAX)?
                .into_iter()
                .filter(|e| e.enqueued_at >= start && e.enqueued_at < end)
                .collect())
        }

        fn get(&self, request_id: &str) -> Result<Option<RequestEvent>, LedgerError> {
            Ok(self.current(request_id))
        }

        fn head_seq(&self) -> u64 {
            self.rows().len() as u64
        }

        fn backend_name(&self) -> &'static str {
            "memory"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::FlakyStore;
    use super::*;
    use crate::types::{DecisionContext, EventSeed, ProviderKind, Route, TerminalStatus};
    use std::sync::atomic::AtomicBool;

    fn scheduled(id: &str) -> RequestEvent {
        RequestEvent::scheduled_now(
            EventSeed {
                request_id: id.to_string(),
                policy_id: None,
                topic: "chat".into(),
                priority: 0,
                timeout_secs: None,
                failover_of: None,
            },
            Route {
                model_id: "m".into(),
                provider_id: "p".into(),
                provider_kind: ProviderKind::LocalCapacity,
            },
            DecisionContext::default(),
            Utc::now(),
        )
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_record_writes_through() {
        let store = Arc::new(FlakyStore::default());
        let (ledger, _worker) = EventLedger::new(store, fast_policy());

        let outcome = ledger.record(&scheduled("a")).unwrap();
        assert_eq!(outcome, Recorded::Written(1));
        assert_eq!(ledger.latest(5).unwrap().len(), 1);
        assert!(!ledger.health().is_degraded());
    }

    #[tokio::test]
    async fn test_failed_write_is_retried_in_order() {
        let store = Arc::new(FlakyStore {
            failing: AtomicBool::new(true),
            ..Default::default()
        });
        let (ledger, worker) = EventLedger::new(Arc::clone(&store) as Arc<dyn LedgerStore>, fast_policy());

        let mut event = scheduled("r");
        assert_eq!(ledger.record(&event).unwrap(), Recorded::Deferred);
        event.finish(TerminalStatus::Success, Utc::now(), None).unwrap();
        // Queues behind the pending row rather than overtaking it.
        assert_eq!(ledger.record(&event).unwrap(), Recorded::Deferred);
        assert_eq!(ledger.health().pending_retries, 2);

        store.failing.store(false, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        for _ in 0..100 {
            if ledger.health().pending_retries == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        let health = ledger.health();
        assert_eq!(health.recovered_writes, 2);
        assert_eq!(health.dropped_writes, 0);
        assert_eq!(ledger.get("r").unwrap().unwrap().state, RequestState::Complete);
    }

    #[tokio::test]
    async fn test_permanent_failure_marks_degraded() {
        let store = Arc::new(FlakyStore {
            failing: AtomicBool::new(true),
            ..Default::default()
        });
        let (ledger, worker) = EventLedger::new(store, fast_policy());
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker.run(cancel.clone()));

        ledger.record(&scheduled("lost")).unwrap();
        for _ in 0..200 {
            if ledger.health().dropped_writes > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        let health = ledger.health();
        assert!(health.is_degraded());
        assert_eq!(health.dropped_writes, 1);
        assert!(health.last_failure.is_some());
    }

    #[tokio::test]
    async fn test_rewrite_is_refused_not_retried() {
        let store = Arc::new(FlakyStore::default());
        let (ledger, _worker) = EventLedger::new(store, fast_policy());

        let mut event = scheduled("t");
        ledger.record(&event).unwrap();
        event.finish(TerminalStatus::Timeout, Utc::now(), None).unwrap();
        ledger.record(&event).unwrap();

        let err = ledger.record(&event).unwrap_err();
        assert!(matches!(err, LedgerError::Rewrite { .. }));
        assert_eq!(ledger.health().pending_retries, 0);
    }

    #[tokio::test]
    async fn test_aggregate_counts_latest_state() {
        let store = Arc::new(FlakyStore::default());
        let (ledger, _worker) = EventLedger::new(store, fast_policy());

        let mut done = scheduled("done");
        ledger.record(&done).unwrap();
        done.finish(TerminalStatus::Success, Utc::now(), None).unwrap();
        ledger.record(&done).unwrap();
        ledger.record(&scheduled("running")).unwrap();

        let now = Utc::now();
        let stats = ledger
            .aggregate(now - chrono::Duration::hours(1), now + chrono::Duration::hours(1), 4)
            .unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.status_counts.get(&RequestState::Complete), Some(&1));
        assert_eq!(stats.status_counts.get(&RequestState::Scheduled), Some(&1));
        assert_eq!(stats.buckets.iter().map(|b| b.local).sum::<u64>(), 2);
    }

    #[test]
    fn test_retry_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        assert!(policy.delay(0) < Duration::from_millis(200));
        assert!(policy.delay(9) < Duration::from_millis(1100));
    }
}
