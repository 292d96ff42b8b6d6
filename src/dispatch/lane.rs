//! Per-model lane: a priority queue of waiting requests plus the count of
//! requests currently scheduled on the model.
//!
//! Both live under one mutex so "is there a free slot, and who is next" is
//! a single atomic decision. The lock is never held across an await.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

use super::Outcome;
use crate::ranking::Ranking;
use crate::types::{ModelId, RequestEvent};

/// A request waiting for a slot.
#[derive(Debug)]
pub struct QueuedRequest {
    /// Ledger row in `queued` state
    pub event: RequestEvent,
    pub ranking: Ranking,
    pub payload: serde_json::Value,
    pub attempt: u32,
    pub outcome_tx: Option<oneshot::Sender<Outcome>>,
    /// Insertion order, final tie-break
    pub(super) seq: u64,
}

impl QueuedRequest {
    fn priority(&self) -> i32 {
        self.event.priority_when_scheduled
    }
}

// Max-heap order: higher priority first, then earlier enqueue, then insertion.
impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority()
            .cmp(&other.priority())
            .then_with(|| other.event.enqueued_at.cmp(&self.event.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

#[derive(Debug, Default)]
pub(super) struct LaneState {
    pub pending: BinaryHeap<QueuedRequest>,
    pub in_flight: u32,
}

impl LaneState {
    /// Take a slot if one is free and nobody is already waiting.
    pub fn try_acquire_idle(&mut self, max_parallel: u32) -> bool {
        if self.pending.is_empty() && self.in_flight < max_parallel {
            self.in_flight += 1;
            true
        } else {
            false
        }
    }

    /// Effective priority of every waiting request at `now`. Returns the
    /// rows whose priority went up.
    pub fn age(&mut self, now: DateTime<Utc>, step_secs: u64, max_boost: i32) -> Vec<RequestEvent> {
        let mut changed = Vec::new();
        let mut items = std::mem::take(&mut self.pending).into_vec();
        for item in &mut items {
            let target = aged_priority(item.event.initial_priority, item.event.enqueued_at, now, step_secs, max_boost);
            if let Ok(true) = item.event.reprioritize(target) {
                changed.push(item.event.clone());
            }
        }
        self.pending = BinaryHeap::from(items);
        changed
    }
}

/// `initial + floor(waited / step)`, boost capped at `max_boost`.
pub fn aged_priority(
    initial: i32,
    enqueued_at: DateTime<Utc>,
    now: DateTime<Utc>,
    step_secs: u64,
    max_boost: i32,
) -> i32 {
    let waited = (now - enqueued_at).num_seconds().max(0);
    let steps = waited / i64::try_from(step_secs.max(1)).unwrap_or(i64::MAX);
    let boost = i32::try_from(steps).unwrap_or(i32::MAX).min(max_boost);
    initial.saturating_add(boost)
}

pub struct ModelLane {
    pub model_id: ModelId,
    state: Mutex<LaneState>,
}

/// Point-in-time lane occupancy.
#[derive(Debug, Clone, Serialize)]
pub struct LaneStatus {
    pub model_id: ModelId,
    pub pending: usize,
    pub in_flight: u32,
}

impl ModelLane {
    pub fn new(model_id: ModelId) -> Self {
        Self {
            model_id,
            state: Mutex::new(LaneState::default()),
        }
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, LaneState> {
        self.state.lock().unwrap_or_else(|e| {
            tracing::warn!(model = %self.model_id, "Lane lock poisoned, recovering");
            e.into_inner()
        })
    }

    /// Give back one slot.
    pub fn release(&self) {
        let mut state = self.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    /// Nothing waiting and nothing running.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        state.pending.is_empty() && state.in_flight == 0
    }

    pub fn status(&self) -> LaneStatus {
        let state = self.lock();
        LaneStatus {
            model_id: self.model_id.clone(),
            pending: state.pending.len(),
            in_flight: state.in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DecisionContext, EventSeed, ProviderKind, Route};
    use chrono::Duration;

    fn queued(id: &str, priority: i32, at: DateTime<Utc>, seq: u64) -> QueuedRequest {
        let event = RequestEvent::queued(
            EventSeed {
                request_id: id.to_string(),
                policy_id: None,
                topic: "chat".into(),
                priority,
                timeout_secs: None,
                failover_of: None,
            },
            Route {
                model_id: "m".into(),
                provider_id: "p".into(),
                provider_kind: ProviderKind::LocalCapacity,
            },
            1,
            DecisionContext::default(),
            at,
        );
        QueuedRequest {
            event,
            ranking: Ranking {
                policy_id: "p".into(),
                candidates: vec![],
            },
            payload: serde_json::Value::Null,
            attempt: 1,
            outcome_tx: None,
            seq,
        }
    }

    #[test]
    fn test_heap_order() {
        let t0 = Utc::now();
        let mut state = LaneState::default();
        state.pending.push(queued("late-low", 0, t0 + Duration::seconds(5), 1));
        state.pending.push(queued("early-low", 0, t0, 2));
        state.pending.push(queued("high", 5, t0 + Duration::seconds(10), 3));
        state.pending.push(queued("early-low-twin", 0, t0, 4));

        let order: Vec<String> = std::iter::from_fn(|| state.pending.pop())
            .map(|q| q.event.request_id)
            .collect();
        assert_eq!(order, vec!["high", "early-low", "early-low-twin", "late-low"]);
    }

    #[test]
    fn test_aging_promotes_long_waiters() {
        let t0 = Utc::now();
        let mut state = LaneState::default();
        state.pending.push(queued("old", 0, t0, 1));
        state.pending.push(queued("new", 2, t0 + Duration::seconds(170), 2));

        // "old" waited 180s: +6 at 30s per step.
        let changed = state.age(t0 + Duration::seconds(180), 30, 100);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].priority_when_scheduled, 6);
        assert_eq!(changed[0].initial_priority, 0);
        assert_eq!(state.pending.peek().unwrap().event.request_id, "old");
    }

    #[test]
    fn test_aged_priority_is_capped() {
        let t0 = Utc::now();
        assert_eq!(aged_priority(1, t0, t0 + Duration::hours(10), 30, 10), 11);
        assert_eq!(aged_priority(1, t0, t0 - Duration::seconds(5), 30, 10), 1);
    }

    #[test]
    fn test_idle_acquire_respects_queue_and_bound() {
        let mut state = LaneState::default();
        assert!(state.try_acquire_idle(1));
        assert!(!state.try_acquire_idle(1));
        state.in_flight = 0;
        state.pending.push(queued("waiting", 0, Utc::now(), 1));
        assert!(!state.try_acquire_idle(4));
    }
}
