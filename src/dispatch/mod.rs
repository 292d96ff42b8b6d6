//! Dispatch Queue - turns ranked, admitted requests into running work.
//!
//! ## Request flow
//!
//! ```text
//! submit ─► ranking ─► admission ─┬─► scheduled ─► execute ─► complete | error | timeout
//!                │                └─► queued (best candidate's lane) ─► pump ─┬─► scheduled
//!                └─► rejected                                                 └─► reroute ─► scheduled elsewhere
//! ```
//!
//! A queue head whose model is still blocked on capacity or quota is
//! re-admitted over its whole ranking and moves to whichever candidate
//! takes it. Saturated lanes keep their waiters.
//!
//! Parallelism is a per-model counter guarded by the lane mutex; taking a
//! slot is a single test-and-increment, so racing triggers cannot
//! double-dispatch. Each scheduled request runs in one task that races the
//! executor against its deadline; settlement is additionally guarded by a
//! compare-and-swap so a request is finished exactly once.

pub mod lane;
pub mod triggers;

pub use lane::{aged_priority, LaneStatus, ModelLane, QueuedRequest};
pub use triggers::run_dispatch_triggers;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::admission::{AdmissionController, Selection, Verdict};
use crate::capacity::SnapshotBoard;
use crate::catalog::{Catalog, CatalogStore};
use crate::config::SchedulerConfig;
use crate::executor::{ExecutionRequest, ModelExecutor, QuotaHint};
use crate::ledger::EventLedger;
use crate::ranking::{self, RankedCandidate, Ranking};
use crate::types::{
    DecisionContext, EventSeed, ModelId, ProviderKind, QuotaSnapshot, RejectReason, RequestEvent,
    RequestState, Route, TerminalStatus,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("request {request_id} rejected: {reason}")]
    Rejected {
        request_id: String,
        reason: RejectReason,
    },
    #[error("scheduler is shutting down")]
    Closed,
}

/// An inference request as submitted by a caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub topic: String,
    #[serde(default)]
    pub required_tags: BTreeSet<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Forwarded to the model endpoint as-is
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Final result delivered to the caller.
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Terminal ledger row of the last attempt
    pub event: RequestEvent,
    pub output: Option<serde_json::Value>,
}

/// Handle returned by `submit`.
#[derive(Debug)]
pub struct Ticket {
    pub request_id: String,
    /// State right after submission (`queued` or `scheduled`)
    pub state: RequestState,
    pub outcome: oneshot::Receiver<Outcome>,
}

/// A scheduled request. Whoever flips `settled` first finishes it.
struct Flight {
    event: Mutex<RequestEvent>,
    settled: AtomicBool,
    ranking: Ranking,
    payload: serde_json::Value,
    attempt: u32,
    outcome_tx: Mutex<Option<oneshot::Sender<Outcome>>>,
}

impl Flight {
    fn model_id(&self) -> ModelId {
        self.event
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .model_id()
            .unwrap_or_default()
            .to_string()
    }
}

/// Per-request work that survives into a new attempt.
struct Carry {
    ranking: Ranking,
    payload: serde_json::Value,
    attempt: u32,
    outcome_tx: Option<oneshot::Sender<Outcome>>,
}

pub struct Scheduler {
    catalog: Arc<CatalogStore>,
    board: Arc<SnapshotBoard>,
    ledger: Arc<EventLedger>,
    executor: Arc<dyn ModelExecutor>,
    admission: AdmissionController,
    config: SchedulerConfig,
    lanes: RwLock<HashMap<ModelId, Arc<ModelLane>>>,
    insert_seq: AtomicU64,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(
        catalog: Arc<CatalogStore>,
        board: Arc<SnapshotBoard>,
        ledger: Arc<EventLedger>,
        executor: Arc<dyn ModelExecutor>,
        admission: AdmissionController,
        config: SchedulerConfig,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            board,
            ledger,
            executor,
            admission,
            config,
            lanes: RwLock::new(HashMap::new()),
            insert_seq: AtomicU64::new(0),
            shutdown,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn lane(&self, model_id: &str) -> Arc<ModelLane> {
        if let Some(lane) = self
            .lanes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(model_id)
        {
            return Arc::clone(lane);
        }
        let mut lanes = self.lanes.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            lanes
                .entry(model_id.to_string())
                .or_insert_with(|| Arc::new(ModelLane::new(model_id.to_string()))),
        )
    }

    fn all_lanes(&self) -> Vec<Arc<ModelLane>> {
        self.lanes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Occupancy of every lane, sorted by model id.
    pub fn lane_status(&self) -> Vec<LaneStatus> {
        let mut status: Vec<LaneStatus> = self.all_lanes().iter().map(|l| l.status()).collect();
        status.sort_by(|a, b| a.model_id.cmp(&b.model_id));
        status
    }

    /// Append a ledger row, logging a refused transition.
    fn record(&self, event: &RequestEvent) {
        if let Err(e) = self.ledger.record(event) {
            warn!(
                request_id = %event.request_id,
                state = %event.state,
                error = %e,
                "Ledger refused request row"
            );
        }
    }

    /// Forget a lane whose model left the catalog once nothing uses it.
    fn drop_idle_lane(&self, model_id: &str) {
        let mut lanes = self.lanes.write().unwrap_or_else(|e| e.into_inner());
        if lanes.get(model_id).is_some_and(|lane| lane.is_idle()) {
            lanes.remove(model_id);
            debug!(model = %model_id, "Lane dropped");
        }
    }

    fn timeout_for(&self, event: &RequestEvent) -> Duration {
        Duration::from_secs(event.timeout_secs.unwrap_or(self.config.default_timeout_secs))
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Rank, admit and either start or queue a request.
    pub fn submit(self: &Arc<Self>, request: SubmitRequest) -> Result<Ticket, SchedulerError> {
        if self.shutdown.is_cancelled() {
            return Err(SchedulerError::Closed);
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let catalog = self.catalog.snapshot();

        let ranking = match ranking::route(&catalog, &request.topic, &request.required_tags) {
            Ok(ranking) => ranking,
            Err((policy_id, reason)) => {
                let seed = EventSeed {
                    request_id: request_id.clone(),
                    policy_id,
                    topic: request.topic,
                    priority: request.priority,
                    timeout_secs: request.timeout_secs,
                    failover_of: None,
                };
                let event = RequestEvent::rejected(seed, reason, now);
                self.record(&event);
                info!(request_id = %request_id, reason = %reason, "Request rejected");
                return Err(SchedulerError::Rejected { request_id, reason });
            }
        };

        let seed = EventSeed {
            request_id: request_id.clone(),
            policy_id: Some(ranking.policy_id.clone()),
            topic: request.topic,
            priority: request.priority,
            timeout_secs: request.timeout_secs,
            failover_of: None,
        };
        let (tx, rx) = oneshot::channel();
        let carry = Carry {
            ranking,
            payload: request.payload,
            attempt: 1,
            outcome_tx: Some(tx),
        };
        let state = self.place(&catalog, seed, carry, None);

        Ok(Ticket {
            request_id,
            state,
            outcome: rx,
        })
    }

    /// Admit onto the first passing candidate (optionally only those ranked
    /// after `skip_through`), or queue on the best one.
    fn place(
        self: &Arc<Self>,
        catalog: &Catalog,
        seed: EventSeed,
        carry: Carry,
        skip_through: Option<&str>,
    ) -> RequestState {
        let pool: Vec<RankedCandidate> = match skip_through {
            Some(model_id) => carry.ranking.after(model_id).cloned().collect(),
            None => carry.ranking.candidates.clone(),
        };

        let selection = self.admission.select(catalog, &self.board, &pool, |candidate| {
            let Some(model) = catalog.model(&candidate.model_id) else {
                return false;
            };
            self.lane(&candidate.model_id)
                .lock()
                .try_acquire_idle(model.max_parallel)
        });

        let now = Utc::now();
        match selection {
            Some(Selection::Admitted { candidate, decision }) => {
                let event = RequestEvent::scheduled_now(seed, route_of(candidate), decision, now);
                debug!(
                    request_id = %event.request_id,
                    model = %candidate.model_id,
                    cold_start = ?event.decision.cold_start,
                    "Request scheduled immediately"
                );
                self.launch(event, carry);
                RequestState::Scheduled
            }
            Some(Selection::Deferred { best, decision, reasons }) => {
                debug!(request_id = %seed.request_id, model = %best.model_id, ?reasons, "Admission deferred, queueing");
                let lane = self.lane(&best.model_id);
                {
                    let mut state = lane.lock();
                    let depth = u32::try_from(state.pending.len() + 1).unwrap_or(u32::MAX);
                    let event = RequestEvent::queued(seed, route_of(best), depth, decision, now);
                    // Recorded before the row becomes visible to pump.
                    self.record(&event);
                    debug!(request_id = %event.request_id, model = %best.model_id, queue_depth = depth, "Request queued");
                    state.pending.push(QueuedRequest {
                        event,
                        ranking: carry.ranking,
                        payload: carry.payload,
                        attempt: carry.attempt,
                        outcome_tx: carry.outcome_tx,
                        seq: self.insert_seq.fetch_add(1, Ordering::Relaxed),
                    });
                }
                // A slot may have freed between admission and the push.
                self.pump(&best.model_id);
                RequestState::Queued
            }
            None => {
                // Failover ran out of candidates: nothing left to place.
                RequestState::Error
            }
        }
    }

    // ------------------------------------------------------------------------
    // Queue draining
    // ------------------------------------------------------------------------

    /// Start as many queued requests on `model_id` as slots and capacity allow.
    pub fn pump(self: &Arc<Self>, model_id: &str) {
        let lane = self.lane(model_id);
        loop {
            let catalog = self.catalog.snapshot();
            let step = {
                let mut gate = self.admission.gate();
                let mut state = lane.lock();
                if state.pending.is_empty() {
                    return;
                }
                let Some(model) = catalog.model(model_id) else {
                    let orphans: Vec<QueuedRequest> = state.pending.drain().collect();
                    drop(state);
                    drop(gate);
                    self.abandon(orphans, "model removed from catalog");
                    self.drop_idle_lane(model_id);
                    return;
                };
                if state.in_flight >= model.max_parallel {
                    return;
                }
                match gate.check(&catalog, &self.board, model_id) {
                    Verdict::Admit(decision) => {
                        let Some(request) = state.pending.pop() else {
                            return;
                        };
                        state.in_flight += 1;
                        gate.commit(&catalog, model_id, &decision);
                        let depth = u32::try_from(state.pending.len()).unwrap_or(u32::MAX);
                        Step::Start(request, decision, depth)
                    }
                    Verdict::Defer(reason, _) => {
                        let movable = state
                            .pending
                            .peek()
                            .is_some_and(|head| head.ranking.candidates.len() > 1);
                        debug!(model = %model_id, reason = %reason, pending = state.pending.len(), "Queue head still deferred");
                        if !movable {
                            return;
                        }
                        match state.pending.pop() {
                            Some(request) => Step::Reroute(request),
                            None => return,
                        }
                    }
                }
            };

            let (mut request, decision, depth) = match step {
                Step::Start(request, decision, depth) => (request, decision, depth),
                Step::Reroute(request) => {
                    if self.reroute(&catalog, request) {
                        continue;
                    }
                    return;
                }
            };
            let provider_id = request.event.route.as_ref().map(|r| r.provider_id.clone()).unwrap_or_default();
            if let Err(e) = request.event.mark_scheduled(Utc::now(), depth, decision.clone()) {
                warn!(error = %e, "Queued request in unexpected state");
                self.admission.release(&provider_id, model_id, &decision);
                lane.release();
                continue;
            }
            debug!(
                request_id = %request.event.request_id,
                model = %model_id,
                queue_depth = depth,
                priority = request.event.priority_when_scheduled,
                "Queued request scheduled"
            );
            self.launch(
                request.event,
                Carry {
                    ranking: request.ranking,
                    payload: request.payload,
                    attempt: request.attempt,
                    outcome_tx: request.outcome_tx,
                },
            );
        }
    }

    /// Admit a deferred queue head over its whole ranking. Returns true if
    /// it was scheduled somewhere; otherwise it goes back into its lane.
    fn reroute(self: &Arc<Self>, catalog: &Catalog, mut request: QueuedRequest) -> bool {
        let parked_on = request.event.model_id().unwrap_or_default().to_string();
        let admitted = match self
            .admission
            .select(catalog, &self.board, &request.ranking.candidates, |candidate| {
                let Some(model) = catalog.model(&candidate.model_id) else {
                    return false;
                };
                self.lane(&candidate.model_id)
                    .lock()
                    .try_acquire_idle(model.max_parallel)
            }) {
            Some(Selection::Admitted { candidate, decision }) => Some((route_of(candidate), decision)),
            _ => None,
        };
        let Some((route, decision)) = admitted else {
            self.lane(&parked_on).lock().pending.push(request);
            return false;
        };

        let target = route.model_id.clone();
        let provider_id = route.provider_id.clone();
        let moved = request
            .event
            .reroute(route)
            .and_then(|_| request.event.mark_scheduled(Utc::now(), 0, decision.clone()));
        if let Err(e) = moved {
            warn!(error = %e, "Queued request in unexpected state");
            self.admission.release(&provider_id, &target, &decision);
            self.lane(&target).release();
            return true;
        }
        info!(
            request_id = %request.event.request_id,
            from = %parked_on,
            to = %target,
            "Queued request moved to another candidate"
        );
        self.launch(
            request.event,
            Carry {
                ranking: request.ranking,
                payload: request.payload,
                attempt: request.attempt,
                outcome_tx: request.outcome_tx,
            },
        );
        true
    }

    /// Pump every lane that has waiters.
    pub fn pump_all(self: &Arc<Self>) {
        for lane in self.all_lanes() {
            if lane.status().pending > 0 {
                self.pump(&lane.model_id);
            }
        }
    }

    /// Pump lanes whose model lives on `provider_id`.
    pub fn pump_provider(self: &Arc<Self>, provider_id: &str) {
        let catalog = self.catalog.snapshot();
        for lane in self.all_lanes() {
            let on_provider = catalog
                .model(&lane.model_id)
                .map_or(true, |m| m.provider_id == provider_id);
            if on_provider {
                self.pump(&lane.model_id);
            }
        }
    }

    /// Re-age every waiting request and record the priority changes.
    pub fn age_queues(&self) {
        let now = Utc::now();
        for lane in self.all_lanes() {
            let mut state = lane.lock();
            let changed = state.age(now, self.config.aging_step_secs, self.config.aging_max_boost);
            for event in &changed {
                debug!(
                    request_id = %event.request_id,
                    priority = event.priority_when_scheduled,
                    "Queued request aged"
                );
                self.record(event);
            }
        }
    }

    /// Queued requests that can never run (their model is gone). They
    /// finish as errors without taking a slot.
    fn abandon(&self, orphans: Vec<QueuedRequest>, detail: &str) {
        for mut request in orphans {
            let now = Utc::now();
            let decision = request.event.decision.clone();
            let finished = request
                .event
                .mark_scheduled(now, 0, decision)
                .and_then(|_| request.event.finish(TerminalStatus::Error, now, Some(detail.to_string())));
            if finished.is_err() {
                continue;
            }
            self.record(&request.event);
            warn!(request_id = %request.event.request_id, detail, "Queued request abandoned");
            if let Some(tx) = request.outcome_tx.take() {
                let _ = tx.send(Outcome {
                    event: request.event,
                    output: None,
                });
            }
        }
    }

    // ------------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------------

    /// Record the scheduled row and run the request against its deadline.
    /// The caller already holds the model's slot.
    fn launch(self: &Arc<Self>, event: RequestEvent, carry: Carry) {
        self.record(&event);
        let deadline = self.timeout_for(&event);
        let catalog = self.catalog.snapshot();

        let resolved = event
            .model_id()
            .and_then(|id| catalog.resolve(id))
            .map(|(m, p)| (m.clone(), p.clone()));

        let flight = Arc::new(Flight {
            event: Mutex::new(event),
            settled: AtomicBool::new(false),
            ranking: carry.ranking,
            payload: carry.payload,
            attempt: carry.attempt,
            outcome_tx: Mutex::new(carry.outcome_tx),
        });

        let Some((model, provider)) = resolved else {
            self.settle(&flight, TerminalStatus::Error, Some("model removed from catalog".into()), None, QuotaHint::default());
            return;
        };

        let request = ExecutionRequest {
            request_id: flight.event.lock().unwrap_or_else(|e| e.into_inner()).request_id.clone(),
            provider,
            model,
            payload: flight.payload.clone(),
        };

        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let shutdown = scheduler.shutdown.clone();
            tokio::select! {
                result = scheduler.executor.execute(request) => match result {
                    Ok(output) => {
                        scheduler.settle(&flight, TerminalStatus::Success, None, Some(output.body), output.quota);
                    }
                    Err(failure) => {
                        let detail = failure.error.to_string();
                        scheduler.settle(&flight, TerminalStatus::Error, Some(detail), None, failure.quota);
                    }
                },
                _ = tokio::time::sleep(deadline) => {
                    let detail = format!("deadline of {}s elapsed", deadline.as_secs());
                    scheduler.settle(&flight, TerminalStatus::Timeout, Some(detail), None, QuotaHint::default());
                }
                _ = shutdown.cancelled() => {
                    scheduler.settle(&flight, TerminalStatus::Error, Some("scheduler shutting down".into()), None, QuotaHint::default());
                }
            }
        });
    }

    /// Finish a flight. Returns false if it was already finished.
    fn settle(
        self: &Arc<Self>,
        flight: &Arc<Flight>,
        status: TerminalStatus,
        detail: Option<String>,
        output: Option<serde_json::Value>,
        quota: QuotaHint,
    ) -> bool {
        if flight
            .settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let event = {
            let mut event = flight.event.lock().unwrap_or_else(|e| e.into_inner());
            if let Err(e) = event.finish(status, Utc::now(), detail) {
                warn!(error = %e, "Flight finished from unexpected state");
            }
            event.clone()
        };
        let model_id = flight.model_id();

        // Slot first, so observers never see more in flight than allowed.
        self.lane(&model_id).release();
        if let Some(route) = &event.route {
            self.admission.release(&route.provider_id, &model_id, &event.decision);
        }
        self.record(&event);
        info!(
            request_id = %event.request_id,
            model = %model_id,
            state = %event.state,
            run_secs = event.run_secs().unwrap_or_default(),
            "Request finished"
        );

        if let Some(route) = &event.route {
            if route.provider_kind == ProviderKind::RateLimited && !quota.is_empty() {
                self.board.publish_quota(QuotaSnapshot {
                    provider_id: route.provider_id.clone(),
                    taken_at: Utc::now(),
                    remaining_requests: quota.remaining_requests,
                    remaining_tokens: quota.remaining_tokens,
                });
            }
        }

        let outcome_tx = flight
            .outcome_tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(Some(tx)) = self.failover(flight, &event, status, outcome_tx) {
            let _ = tx.send(Outcome { event, output });
        }

        // The freed slot or memory may also unblock heads parked elsewhere.
        self.pump(&model_id);
        self.pump_all();
        true
    }

    /// Opt-in: retry a failed or timed-out request on the next-ranked
    /// candidate as a new request. Returns the outcome sender back when no
    /// failover happened.
    fn failover(
        self: &Arc<Self>,
        flight: &Flight,
        event: &RequestEvent,
        status: TerminalStatus,
        outcome_tx: Option<oneshot::Sender<Outcome>>,
    ) -> Option<Option<oneshot::Sender<Outcome>>> {
        let policy = &self.config.failover;
        let eligible = policy.enabled
            && status != TerminalStatus::Success
            && flight.attempt < policy.max_attempts
            && !self.shutdown.is_cancelled();
        let model_id = event.model_id().unwrap_or_default();
        if !eligible || flight.ranking.after(model_id).next().is_none() {
            return Some(outcome_tx);
        }

        let seed = EventSeed {
            request_id: uuid::Uuid::new_v4().to_string(),
            policy_id: event.policy_id.clone(),
            topic: event.topic.clone(),
            priority: event.initial_priority,
            timeout_secs: event.timeout_secs,
            failover_of: Some(event.request_id.clone()),
        };
        info!(
            request_id = %event.request_id,
            failover_request_id = %seed.request_id,
            attempt = flight.attempt + 1,
            "Failing over to next-ranked candidate"
        );
        let catalog = self.catalog.snapshot();
        let carry = Carry {
            ranking: flight.ranking.clone(),
            payload: flight.payload.clone(),
            attempt: flight.attempt + 1,
            outcome_tx,
        };
        self.place(&catalog, seed, carry, Some(model_id));
        None
    }
}

/// What one pump pass decided for the queue head.
enum Step {
    Start(QueuedRequest, DecisionContext, u32),
    Reroute(QueuedRequest),
}

fn route_of(candidate: &RankedCandidate) -> Route {
    Route {
        model_id: candidate.model_id.clone(),
        provider_id: candidate.provider_id.clone(),
        provider_kind: candidate.provider_kind,
    }
}

