//! Request lifecycle events - the ledger's system of record.
//!
//! A `RequestEvent` is created at enqueue (or rejection), mutated only by the
//! dispatch stage that owns the request, and frozen once terminal. The
//! transition methods enforce the lifecycle:
//!
//! ```text
//! queued -> scheduled -> complete | error | timeout
//! rejected (initial, terminal)
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::catalog::{ModelId, PolicyId, ProviderId, ProviderKind};
use super::snapshot::{CapacityReading, QuotaReading};

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Queued,
    Scheduled,
    Complete,
    Error,
    Timeout,
    Rejected,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Timeout | Self::Rejected)
    }

    /// Whether a row in this state may be recorded after one in `previous`.
    ///
    /// Repeated `queued` rows carry aging updates.
    pub fn may_follow(self, previous: Self) -> bool {
        match previous {
            Self::Queued => matches!(self, Self::Queued | Self::Scheduled),
            Self::Scheduled => matches!(self, Self::Complete | Self::Error | Self::Timeout),
            Self::Complete | Self::Error | Self::Timeout | Self::Rejected => false,
        }
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Scheduled => "scheduled",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::Timeout => "timeout",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Outcome of an executed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Success,
    Error,
    Timeout,
}

impl From<TerminalStatus> for RequestState {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Success => Self::Complete,
            TerminalStatus::Error => Self::Error,
            TerminalStatus::Timeout => Self::Timeout,
        }
    }
}

/// Why a request was rejected without ever being queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NoMatchingPolicy,
    NoPrivacyEligibleModel,
    NoTagMatch,
    NoModelWithinThresholds,
}

impl RejectReason {
    /// Stable machine-readable code.
    pub fn code(self) -> &'static str {
        match self {
            Self::NoMatchingPolicy => "no_matching_policy",
            Self::NoPrivacyEligibleModel => "no_privacy_eligible_model",
            Self::NoTagMatch => "no_tag_match",
            Self::NoModelWithinThresholds => "no_model_within_thresholds",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoMatchingPolicy => "no matching policy",
            Self::NoPrivacyEligibleModel => "no privacy-eligible model",
            Self::NoTagMatch => "no tag match",
            Self::NoModelWithinThresholds => "no model within policy thresholds",
        };
        f.write_str(s)
    }
}

/// Lifecycle violations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("request {request_id}: cannot move from {from} to {to}")]
    InvalidTransition {
        request_id: String,
        from: RequestState,
        to: RequestState,
    },
}

/// The selected route for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub model_id: ModelId,
    pub provider_id: ProviderId,
    pub provider_kind: ProviderKind,
}

/// What the admission controller saw when it decided.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionContext {
    pub capacity: Option<CapacityReading>,
    pub quota: Option<QuotaReading>,
    pub cold_start: Option<bool>,
}

/// Ledger row for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEvent {
    pub request_id: String,
    pub policy_id: Option<PolicyId>,
    pub topic: String,
    pub route: Option<Route>,
    pub state: RequestState,
    pub initial_priority: i32,
    /// Effective priority; raised by aging while queued, frozen at schedule
    pub priority_when_scheduled: i32,
    pub queue_depth_at_enqueue: u32,
    pub queue_depth_at_schedule: Option<u32>,
    pub timeout_secs: Option<u64>,
    pub enqueued_at: DateTime<Utc>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Captured at decision time; never recomputed
    pub decision: DecisionContext,
    pub error_detail: Option<String>,
    pub reject_reason: Option<RejectReason>,
    /// Set when this request was spawned by failover from another one
    pub failover_of: Option<String>,
}

/// Fields shared by every freshly created event.
#[derive(Debug, Clone)]
pub struct EventSeed {
    pub request_id: String,
    pub policy_id: Option<PolicyId>,
    pub topic: String,
    pub priority: i32,
    pub timeout_secs: Option<u64>,
    pub failover_of: Option<String>,
}

impl RequestEvent {
    fn base(seed: EventSeed, state: RequestState, at: DateTime<Utc>) -> Self {
        Self {
            request_id: seed.request_id,
            policy_id: seed.policy_id,
            topic: seed.topic,
            route: None,
            state,
            initial_priority: seed.priority,
            priority_when_scheduled: seed.priority,
            queue_depth_at_enqueue: 0,
            queue_depth_at_schedule: None,
            timeout_secs: seed.timeout_secs,
            enqueued_at: at,
            scheduled_at: None,
            completed_at: None,
            decision: DecisionContext::default(),
            error_detail: None,
            reject_reason: None,
            failover_of: seed.failover_of,
        }
    }

    /// Rejected before any queue entry existed.
    pub fn rejected(seed: EventSeed, reason: RejectReason, at: DateTime<Utc>) -> Self {
        let mut event = Self::base(seed, RequestState::Rejected, at);
        event.reject_reason = Some(reason);
        event.completed_at = Some(at);
        event
    }

    /// Waiting in a model queue.
    pub fn queued(
        seed: EventSeed,
        route: Route,
        queue_depth: u32,
        decision: DecisionContext,
        at: DateTime<Utc>,
    ) -> Self {
        let mut event = Self::base(seed, RequestState::Queued, at);
        event.route = Some(route);
        event.queue_depth_at_enqueue = queue_depth;
        event.decision = decision;
        event
    }

    /// Admitted straight away without waiting.
    pub fn scheduled_now(
        seed: EventSeed,
        route: Route,
        decision: DecisionContext,
        at: DateTime<Utc>,
    ) -> Self {
        let mut event = Self::base(seed, RequestState::Scheduled, at);
        event.route = Some(route);
        event.queue_depth_at_schedule = Some(0);
        event.scheduled_at = Some(at);
        event.decision = decision;
        event
    }

    fn invalid(&self, to: RequestState) -> TransitionError {
        TransitionError::InvalidTransition {
            request_id: self.request_id.clone(),
            from: self.state,
            to,
        }
    }

    /// Apply aging. Priority never decreases.
    pub fn reprioritize(&mut self, priority: i32) -> Result<bool, TransitionError> {
        if self.state != RequestState::Queued {
            return Err(self.invalid(RequestState::Queued));
        }
        if priority > self.priority_when_scheduled {
            self.priority_when_scheduled = priority;
            return Ok(true);
        }
        Ok(false)
    }

    /// Move a waiting request to another candidate.
    pub fn reroute(&mut self, route: Route) -> Result<(), TransitionError> {
        if self.state != RequestState::Queued {
            return Err(self.invalid(RequestState::Queued));
        }
        self.route = Some(route);
        Ok(())
    }

    /// `queued -> scheduled`. The timestamp is clamped to the enqueue time.
    pub fn mark_scheduled(
        &mut self,
        at: DateTime<Utc>,
        queue_depth: u32,
        decision: DecisionContext,
    ) -> Result<(), TransitionError> {
        if self.state != RequestState::Queued {
            return Err(self.invalid(RequestState::Scheduled));
        }
        self.state = RequestState::Scheduled;
        self.scheduled_at = Some(at.max(self.enqueued_at));
        self.queue_depth_at_schedule = Some(queue_depth);
        self.decision = decision;
        Ok(())
    }

    /// `scheduled -> complete | error | timeout`.
    pub fn finish(
        &mut self,
        status: TerminalStatus,
        at: DateTime<Utc>,
        detail: Option<String>,
    ) -> Result<(), TransitionError> {
        let to = RequestState::from(status);
        if self.state != RequestState::Scheduled {
            return Err(self.invalid(to));
        }
        let floor = self.scheduled_at.unwrap_or(self.enqueued_at);
        self.state = to;
        self.completed_at = Some(at.max(floor));
        self.error_detail = detail;
        Ok(())
    }

    pub fn model_id(&self) -> Option<&str> {
        self.route.as_ref().map(|r| r.model_id.as_str())
    }

    pub fn provider_kind(&self) -> Option<ProviderKind> {
        self.route.as_ref().map(|r| r.provider_kind)
    }

    /// Seconds spent waiting for a slot.
    pub fn queue_secs(&self) -> Option<f64> {
        self.scheduled_at
            .map(|s| (s - self.enqueued_at).num_milliseconds() as f64 / 1000.0)
    }

    /// Seconds spent executing.
    pub fn run_secs(&self) -> Option<f64> {
        match (self.scheduled_at, self.completed_at) {
            (Some(s), Some(c)) => Some((c - s).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn seed(id: &str) -> EventSeed {
        EventSeed {
            request_id: id.to_string(),
            policy_id: Some("default".into()),
            topic: "chat".into(),
            priority: 0,
            timeout_secs: Some(30),
            failover_of: None,
        }
    }

    fn route() -> Route {
        Route {
            model_id: "m".into(),
            provider_id: "p".into(),
            provider_kind: ProviderKind::LocalCapacity,
        }
    }

    #[test]
    fn test_full_lifecycle_keeps_timestamps_ordered() {
        let t0 = Utc::now();
        let mut event = RequestEvent::queued(seed("r1"), route(), 1, DecisionContext::default(), t0);

        // Scheduled "before" enqueue gets clamped.
        event
            .mark_scheduled(t0 - Duration::seconds(5), 0, DecisionContext::default())
            .unwrap();
        assert_eq!(event.scheduled_at, Some(t0));

        event.finish(TerminalStatus::Success, t0 + Duration::seconds(2), None).unwrap();
        assert_eq!(event.state, RequestState::Complete);
        assert_eq!(event.run_secs(), Some(2.0));
        assert_eq!(event.queue_secs(), Some(0.0));
    }

    #[test]
    fn test_reroute_only_while_queued() {
        let mut event = RequestEvent::queued(seed("r1"), route(), 1, DecisionContext::default(), Utc::now());
        let elsewhere = Route {
            model_id: "n".into(),
            provider_id: "q".into(),
            provider_kind: ProviderKind::RateLimited,
        };
        event.reroute(elsewhere.clone()).unwrap();
        assert_eq!(event.model_id(), Some("n"));

        event.mark_scheduled(Utc::now(), 0, DecisionContext::default()).unwrap();
        assert!(event.reroute(route()).is_err());
        assert_eq!(event.route, Some(elsewhere));
    }

    #[test]
    fn test_terminal_is_frozen() {
        let t0 = Utc::now();
        let mut event = RequestEvent::scheduled_now(seed("r2"), route(), DecisionContext::default(), t0);
        event.finish(TerminalStatus::Timeout, t0, Some("deadline".into())).unwrap();

        let second = event.finish(TerminalStatus::Success, t0, None);
        assert!(second.is_err());
        assert_eq!(event.state, RequestState::Timeout);
    }

    #[test]
    fn test_cannot_finish_while_queued() {
        let mut event =
            RequestEvent::queued(seed("r3"), route(), 1, DecisionContext::default(), Utc::now());
        assert!(event.finish(TerminalStatus::Error, Utc::now(), None).is_err());
    }

    #[test]
    fn test_reprioritize_is_monotonic() {
        let mut event =
            RequestEvent::queued(seed("r4"), route(), 1, DecisionContext::default(), Utc::now());
        assert!(event.reprioritize(3).unwrap());
        assert!(!event.reprioritize(2).unwrap());
        assert_eq!(event.priority_when_scheduled, 3);
        assert_eq!(event.initial_priority, 0);
    }

    #[test]
    fn test_state_ordering() {
        assert!(RequestState::Scheduled.may_follow(RequestState::Queued));
        assert!(RequestState::Queued.may_follow(RequestState::Queued));
        assert!(RequestState::Timeout.may_follow(RequestState::Scheduled));
        assert!(!RequestState::Queued.may_follow(RequestState::Scheduled));
        assert!(!RequestState::Complete.may_follow(RequestState::Timeout));
    }

    #[test]
    fn test_rejected_is_terminal() {
        let event = RequestEvent::rejected(seed("r5"), RejectReason::NoTagMatch, Utc::now());
        assert!(event.state.is_terminal());
        assert!(event.route.is_none());
        assert_eq!(event.reject_reason, Some(RejectReason::NoTagMatch));
    }
}
