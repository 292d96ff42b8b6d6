//! Core data model shared by every scheduler component.

pub mod catalog;
pub mod event;
pub mod snapshot;

pub use catalog::{
    Criterion, Model, ModelId, PerCriterion, Policy, PolicyId, PrivacyClass, Provider,
    ProviderId, ProviderKind, MAX_PARALLELISM, MIN_PARALLELISM, WILDCARD_TOPIC,
};
pub use event::{
    DecisionContext, EventSeed, RejectReason, RequestEvent, RequestState, Route,
    TerminalStatus, TransitionError,
};
pub use snapshot::{
    CapacityReading, LoadedModel, ProviderSnapshot, QuotaReading, QuotaSnapshot,
};
