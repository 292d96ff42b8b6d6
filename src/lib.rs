//! Router Scheduler: multi-provider LLM request scheduling
//!
//! Routes topic-tagged requests to the best model a provider can serve right
//! now, queues what cannot start yet, and records every lifecycle step.
//!
//! ## Architecture
//!
//! - **Catalog**: providers, models and routing policies, versioned and persisted
//! - **Ranking**: candidate order from a policy's quality/speed/latency graph
//! - **Capacity**: per-provider monitors feeding a snapshot board
//! - **Admission**: memory and quota checks against the latest snapshots
//! - **Dispatch**: per-model lanes with aging, deadlines and parallelism bounds
//! - **Ledger**: append-only lifecycle log with retrying writes
//! - **Stats**: time-bucketed projections and the incremental push feed

pub mod admission;
pub mod api;
pub mod capacity;
pub mod catalog;
pub mod config;
pub mod dispatch;
pub mod executor;
pub mod health;
pub mod ledger;
pub mod ranking;
pub mod stats;
pub mod storage;
pub mod types;

// Re-export configuration
pub use config::RouterConfig;

// Re-export commonly used types
pub use types::{
    DecisionContext, Model, Policy, Provider, ProviderKind, ProviderSnapshot, QuotaSnapshot,
    RejectReason, RequestEvent, RequestState,
};

// Re-export the runtime components
pub use admission::AdmissionController;
pub use capacity::SnapshotBoard;
pub use catalog::{Catalog, CatalogError, CatalogStore};
pub use dispatch::{Scheduler, SchedulerError, SubmitRequest, Ticket};
pub use executor::{HttpExecutor, ModelExecutor};
pub use ledger::{EventLedger, LedgerError};
pub use stats::StatsProjector;
pub use storage::{Storage, StorageError};
