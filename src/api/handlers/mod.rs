//! API route handlers
//!
//! Request handling logic for all API endpoints including:
//! - Catalog administration (providers, models, policies)
//! - Request submission and the latest-activity view
//! - Aggregated request and capacity statistics
//! - System health

mod catalog;
mod requests;
mod stats;
mod system;

pub use catalog::*;
pub use requests::*;
pub use stats::*;
pub use system::*;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::capacity::SnapshotBoard;
use crate::catalog::CatalogStore;
use crate::config::RouterConfig;
use crate::dispatch::Scheduler;
use crate::ledger::EventLedger;
use crate::stats::StatsProjector;

// ============================================================================
// API State
// ============================================================================

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub catalog: Arc<CatalogStore>,
    pub board: Arc<SnapshotBoard>,
    pub ledger: Arc<EventLedger>,
    pub stats: Arc<StatsProjector>,
    pub config: Arc<RouterConfig>,
    pub started_at: DateTime<Utc>,
}
