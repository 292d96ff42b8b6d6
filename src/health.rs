//! Observability health.
//!
//! Dispatch never waits on any of this. A degraded ledger or a stale
//! snapshot only lowers the reported status:
//! - ledger: pending retries or dropped writes
//! - capacity: a provider with no snapshot, or one older than `stale_after_secs`

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use crate::capacity::{SnapshotAge, SnapshotBoard};
use crate::catalog::Catalog;
use crate::ledger::LedgerHealth;
use crate::types::{ProviderId, ProviderKind};

/// Component health status
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// Running, but observations are incomplete
    Degraded { reason: String },
    /// Nothing trustworthy to report
    Unhealthy { reason: String },
}

impl HealthStatus {
    fn rank(&self) -> u8 {
        match self {
            Self::Healthy => 0,
            Self::Degraded { .. } => 1,
            Self::Unhealthy { .. } => 2,
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded { reason } => write!(f, "DEGRADED: {}", reason),
            HealthStatus::Unhealthy { reason } => write!(f, "UNHEALTHY: {}", reason),
        }
    }
}

/// Something whose health can be reported.
pub trait HealthCheck {
    fn component_name(&self) -> &str;
    fn check(&self) -> HealthStatus;
}

pub struct LedgerCheck<'a>(pub &'a LedgerHealth);

impl HealthCheck for LedgerCheck<'_> {
    fn component_name(&self) -> &str {
        "ledger"
    }

    fn check(&self) -> HealthStatus {
        let h = self.0;
        if h.dropped_writes > 0 {
            HealthStatus::Degraded {
                reason: format!("{} ledger rows dropped after retries", h.dropped_writes),
            }
        } else if h.pending_retries > 0 {
            HealthStatus::Degraded {
                reason: format!("{} ledger rows awaiting retry", h.pending_retries),
            }
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Freshness of one provider's latest snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderFreshness {
    pub provider_id: ProviderId,
    pub kind: ProviderKind,
    pub taken_at: Option<DateTime<Utc>>,
    pub age_secs: Option<i64>,
    pub stale: bool,
}

pub struct SnapshotCheck {
    pub providers: Vec<ProviderFreshness>,
}

impl SnapshotCheck {
    /// One row per catalog provider. Missing snapshots count as stale.
    pub fn observe(catalog: &Catalog, board: &SnapshotBoard, stale_after_secs: i64, now: DateTime<Utc>) -> Self {
        let ages: HashMap<(String, &'static str), SnapshotAge> = board
            .ages(now)
            .into_iter()
            .map(|a| ((a.provider_id.clone(), a.kind), a))
            .collect();

        let providers = catalog
            .providers()
            .map(|p| {
                let kind_key = match p.kind {
                    ProviderKind::LocalCapacity => "capacity",
                    ProviderKind::RateLimited => "quota",
                };
                let age = ages.get(&(p.id.clone(), kind_key));
                ProviderFreshness {
                    provider_id: p.id.clone(),
                    kind: p.kind,
                    taken_at: age.map(|a| a.taken_at),
                    age_secs: age.map(|a| a.age_secs),
                    stale: age.map_or(true, |a| a.age_secs > stale_after_secs),
                }
            })
            .collect();
        Self { providers }
    }
}

impl HealthCheck for SnapshotCheck {
    fn component_name(&self) -> &str {
        "capacity_snapshots"
    }

    fn check(&self) -> HealthStatus {
        let stale: Vec<&str> = self
            .providers
            .iter()
            .filter(|p| p.stale)
            .map(|p| p.provider_id.as_str())
            .collect();
        if stale.is_empty() {
            HealthStatus::Healthy
        } else if stale.len() == self.providers.len() {
            HealthStatus::Unhealthy {
                reason: format!("no fresh snapshot from any provider ({})", stale.join(", ")),
            }
        } else {
            HealthStatus::Degraded {
                reason: format!("stale snapshots: {}", stale.join(", ")),
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub name: String,
    #[serde(flatten)]
    pub status: HealthStatus,
}

/// Aggregated health, worst component wins.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealth {
    pub overall: HealthStatus,
    pub components: Vec<ComponentHealth>,
    pub ledger: LedgerHealth,
    pub providers: Vec<ProviderFreshness>,
    pub catalog_version: u64,
    pub checked_at: DateTime<Utc>,
}

impl SystemHealth {
    pub fn collect(
        catalog: &Catalog,
        board: &SnapshotBoard,
        ledger: LedgerHealth,
        stale_after_secs: i64,
    ) -> Self {
        let now = Utc::now();
        let snapshots = SnapshotCheck::observe(catalog, board, stale_after_secs, now);
        let checks: [&dyn HealthCheck; 2] = [&LedgerCheck(&ledger), &snapshots];

        let components: Vec<ComponentHealth> = checks
            .iter()
            .map(|c| ComponentHealth {
                name: c.component_name().to_string(),
                status: c.check(),
            })
            .collect();
        let overall = components
            .iter()
            .map(|c| c.status.clone())
            .max_by_key(HealthStatus::rank)
            .unwrap_or(HealthStatus::Healthy);

        Self {
            overall,
            components,
            ledger,
            providers: snapshots.providers,
            catalog_version: catalog.version(),
            checked_at: now,
        }
    }
}
