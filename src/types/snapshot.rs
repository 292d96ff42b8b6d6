//! Capacity and quota snapshots produced by the capacity monitor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::catalog::{ModelId, ProviderId};

/// A model currently resident on a capacity-constrained host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadedModel {
    pub model_id: ModelId,
    pub used_mb: u64,
}

/// Point-in-time view of a capacity-constrained host.
///
/// Superseded (never merged) by the next snapshot for the same provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSnapshot {
    pub provider_id: ProviderId,
    /// Monotonic sequence assigned when the snapshot is persisted (0 = unassigned)
    #[serde(default)]
    pub seq: u64,
    pub taken_at: DateTime<Utc>,
    pub total_mb: u64,
    pub used_mb: u64,
    pub loaded: Vec<LoadedModel>,
}

impl ProviderSnapshot {
    /// Unused capacity. Negative when the host reports over-commit.
    pub fn headroom_mb(&self) -> i64 {
        i64::try_from(self.total_mb).unwrap_or(i64::MAX)
            - i64::try_from(self.used_mb).unwrap_or(i64::MAX)
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.loaded.iter().any(|m| m.model_id == model_id)
    }

    /// Frozen copy of the figures used for an admission decision.
    pub fn reading(&self) -> CapacityReading {
        CapacityReading {
            taken_at: self.taken_at,
            total_mb: self.total_mb,
            used_mb: self.used_mb,
            headroom_mb: self.headroom_mb(),
        }
    }
}

/// Remaining request/token budget of a rate-limited provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub provider_id: ProviderId,
    pub taken_at: DateTime<Utc>,
    pub remaining_requests: Option<i64>,
    pub remaining_tokens: Option<i64>,
}

impl QuotaSnapshot {
    /// Exhausted when either known counter is at or below zero.
    pub fn is_exhausted(&self) -> bool {
        self.remaining_requests.is_some_and(|r| r <= 0)
            || self.remaining_tokens.is_some_and(|t| t <= 0)
    }

    pub fn reading(&self) -> QuotaReading {
        QuotaReading {
            taken_at: self.taken_at,
            remaining_requests: self.remaining_requests,
            remaining_tokens: self.remaining_tokens,
        }
    }
}

/// Capacity figures captured at decision time and stored on the ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityReading {
    pub taken_at: DateTime<Utc>,
    pub total_mb: u64,
    pub used_mb: u64,
    pub headroom_mb: i64,
}

/// Quota figures captured at decision time and stored on the ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaReading {
    pub taken_at: DateTime<Utc>,
    pub remaining_requests: Option<i64>,
    pub remaining_tokens: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headroom() {
        let snap = ProviderSnapshot {
            provider_id: "gpu".into(),
            seq: 0,
            taken_at: Utc::now(),
            total_mb: 8000,
            used_mb: 6000,
            loaded: vec![LoadedModel { model_id: "llama".into(), used_mb: 6000 }],
        };
        assert_eq!(snap.headroom_mb(), 2000);
        assert!(snap.is_loaded("llama"));
        assert!(!snap.is_loaded("mistral"));
    }

    #[test]
    fn test_quota_exhaustion() {
        let mut quota = QuotaSnapshot {
            provider_id: "openai".into(),
            taken_at: Utc::now(),
            remaining_requests: Some(10),
            remaining_tokens: None,
        };
        assert!(!quota.is_exhausted());
        quota.remaining_tokens = Some(0);
        assert!(quota.is_exhausted());
        quota.remaining_tokens = None;
        quota.remaining_requests = Some(0);
        assert!(quota.is_exhausted());
    }
}
