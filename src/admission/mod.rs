//! Admission Controller - checks ranked candidates against the latest
//! capacity/quota snapshots and the per-model parallelism bound.
//!
//! Capacity rules for a local host:
//! - warm start (model already loaded): headroom >= 0
//! - cold start, known footprint: headroom >= footprint
//! - cold start, unknown footprint: headroom > safety margin
//!
//! Cold-start headroom is net of footprints already promised to cold starts
//! the host has not reported as loaded yet. A reservation is dropped when a
//! snapshot lists the model as loaded or when its last holder settles.
//!
//! A rate-limited provider defers when either remaining counter is <= 0.
//! The capacity figures seen here are frozen into the ledger row.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::capacity::SnapshotBoard;
use crate::catalog::Catalog;
use crate::ranking::RankedCandidate;
use crate::types::{DecisionContext, ModelId, ProviderId, ProviderKind};

/// Why a candidate could not be admitted right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeferReason {
    /// No capacity snapshot has been published for the host yet
    NoSnapshot,
    /// Cold start needs more headroom than is free
    InsufficientHeadroom { needed_mb: u64, headroom_mb: i64 },
    /// Cold start of unknown size, headroom not above the margin
    UnknownFootprint { margin_mb: u64, headroom_mb: i64 },
    /// Loaded model on an over-committed host
    OverCommitted { headroom_mb: i64 },
    QuotaExhausted,
    /// All parallel slots are taken
    Saturated,
    /// Model or provider vanished from the catalog
    NotInCatalog,
}

impl fmt::Display for DeferReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSnapshot => write!(f, "no capacity snapshot yet"),
            Self::InsufficientHeadroom { needed_mb, headroom_mb } => {
                write!(f, "cold start needs {needed_mb} MB, {headroom_mb} MB free")
            }
            Self::UnknownFootprint { margin_mb, headroom_mb } => {
                write!(f, "unknown footprint, {headroom_mb} MB free (margin {margin_mb} MB)")
            }
            Self::OverCommitted { headroom_mb } => write!(f, "host over-committed ({headroom_mb} MB)"),
            Self::QuotaExhausted => write!(f, "quota exhausted"),
            Self::Saturated => write!(f, "all parallel slots in use"),
            Self::NotInCatalog => write!(f, "not in catalog"),
        }
    }
}

/// Admission decision for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Admit(DecisionContext),
    Defer(DeferReason, DecisionContext),
}

/// Result of walking a ranked list.
#[derive(Debug)]
pub enum Selection<'a> {
    /// This candidate passed and its slot is already held
    Admitted {
        candidate: &'a RankedCandidate,
        decision: DecisionContext,
    },
    /// Nobody passed; queue on the best-ranked candidate
    Deferred {
        best: &'a RankedCandidate,
        decision: DecisionContext,
        reasons: Vec<(String, DeferReason)>,
    },
}

#[derive(Debug, Clone, Copy)]
struct Reservation {
    footprint_mb: u64,
    /// Admitted cold starts still running against this reservation
    holders: u32,
}

type Reservations = HashMap<ProviderId, HashMap<ModelId, Reservation>>;

pub struct AdmissionController {
    unknown_footprint_margin_mb: u64,
    reservations: Mutex<Reservations>,
}

/// Exclusive access to the reservation table for one admission decision.
///
/// Lock order: the gate is always taken before any lane lock.
pub struct AdmissionGate<'a> {
    controller: &'a AdmissionController,
    reserved: MutexGuard<'a, Reservations>,
}

impl AdmissionController {
    pub fn new(unknown_footprint_margin_mb: u64) -> Self {
        Self {
            unknown_footprint_margin_mb,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    pub fn gate(&self) -> AdmissionGate<'_> {
        AdmissionGate {
            controller: self,
            reserved: self.reservations.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Capacity/quota check for one model, ignoring parallelism.
    pub fn check(&self, catalog: &Catalog, board: &SnapshotBoard, model_id: &str) -> Verdict {
        self.gate().check(catalog, board, model_id)
    }

    /// Footprint currently promised to unreported cold starts on a host.
    pub fn reserved_mb(&self, provider_id: &str) -> u64 {
        self.gate().reserved_on(provider_id)
    }

    /// A request that was admitted with `decision` has finished.
    pub fn release(&self, provider_id: &str, model_id: &str, decision: &DecisionContext) {
        if decision.cold_start != Some(true) {
            return;
        }
        let mut reserved = self.reservations.lock().unwrap_or_else(|e| e.into_inner());
        let Some(models) = reserved.get_mut(provider_id) else {
            return;
        };
        if let Some(entry) = models.get_mut(model_id) {
            entry.holders = entry.holders.saturating_sub(1);
            if entry.holders == 0 {
                models.remove(model_id);
            }
        }
        if models.is_empty() {
            reserved.remove(provider_id);
        }
    }

    /// Walk the candidates in rank order. `try_acquire` atomically takes a
    /// parallel slot on the model and returns false when none is free; it is
    /// only called for candidates that pass the capacity/quota check.
    pub fn select<'a, F>(
        &self,
        catalog: &Catalog,
        board: &SnapshotBoard,
        candidates: &'a [RankedCandidate],
        mut try_acquire: F,
    ) -> Option<Selection<'a>>
    where
        F: FnMut(&RankedCandidate) -> bool,
    {
        let best = candidates.first()?;
        let mut gate = self.gate();
        let mut best_decision = None;
        let mut reasons = Vec::new();

        for candidate in candidates {
            let (reason, decision) = match gate.check(catalog, board, &candidate.model_id) {
                Verdict::Admit(decision) => {
                    if try_acquire(candidate) {
                        gate.commit(catalog, &candidate.model_id, &decision);
                        return Some(Selection::Admitted { candidate, decision });
                    }
                    (DeferReason::Saturated, decision)
                }
                Verdict::Defer(reason, decision) => (reason, decision),
            };
            if best_decision.is_none() {
                best_decision = Some(decision);
            }
            reasons.push((candidate.model_id.clone(), reason));
        }

        Some(Selection::Deferred {
            best,
            decision: best_decision.unwrap_or_default(),
            reasons,
        })
    }
}

impl AdmissionGate<'_> {
    fn reserved_on(&self, provider_id: &str) -> u64 {
        self.reserved
            .get(provider_id)
            .map_or(0, |models| models.values().map(|r| r.footprint_mb).sum())
    }

    /// Capacity/quota check for one model, ignoring parallelism.
    pub fn check(&mut self, catalog: &Catalog, board: &SnapshotBoard, model_id: &str) -> Verdict {
        let Some((model, provider)) = catalog.resolve(model_id) else {
            return Verdict::Defer(DeferReason::NotInCatalog, DecisionContext::default());
        };

        match provider.kind {
            ProviderKind::LocalCapacity => {
                let Some(snapshot) = board.capacity(&provider.id) else {
                    return Verdict::Defer(DeferReason::NoSnapshot, DecisionContext::default());
                };
                // The host reports these as resident now; their memory is in used_mb.
                if let Some(models) = self.reserved.get_mut(&provider.id) {
                    models.retain(|id, _| !snapshot.is_loaded(id));
                }

                let headroom_mb = snapshot.headroom_mb();
                let warm = snapshot.is_loaded(&model.id);
                let decision = DecisionContext {
                    capacity: Some(snapshot.reading()),
                    quota: None,
                    cold_start: Some(!warm),
                };

                let deferred = if warm {
                    (headroom_mb < 0).then_some(DeferReason::OverCommitted { headroom_mb })
                } else {
                    let reserved = i64::try_from(self.reserved_on(&provider.id)).unwrap_or(i64::MAX);
                    let free_mb = headroom_mb.saturating_sub(reserved);
                    let loading = self
                        .reserved
                        .get(&provider.id)
                        .is_some_and(|models| models.contains_key(&model.id));
                    match model.footprint_mb {
                        // Already being loaded: its footprint is counted in `reserved`.
                        Some(_) if loading => (free_mb < 0).then_some(DeferReason::OverCommitted { headroom_mb: free_mb }),
                        Some(needed_mb) => (free_mb < i64::try_from(needed_mb).unwrap_or(i64::MAX))
                            .then_some(DeferReason::InsufficientHeadroom { needed_mb, headroom_mb: free_mb }),
                        None => {
                            let margin_mb = self.controller.unknown_footprint_margin_mb;
                            (free_mb <= i64::try_from(margin_mb).unwrap_or(i64::MAX))
                                .then_some(DeferReason::UnknownFootprint { margin_mb, headroom_mb: free_mb })
                        }
                    }
                };
                match deferred {
                    Some(reason) => Verdict::Defer(reason, decision),
                    None => Verdict::Admit(decision),
                }
            }
            ProviderKind::RateLimited => {
                let quota = board.quota(&provider.id);
                let decision = DecisionContext {
                    capacity: None,
                    quota: quota.as_ref().map(|q| q.reading()),
                    cold_start: None,
                };
                match quota {
                    Some(q) if q.is_exhausted() => Verdict::Defer(DeferReason::QuotaExhausted, decision),
                    // No quota reading yet: let the provider tell us via headers.
                    _ => Verdict::Admit(decision),
                }
            }
        }
    }

    /// Record an admitted cold start so later decisions see its footprint
    /// before the host reports it. An unknown footprint is tracked at zero.
    pub fn commit(&mut self, catalog: &Catalog, model_id: &str, decision: &DecisionContext) {
        if decision.cold_start != Some(true) {
            return;
        }
        let Some((model, provider)) = catalog.resolve(model_id) else {
            return;
        };
        let footprint_mb = model.footprint_mb.unwrap_or(0);
        let entry = self
            .reserved
            .entry(provider.id.clone())
            .or_default()
            .entry(model.id.clone())
            .or_insert(Reservation {
                footprint_mb,
                holders: 0,
            });
        entry.holders += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::*;
    use crate::catalog::CatalogStore;
    use crate::ranking::rank;
    use crate::types::{LoadedModel, ProviderSnapshot, QuotaSnapshot};
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn snapshot(provider: &str, total_mb: u64, used_mb: u64, loaded: &[&str]) -> ProviderSnapshot {
        ProviderSnapshot {
            provider_id: provider.to_string(),
            seq: 0,
            taken_at: Utc::now(),
            total_mb,
            used_mb,
            loaded: loaded
                .iter()
                .map(|m| LoadedModel { model_id: m.to_string(), used_mb: 1000 })
                .collect(),
        }
    }

    fn quota(provider: &str, requests: i64) -> QuotaSnapshot {
        QuotaSnapshot {
            provider_id: provider.to_string(),
            taken_at: Utc::now(),
            remaining_requests: Some(requests),
            remaining_tokens: Some(10_000),
        }
    }

    /// "big" (2500 MB cold) ranks ahead of "small" (1000 MB) on one host.
    fn two_local_models() -> CatalogStore {
        let store = CatalogStore::in_memory();
        store.upsert_provider(local_provider("gpu", 8000)).unwrap();
        let mut big = model("big", "gpu");
        big.footprint_mb = Some(2500);
        let mut small = model("small", "gpu");
        small.footprint_mb = Some(1000);
        store.seed(vec![], vec![big, small], vec![]).unwrap();
        store
    }

    #[test]
    fn test_cold_start_without_headroom_defers_to_next() {
        let store = two_local_models();
        let catalog = store.snapshot();
        let board = SnapshotBoard::new();
        board.publish_capacity(snapshot("gpu", 8000, 6000, &[]));

        let ranked = rank(&catalog, &policy("p", "*"), &BTreeSet::new()).unwrap();
        assert_eq!(ranked[0].model_id, "big");

        let controller = AdmissionController::new(4096);
        match controller.select(&catalog, &board, &ranked, |_| true) {
            Some(Selection::Admitted { candidate, decision }) => {
                assert_eq!(candidate.model_id, "small");
                assert_eq!(decision.cold_start, Some(true));
                assert_eq!(decision.capacity.unwrap().headroom_mb, 2000);
            }
            other => panic!("expected small admitted, got {other:?}"),
        }
    }

    #[test]
    fn test_warm_start_needs_only_non_negative_headroom() {
        let store = two_local_models();
        let catalog = store.snapshot();
        let board = SnapshotBoard::new();
        board.publish_capacity(snapshot("gpu", 8000, 8000, &["big"]));

        let controller = AdmissionController::new(4096);
        assert!(matches!(
            controller.check(&catalog, &board, "big"),
            Verdict::Admit(DecisionContext { cold_start: Some(false), .. })
        ));
        assert!(matches!(
            controller.check(&catalog, &board, "small"),
            Verdict::Defer(DeferReason::InsufficientHeadroom { needed_mb: 1000, headroom_mb: 0 }, _)
        ));
    }

    #[test]
    fn test_unknown_footprint_uses_margin() {
        let store = CatalogStore::in_memory();
        store.upsert_provider(local_provider("gpu", 8000)).unwrap();
        store.upsert_model(model("mystery", "gpu")).unwrap();
        let catalog = store.snapshot();
        let board = SnapshotBoard::new();
        let controller = AdmissionController::new(4096);

        assert!(matches!(
            controller.check(&catalog, &board, "mystery"),
            Verdict::Defer(DeferReason::NoSnapshot, _)
        ));

        board.publish_capacity(snapshot("gpu", 8000, 3904, &[]));
        assert!(matches!(
            controller.check(&catalog, &board, "mystery"),
            Verdict::Defer(DeferReason::UnknownFootprint { .. }, _)
        ));

        board.publish_capacity(snapshot("gpu", 8000, 3000, &[]));
        assert!(matches!(controller.check(&catalog, &board, "mystery"), Verdict::Admit(_)));
    }

    #[test]
    fn test_exhausted_quota_defers_regardless_of_rank() {
        let store = CatalogStore::in_memory();
        store.upsert_provider(cloud_provider("openai")).unwrap();
        store.upsert_provider(local_provider("gpu", 8000)).unwrap();
        let mut gpt = model("gpt", "openai");
        gpt.better_than.set(crate::types::Criterion::Quality, Some("llama".into()));
        store.seed(vec![], vec![gpt, model("llama", "gpu")], vec![]).unwrap();
        let catalog = store.snapshot();

        let board = SnapshotBoard::new();
        board.publish_quota(quota("openai", 0));
        board.publish_capacity(snapshot("gpu", 8000, 0, &["llama"]));

        let mut p = policy("p", "*");
        p.thresholds.set(crate::types::Criterion::Quality, Some("llama".into()));
        let ranked = rank(&catalog, &p, &BTreeSet::new()).unwrap();
        assert_eq!(ranked[0].model_id, "gpt");

        let controller = AdmissionController::new(4096);
        match controller.select(&catalog, &board, &ranked, |_| true) {
            Some(Selection::Admitted { candidate, .. }) => assert_eq!(candidate.model_id, "llama"),
            other => panic!("expected llama admitted, got {other:?}"),
        }

        // Without quota readings a rate-limited provider is admitted.
        let fresh = SnapshotBoard::new();
        assert!(matches!(controller.check(&catalog, &fresh, "gpt"), Verdict::Admit(_)));
    }

    #[test]
    fn test_admitted_cold_starts_reserve_headroom() {
        let store = CatalogStore::in_memory();
        store.upsert_provider(local_provider("gpu", 8000)).unwrap();
        let mut x = model("x", "gpu");
        x.footprint_mb = Some(2500);
        let mut y = model("y", "gpu");
        y.footprint_mb = Some(2500);
        store.seed(vec![], vec![x, y], vec![]).unwrap();
        let catalog = store.snapshot();
        let board = SnapshotBoard::new();
        board.publish_capacity(snapshot("gpu", 8000, 5000, &[]));
        let controller = AdmissionController::new(4096);

        let only = |id: &str| {
            rank(&catalog, &policy("p", "*"), &BTreeSet::new())
                .unwrap()
                .into_iter()
                .filter(|c| c.model_id == id)
                .collect::<Vec<_>>()
        };

        let xs = only("x");
        let first = controller.select(&catalog, &board, &xs, |_| true);
        assert!(matches!(first, Some(Selection::Admitted { .. })));
        assert_eq!(controller.reserved_mb("gpu"), 2500);

        // 3000 MB free on the snapshot, 500 MB once x is accounted for.
        assert!(matches!(
            controller.check(&catalog, &board, "y"),
            Verdict::Defer(DeferReason::InsufficientHeadroom { needed_mb: 2500, headroom_mb: 500 }, _)
        ));
        // A second request for x rides on the same load.
        assert!(matches!(controller.check(&catalog, &board, "x"), Verdict::Admit(_)));

        // The host now reports x resident: the reservation is folded into used_mb.
        board.publish_capacity(snapshot("gpu", 8000, 7500, &["x"]));
        assert!(matches!(controller.check(&catalog, &board, "x"), Verdict::Admit(_)));
        assert_eq!(controller.reserved_mb("gpu"), 0);
    }

    #[test]
    fn test_settled_cold_start_releases_reservation() {
        let store = two_local_models();
        let catalog = store.snapshot();
        let board = SnapshotBoard::new();
        board.publish_capacity(snapshot("gpu", 8000, 4000, &[]));
        let controller = AdmissionController::new(4096);

        let ranked = rank(&catalog, &policy("p", "*"), &BTreeSet::new()).unwrap();
        let decision = match controller.select(&catalog, &board, &ranked, |_| true) {
            Some(Selection::Admitted { candidate, decision }) => {
                assert_eq!(candidate.model_id, "big");
                decision
            }
            other => panic!("expected big admitted, got {other:?}"),
        };
        assert_eq!(controller.reserved_mb("gpu"), 2500);

        controller.release("gpu", "big", &decision);
        assert_eq!(controller.reserved_mb("gpu"), 0);
        // Releasing again is harmless.
        controller.release("gpu", "big", &decision);
        assert_eq!(controller.reserved_mb("gpu"), 0);
    }

    #[test]
    fn test_all_saturated_defers_on_best() {
        let store = two_local_models();
        let catalog = store.snapshot();
        let board = SnapshotBoard::new();
        board.publish_capacity(snapshot("gpu", 8000, 0, &[]));

        let ranked = rank(&catalog, &policy("p", "*"), &BTreeSet::new()).unwrap();
        let controller = AdmissionController::new(4096);
        match controller.select(&catalog, &board, &ranked, |_| false) {
            Some(Selection::Deferred { best, decision, reasons }) => {
                assert_eq!(best.model_id, "big");
                assert!(decision.capacity.is_some());
                assert_eq!(reasons.len(), 2);
                assert!(reasons.iter().all(|(_, r)| *r == DeferReason::Saturated));
            }
            other => panic!("expected deferral, got {other:?}"),
        }
    }
}
