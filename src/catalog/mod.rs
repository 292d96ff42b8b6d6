//! Catalog Store - providers, models and policies as versioned snapshots.
//!
//! Readers get an immutable `Arc<Catalog>` (lock-free via `arc-swap`) and pass
//! it explicitly to ranking and admission. Writers go through a single write
//! lock: the change is applied to a draft, the whole draft is validated
//! (including the comparison graph), and only then is the new version
//! published and persisted. An invalid write never becomes visible.

pub mod graph;

pub use graph::{ComparisonGraph, GraphFault, Placement};

use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

use crate::storage::catalog::{CatalogChanges, CatalogRepository, CatalogTable};
use crate::types::{
    Criterion, Model, ModelId, Policy, PolicyId, Provider, ProviderId, ProviderKind,
    MAX_PARALLELISM, MIN_PARALLELISM,
};

/// Configuration errors, rejected synchronously at write time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    #[error("comparison pointers on {criterion} would form a cycle through {models:?}")]
    Cycle { criterion: Criterion, models: Vec<ModelId> },
    #[error("model '{model}' cannot be better than itself on {criterion}")]
    SelfReference { model: ModelId, criterion: Criterion },
    #[error("model '{model}' points at unknown model '{target}' on {criterion}")]
    UnknownComparisonTarget { model: ModelId, criterion: Criterion, target: ModelId },
    #[error("policy '{policy}' threshold on {criterion} references unknown model '{model}'")]
    MalformedThreshold { policy: PolicyId, criterion: Criterion, model: ModelId },
    #[error("unknown provider '{0}'")]
    UnknownProvider(ProviderId),
    #[error("unknown model '{0}'")]
    UnknownModel(ModelId),
    #[error("unknown policy '{0}'")]
    UnknownPolicy(PolicyId),
    #[error("model '{model}' max_parallel {value} outside {MIN_PARALLELISM}..={MAX_PARALLELISM}")]
    InvalidParallelism { model: ModelId, value: u32 },
    #[error("provider '{0}' is immutable except for credential rotation")]
    ProviderImmutable(ProviderId),
    #[error("invalid {kind} '{id}': {reason}")]
    Invalid { kind: &'static str, id: String, reason: String },
    #[error("'{id}' is still referenced by {by}")]
    InUse { id: String, by: String },
    #[error("catalog persistence failed: {0}")]
    Storage(String),
}

impl From<GraphFault> for CatalogError {
    fn from(fault: GraphFault) -> Self {
        match fault {
            GraphFault::Cycle { criterion, models } => Self::Cycle { criterion, models },
            GraphFault::SelfReference { model, criterion } => Self::SelfReference { model, criterion },
            GraphFault::UnknownTarget { model, criterion, target } => {
                Self::UnknownComparisonTarget { model, criterion, target }
            }
        }
    }
}

// ============================================================================
// Catalog snapshot
// ============================================================================

/// An immutable, validated catalog version.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    version: u64,
    providers: BTreeMap<ProviderId, Provider>,
    models: BTreeMap<ModelId, Model>,
    policies: BTreeMap<PolicyId, Policy>,
    graph: ComparisonGraph,
}

impl Catalog {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn provider(&self, id: &str) -> Option<&Provider> {
        self.providers.get(id)
    }

    pub fn model(&self, id: &str) -> Option<&Model> {
        self.models.get(id)
    }

    pub fn policy(&self, id: &str) -> Option<&Policy> {
        self.policies.get(id)
    }

    pub fn providers(&self) -> impl Iterator<Item = &Provider> {
        self.providers.values()
    }

    pub fn models(&self) -> impl Iterator<Item = &Model> {
        self.models.values()
    }

    pub fn policies(&self) -> impl Iterator<Item = &Policy> {
        self.policies.values()
    }

    pub fn graph(&self) -> &ComparisonGraph {
        &self.graph
    }

    pub fn models_on(&self, provider_id: &str) -> impl Iterator<Item = &Model> + '_ {
        let provider_id = provider_id.to_string();
        self.models.values().filter(move |m| m.provider_id == provider_id)
    }

    /// Model and its provider together.
    pub fn resolve(&self, model_id: &str) -> Option<(&Model, &Provider)> {
        let model = self.models.get(model_id)?;
        let provider = self.providers.get(&model.provider_id)?;
        Some((model, provider))
    }

    fn validate(&self) -> Result<ComparisonGraph, CatalogError> {
        for provider in self.providers.values() {
            validate_provider(provider)?;
        }

        for model in self.models.values() {
            if model.id.trim().is_empty() {
                return Err(invalid("model", &model.id, "id must not be empty"));
            }
            if !self.providers.contains_key(&model.provider_id) {
                return Err(CatalogError::UnknownProvider(model.provider_id.clone()));
            }
            if !(MIN_PARALLELISM..=MAX_PARALLELISM).contains(&model.max_parallel) {
                return Err(CatalogError::InvalidParallelism {
                    model: model.id.clone(),
                    value: model.max_parallel,
                });
            }
        }

        for policy in self.policies.values() {
            if policy.topic.trim().is_empty() {
                return Err(invalid("policy", &policy.id, "topic must not be empty"));
            }
            for (criterion, model) in policy.thresholds.iter() {
                if !self.models.contains_key(model) {
                    return Err(CatalogError::MalformedThreshold {
                        policy: policy.id.clone(),
                        criterion,
                        model: model.clone(),
                    });
                }
            }
        }

        Ok(ComparisonGraph::build(&self.models)?)
    }
}

fn invalid(kind: &'static str, id: &str, reason: &str) -> CatalogError {
    CatalogError::Invalid {
        kind,
        id: id.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_provider(provider: &Provider) -> Result<(), CatalogError> {
    if provider.id.trim().is_empty() {
        return Err(invalid("provider", &provider.id, "id must not be empty"));
    }
    if !(provider.base_url.starts_with("http://") || provider.base_url.starts_with("https://")) {
        return Err(invalid("provider", &provider.id, "base_url must be http(s)"));
    }
    if provider.kind == ProviderKind::LocalCapacity && provider.capacity_mb.unwrap_or(0) == 0 {
        return Err(invalid(
            "provider",
            &provider.id,
            "capacity-constrained providers must declare capacity_mb",
        ));
    }
    Ok(())
}

// ============================================================================
// Catalog store
// ============================================================================

/// Mutable working copy used while applying a write.
pub struct CatalogDraft {
    pub providers: BTreeMap<ProviderId, Provider>,
    pub models: BTreeMap<ModelId, Model>,
    pub policies: BTreeMap<PolicyId, Policy>,
}

/// Owner of the current catalog version.
pub struct CatalogStore {
    current: ArcSwap<Catalog>,
    write_lock: Mutex<()>,
    repo: Option<CatalogRepository>,
}

impl CatalogStore {
    /// Empty, memory-only store.
    pub fn in_memory() -> Self {
        Self {
            current: ArcSwap::from_pointee(Catalog::default()),
            write_lock: Mutex::new(()),
            repo: None,
        }
    }

    /// Load the persisted catalog. Rows that no longer validate as a whole
    /// fail the load rather than being partially admitted.
    pub fn load(repo: CatalogRepository) -> Result<Self, CatalogError> {
        let rows = repo
            .load_all()
            .map_err(|e| CatalogError::Storage(e.to_string()))?;

        let mut catalog = Catalog {
            version: 1,
            providers: rows.providers.into_iter().map(|p| (p.id.clone(), p)).collect(),
            models: rows.models.into_iter().map(|m| (m.id.clone(), m)).collect(),
            policies: rows.policies.into_iter().map(|p| (p.id.clone(), p)).collect(),
            graph: ComparisonGraph::default(),
        };
        catalog.graph = catalog.validate()?;

        info!(
            providers = catalog.providers.len(),
            models = catalog.models.len(),
            policies = catalog.policies.len(),
            "Catalog loaded"
        );

        Ok(Self {
            current: ArcSwap::from_pointee(catalog),
            write_lock: Mutex::new(()),
            repo: Some(repo),
        })
    }

    /// Current catalog version.
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.current.load_full()
    }

    /// Apply a batch of changes atomically.
    pub fn apply<F>(&self, change: F) -> Result<Arc<Catalog>, CatalogError>
    where
        F: FnOnce(&mut CatalogDraft) -> Result<(), CatalogError>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let old = self.current.load_full();

        let mut draft = CatalogDraft {
            providers: old.providers.clone(),
            models: old.models.clone(),
            policies: old.policies.clone(),
        };
        change(&mut draft)?;

        let mut next = Catalog {
            version: old.version + 1,
            providers: draft.providers,
            models: draft.models,
            policies: draft.policies,
            graph: ComparisonGraph::default(),
        };
        next.graph = next.validate()?;

        if let Some(repo) = &self.repo {
            let storage_err = |e: crate::storage::StorageError| CatalogError::Storage(e.to_string());
            let mut changes = CatalogChanges::default();
            diff_rows(&mut changes, CatalogTable::Providers, &old.providers, &next.providers).map_err(storage_err)?;
            diff_rows(&mut changes, CatalogTable::Models, &old.models, &next.models).map_err(storage_err)?;
            diff_rows(&mut changes, CatalogTable::Policies, &old.policies, &next.policies).map_err(storage_err)?;
            // Disk first; memory only moves once every table is written.
            repo.commit(&changes).map_err(storage_err)?;
            repo.flush().map_err(storage_err)?;
        }

        let next = Arc::new(next);
        self.current.store(Arc::clone(&next));
        debug!(version = next.version, "Catalog version published");
        Ok(next)
    }

    /// Create a provider. Re-submitting an identical provider is a no-op;
    /// any other change to an existing provider is refused.
    pub fn upsert_provider(&self, provider: Provider) -> Result<Arc<Catalog>, CatalogError> {
        self.apply(|draft| {
            if let Some(existing) = draft.providers.get(&provider.id) {
                if *existing != provider {
                    return Err(CatalogError::ProviderImmutable(provider.id.clone()));
                }
            }
            draft.providers.insert(provider.id.clone(), provider);
            Ok(())
        })
    }

    /// The one mutation a provider allows.
    pub fn rotate_credential(
        &self,
        provider_id: &str,
        credential_ref: Option<String>,
    ) -> Result<Arc<Catalog>, CatalogError> {
        self.apply(|draft| {
            let provider = draft
                .providers
                .get_mut(provider_id)
                .ok_or_else(|| CatalogError::UnknownProvider(provider_id.to_string()))?;
            provider.credential_ref = credential_ref;
            Ok(())
        })
    }

    pub fn remove_provider(&self, provider_id: &str) -> Result<Arc<Catalog>, CatalogError> {
        self.apply(|draft| {
            if let Some(model) = draft.models.values().find(|m| m.provider_id == provider_id) {
                return Err(CatalogError::InUse {
                    id: provider_id.to_string(),
                    by: format!("model '{}'", model.id),
                });
            }
            draft
                .providers
                .remove(provider_id)
                .map(|_| ())
                .ok_or_else(|| CatalogError::UnknownProvider(provider_id.to_string()))
        })
    }

    pub fn upsert_model(&self, model: Model) -> Result<Arc<Catalog>, CatalogError> {
        self.apply(|draft| {
            draft.models.insert(model.id.clone(), model);
            Ok(())
        })
    }

    pub fn remove_model(&self, model_id: &str) -> Result<Arc<Catalog>, CatalogError> {
        self.apply(|draft| {
            if let Some(other) = draft.models.values().find(|m| m.better_than.references(model_id)) {
                return Err(CatalogError::InUse {
                    id: model_id.to_string(),
                    by: format!("comparison pointer on model '{}'", other.id),
                });
            }
            if let Some(policy) = draft.policies.values().find(|p| p.thresholds.references(model_id)) {
                return Err(CatalogError::InUse {
                    id: model_id.to_string(),
                    by: format!("threshold on policy '{}'", policy.id),
                });
            }
            draft
                .models
                .remove(model_id)
                .map(|_| ())
                .ok_or_else(|| CatalogError::UnknownModel(model_id.to_string()))
        })
    }

    pub fn upsert_policy(&self, policy: Policy) -> Result<Arc<Catalog>, CatalogError> {
        self.apply(|draft| {
            draft.policies.insert(policy.id.clone(), policy);
            Ok(())
        })
    }

    pub fn remove_policy(&self, policy_id: &str) -> Result<Arc<Catalog>, CatalogError> {
        self.apply(|draft| {
            draft
                .policies
                .remove(policy_id)
                .map(|_| ())
                .ok_or_else(|| CatalogError::UnknownPolicy(policy_id.to_string()))
        })
    }

    /// Apply a seed in one validated batch. Existing providers are left
    /// untouched; models and policies are upserted.
    pub fn seed(
        &self,
        providers: Vec<Provider>,
        models: Vec<Model>,
        policies: Vec<Policy>,
    ) -> Result<Arc<Catalog>, CatalogError> {
        self.apply(|draft| {
            for provider in providers {
                draft.providers.entry(provider.id.clone()).or_insert(provider);
            }
            for model in models {
                draft.models.insert(model.id.clone(), model);
            }
            for policy in policies {
                draft.policies.insert(policy.id.clone(), policy);
            }
            Ok(())
        })
    }
}

fn diff_rows<T: Serialize + PartialEq>(
    changes: &mut CatalogChanges,
    table: CatalogTable,
    old: &BTreeMap<String, T>,
    new: &BTreeMap<String, T>,
) -> Result<(), crate::storage::StorageError> {
    for (id, row) in new {
        if old.get(id) != Some(row) {
            changes.put(table, id, row)?;
        }
    }
    for id in old.keys().filter(|id| !new.contains_key(*id)) {
        changes.delete(table, id);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::types::{PerCriterion, PrivacyClass};

    pub fn local_provider(id: &str, capacity_mb: u64) -> Provider {
        Provider {
            id: id.to_string(),
            name: id.to_uppercase(),
            kind: ProviderKind::LocalCapacity,
            base_url: format!("http://{id}:11434"),
            credential_ref: None,
            capacity_mb: Some(capacity_mb),
        }
    }

    pub fn cloud_provider(id: &str) -> Provider {
        Provider {
            id: id.to_string(),
            name: id.to_uppercase(),
            kind: ProviderKind::RateLimited,
            base_url: format!("https://api.{id}.example"),
            credential_ref: Some(format!("{}_API_KEY", id.to_uppercase())),
            capacity_mb: None,
        }
    }

    pub fn model(id: &str, provider: &str) -> Model {
        Model {
            id: id.to_string(),
            provider_id: provider.to_string(),
            endpoint_path: "/v1/chat/completions".into(),
            tags: ["chat".to_string()].into_iter().collect(),
            max_parallel: 1,
            privacy: PrivacyClass::Local,
            footprint_mb: None,
            better_than: PerCriterion::default(),
        }
    }

    pub fn policy(id: &str, topic: &str) -> Policy {
        Policy {
            id: id.to_string(),
            owner_id: "team".into(),
            name: id.to_string(),
            description: String::new(),
            thresholds: PerCriterion::default(),
            max_privacy: PrivacyClass::CloudOutOfRegion,
            priority: 0,
            topic: topic.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::storage::Storage;

    fn chained_store() -> CatalogStore {
        let store = CatalogStore::in_memory();
        store.upsert_provider(local_provider("gpu", 8000)).unwrap();
        let mut a = model("a", "gpu");
        a.better_than.set(Criterion::Latency, Some("b".into()));
        let mut b = model("b", "gpu");
        b.better_than.set(Criterion::Latency, Some("c".into()));
        store.seed(vec![], vec![a, b, model("c", "gpu")], vec![]).unwrap();
        store
    }

    #[test]
    fn test_versions_increase() {
        let store = CatalogStore::in_memory();
        let v0 = store.snapshot().version();
        store.upsert_provider(local_provider("gpu", 8000)).unwrap();
        assert_eq!(store.snapshot().version(), v0 + 1);
    }

    #[test]
    fn test_cycle_rejected_and_not_published() {
        let store = chained_store();
        let before = store.snapshot().version();

        let mut c = model("c", "gpu");
        c.better_than.set(Criterion::Latency, Some("a".into()));
        let err = store.upsert_model(c).unwrap_err();

        assert!(matches!(err, CatalogError::Cycle { criterion: Criterion::Latency, .. }));
        assert_eq!(store.snapshot().version(), before);
        assert!(store.snapshot().model("c").unwrap().better_than.latency.is_none());
    }

    #[test]
    fn test_model_requires_known_provider_and_valid_parallelism() {
        let store = CatalogStore::in_memory();
        assert_eq!(
            store.upsert_model(model("m", "nowhere")).unwrap_err(),
            CatalogError::UnknownProvider("nowhere".into())
        );

        store.upsert_provider(local_provider("gpu", 8000)).unwrap();
        let mut m = model("m", "gpu");
        m.max_parallel = 0;
        assert!(matches!(
            store.upsert_model(m).unwrap_err(),
            CatalogError::InvalidParallelism { value: 0, .. }
        ));
    }

    #[test]
    fn test_malformed_threshold_rejected() {
        let store = chained_store();
        let mut p = policy("p", "chat");
        p.thresholds.set(Criterion::Cost, Some("ghost".into()));
        assert!(matches!(
            store.upsert_policy(p).unwrap_err(),
            CatalogError::MalformedThreshold { criterion: Criterion::Cost, .. }
        ));
    }

    #[test]
    fn test_provider_immutable_except_credential() {
        let store = CatalogStore::in_memory();
        store.upsert_provider(cloud_provider("openai")).unwrap();

        // Identical resubmission is fine.
        store.upsert_provider(cloud_provider("openai")).unwrap();

        let mut changed = cloud_provider("openai");
        changed.base_url = "https://elsewhere.example".into();
        assert_eq!(
            store.upsert_provider(changed).unwrap_err(),
            CatalogError::ProviderImmutable("openai".into())
        );

        store.rotate_credential("openai", Some("NEW_KEY".into())).unwrap();
        assert_eq!(
            store.snapshot().provider("openai").unwrap().credential_ref.as_deref(),
            Some("NEW_KEY")
        );
    }

    #[test]
    fn test_local_provider_needs_capacity() {
        let store = CatalogStore::in_memory();
        let mut p = local_provider("gpu", 0);
        p.capacity_mb = None;
        assert!(matches!(store.upsert_provider(p).unwrap_err(), CatalogError::Invalid { .. }));
    }

    #[test]
    fn test_remove_referenced_model_refused() {
        let store = chained_store();
        assert!(matches!(store.remove_model("b").unwrap_err(), CatalogError::InUse { .. }));
        assert!(matches!(store.remove_provider("gpu").unwrap_err(), CatalogError::InUse { .. }));
        // "a" is a chain head nobody points at.
        store.remove_model("a").unwrap();
        assert!(store.snapshot().model("a").is_none());
    }

    #[test]
    fn test_catalog_persists_across_reload() {
        let storage = Storage::temporary().unwrap();
        {
            let store = CatalogStore::load(storage.catalog().unwrap()).unwrap();
            store.upsert_provider(local_provider("gpu", 8000)).unwrap();
            store.upsert_model(model("m", "gpu")).unwrap();
            store.upsert_policy(policy("p", "*")).unwrap();
            store.remove_policy("p").unwrap();
        }

        let reloaded = CatalogStore::load(storage.catalog().unwrap()).unwrap();
        let catalog = reloaded.snapshot();
        assert!(catalog.provider("gpu").is_some());
        assert!(catalog.model("m").is_some());
        assert!(catalog.policy("p").is_none());
    }
}
