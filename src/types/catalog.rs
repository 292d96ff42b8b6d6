//! Catalog records - providers, models and routing policies.
//!
//! These are configuration, not runtime state. They are written through the
//! catalog store (which validates them) and read by ranking and admission.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub type ProviderId = String;
pub type ModelId = String;
pub type PolicyId = String;

/// Wildcard policy topic matching any request topic.
pub const WILDCARD_TOPIC: &str = "*";

/// Bounds for a model's declared parallelism.
pub const MIN_PARALLELISM: u32 = 1;
pub const MAX_PARALLELISM: u32 = 256;

// ============================================================================
// Provider
// ============================================================================

/// How a provider constrains the work sent to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Local inference host bounded by memory (VRAM-like) capacity
    LocalCapacity,
    /// Hosted API bounded by request/token quotas
    RateLimited,
}

impl ProviderKind {
    pub fn is_local(self) -> bool {
        matches!(self, Self::LocalCapacity)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalCapacity => write!(f, "local"),
            Self::RateLimited => write!(f, "cloud"),
        }
    }
}

/// An inference provider (local host or hosted API).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub name: String,
    pub kind: ProviderKind,
    /// Base endpoint, e.g. `http://gpu-01:11434`
    pub base_url: String,
    /// Name of the environment variable holding the API credential
    #[serde(default)]
    pub credential_ref: Option<String>,
    /// Total capacity in MB (capacity-constrained providers only)
    #[serde(default)]
    pub capacity_mb: Option<u64>,
}

impl Provider {
    /// Credential value from the environment variable named by `credential_ref`.
    pub fn resolve_credential(&self) -> Option<String> {
        let var = self.credential_ref.as_deref()?;
        std::env::var(var).ok().filter(|v| !v.is_empty())
    }

    /// Join the base endpoint and a path without doubling slashes.
    pub fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

// ============================================================================
// Privacy
// ============================================================================

/// Ordinal privacy classification. Lower is more private.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyClass {
    Local = 0,
    CloudInRegionTrusted = 1,
    CloudInRegionUntrusted = 2,
    CloudOutOfRegion = 3,
}

// ============================================================================
// Comparison criteria
// ============================================================================

/// A criterion along which models are compared through declared pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    Latency,
    Accuracy,
    Cost,
    Quality,
}

impl Criterion {
    pub const ALL: [Self; 4] = [Self::Latency, Self::Accuracy, Self::Cost, Self::Quality];

    pub fn index(self) -> usize {
        match self {
            Self::Latency => 0,
            Self::Accuracy => 1,
            Self::Cost => 2,
            Self::Quality => 3,
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Latency => write!(f, "latency"),
            Self::Accuracy => write!(f, "accuracy"),
            Self::Cost => write!(f, "cost"),
            Self::Quality => write!(f, "quality"),
        }
    }
}

/// One optional model reference per criterion.
///
/// Used both for a model's "strictly better than" pointers and for a
/// policy's "no worse than" thresholds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerCriterion {
    #[serde(default)]
    pub latency: Option<ModelId>,
    #[serde(default)]
    pub accuracy: Option<ModelId>,
    #[serde(default)]
    pub cost: Option<ModelId>,
    #[serde(default)]
    pub quality: Option<ModelId>,
}

impl PerCriterion {
    pub fn get(&self, criterion: Criterion) -> Option<&ModelId> {
        match criterion {
            Criterion::Latency => self.latency.as_ref(),
            Criterion::Accuracy => self.accuracy.as_ref(),
            Criterion::Cost => self.cost.as_ref(),
            Criterion::Quality => self.quality.as_ref(),
        }
    }

    pub fn set(&mut self, criterion: Criterion, value: Option<ModelId>) {
        let slot = match criterion {
            Criterion::Latency => &mut self.latency,
            Criterion::Accuracy => &mut self.accuracy,
            Criterion::Cost => &mut self.cost,
            Criterion::Quality => &mut self.quality,
        };
        *slot = value;
    }

    /// Iterate the criteria that carry a reference.
    pub fn iter(&self) -> impl Iterator<Item = (Criterion, &ModelId)> + '_ {
        Criterion::ALL
            .into_iter()
            .filter_map(move |c| self.get(c).map(|id| (c, id)))
    }

    pub fn references(&self, model_id: &str) -> bool {
        self.iter().any(|(_, id)| id == model_id)
    }
}

// ============================================================================
// Model
// ============================================================================

/// A routable model on a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: ModelId,
    pub provider_id: ProviderId,
    /// Path appended to the provider base URL for inference calls
    pub endpoint_path: String,
    /// Keywords used for tag matching
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Maximum concurrently scheduled requests (1..=256)
    pub max_parallel: u32,
    pub privacy: PrivacyClass,
    /// Memory needed to cold-start the model on a local host
    #[serde(default)]
    pub footprint_mb: Option<u64>,
    /// Per criterion: the model this one is strictly better than
    #[serde(default)]
    pub better_than: PerCriterion,
}

impl Model {
    /// True when the request tags are empty or share at least one tag.
    pub fn matches_tags(&self, required: &BTreeSet<String>) -> bool {
        required.is_empty() || required.iter().any(|t| self.tags.contains(t))
    }
}

// ============================================================================
// Policy
// ============================================================================

/// A routing policy: who it belongs to, which topic it serves, and the
/// thresholds a model must meet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub owner_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Per criterion: candidates must be no worse than this model
    #[serde(default)]
    pub thresholds: PerCriterion,
    /// Highest privacy class acceptable
    pub max_privacy: PrivacyClass,
    /// Tie-break when several policies match a topic (higher wins)
    #[serde(default)]
    pub priority: i32,
    /// Matched against the request topic (`*` matches everything)
    pub topic: String,
}

impl Policy {
    /// Topic match quality: 2 = exact, 1 = wildcard, 0 = no match.
    pub fn topic_match(&self, topic: &str) -> u8 {
        if self.topic == WILDCARD_TOPIC {
            1
        } else if self.topic.eq_ignore_ascii_case(topic) {
            2
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privacy_ordering() {
        assert!(PrivacyClass::Local < PrivacyClass::CloudInRegionTrusted);
        assert!(PrivacyClass::CloudInRegionTrusted < PrivacyClass::CloudInRegionUntrusted);
        assert!(PrivacyClass::CloudInRegionUntrusted < PrivacyClass::CloudOutOfRegion);
    }

    #[test]
    fn test_per_criterion_set_and_iter() {
        let mut p = PerCriterion::default();
        p.set(Criterion::Cost, Some("b".to_string()));
        p.set(Criterion::Latency, Some("c".to_string()));

        let items: Vec<_> = p.iter().collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].0, Criterion::Latency);
        assert!(p.references("b"));
        assert!(!p.references("a"));
    }

    #[test]
    fn test_topic_match() {
        let mut policy = Policy {
            id: "p".into(),
            owner_id: "o".into(),
            name: "n".into(),
            description: String::new(),
            thresholds: PerCriterion::default(),
            max_privacy: PrivacyClass::Local,
            priority: 0,
            topic: "Grading".into(),
        };
        assert_eq!(policy.topic_match("grading"), 2);
        assert_eq!(policy.topic_match("chat"), 0);
        policy.topic = WILDCARD_TOPIC.into();
        assert_eq!(policy.topic_match("chat"), 1);
        // A literal "*" topic still only gets the wildcard score.
        assert_eq!(policy.topic_match("*"), 1);
    }

    #[test]
    fn test_tag_matching() {
        let model = Model {
            id: "m".into(),
            provider_id: "p".into(),
            endpoint_path: "/v1/chat/completions".into(),
            tags: ["code".to_string(), "math".to_string()].into_iter().collect(),
            max_parallel: 1,
            privacy: PrivacyClass::Local,
            footprint_mb: None,
            better_than: PerCriterion::default(),
        };
        assert!(model.matches_tags(&BTreeSet::new()));
        assert!(model.matches_tags(&["math".to_string()].into_iter().collect()));
        assert!(!model.matches_tags(&["poetry".to_string()].into_iter().collect()));
    }

    #[test]
    fn test_provider_kind_serde() {
        let json = serde_json::to_string(&ProviderKind::RateLimited).unwrap();
        assert_eq!(json, "\"rate_limited\"");
    }
}
