//! Ranking Engine - turns a policy and the catalog into an ordered
//! candidate list.
//!
//! Filtering happens in stages so a rejection can say which stage emptied
//! the list: policy match, privacy, tags, then per-criterion thresholds.
//! Survivors are ordered by `(failing criteria, summed chain distance, id)`.

use std::collections::BTreeSet;

use crate::catalog::{Catalog, Placement};
use crate::types::{Criterion, Model, ModelId, Policy, PolicyId, ProviderId, ProviderKind, RejectReason};

/// An eligible model with its composite sort key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedCandidate {
    pub model_id: ModelId,
    pub provider_id: ProviderId,
    pub provider_kind: ProviderKind,
    /// Thresholded criteria that cannot be compared to an unranked threshold model
    pub failing: u32,
    /// Sum of chain distances over the criteria the policy constrains
    pub distance: u64,
}

impl RankedCandidate {
    fn sort_key(&self) -> (u32, u64, &str) {
        (self.failing, self.distance, self.model_id.as_str())
    }
}

/// The outcome of ranking one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ranking {
    pub policy_id: PolicyId,
    /// Best first; never empty
    pub candidates: Vec<RankedCandidate>,
}

impl Ranking {
    pub fn best(&self) -> Option<&RankedCandidate> {
        self.candidates.first()
    }

    /// Candidates ranked after `model_id`, in order.
    pub fn after<'a>(&'a self, model_id: &'a str) -> impl Iterator<Item = &'a RankedCandidate> + 'a {
        self.candidates
            .iter()
            .skip_while(move |c| c.model_id != model_id)
            .skip(1)
    }
}

/// Pick the policy serving `topic`: exact topic over wildcard, then higher
/// priority, then smaller id.
pub fn match_policy<'a>(catalog: &'a Catalog, topic: &str) -> Option<&'a Policy> {
    catalog
        .policies()
        .filter(|p| p.topic_match(topic) > 0)
        .min_by(|a, b| {
            b.topic_match(topic)
                .cmp(&a.topic_match(topic))
                .then(b.priority.cmp(&a.priority))
                .then(a.id.cmp(&b.id))
        })
}

/// Match a policy for the request and rank the catalog under it.
pub fn route(
    catalog: &Catalog,
    topic: &str,
    required_tags: &BTreeSet<String>,
) -> Result<Ranking, (Option<PolicyId>, RejectReason)> {
    let policy = match_policy(catalog, topic).ok_or((None, RejectReason::NoMatchingPolicy))?;
    let candidates = rank(catalog, policy, required_tags).map_err(|r| (Some(policy.id.clone()), r))?;
    Ok(Ranking {
        policy_id: policy.id.clone(),
        candidates,
    })
}

/// Rank every model in the catalog under `policy`.
pub fn rank(
    catalog: &Catalog,
    policy: &Policy,
    required_tags: &BTreeSet<String>,
) -> Result<Vec<RankedCandidate>, RejectReason> {
    let private: Vec<&Model> = catalog
        .models()
        .filter(|m| m.privacy <= policy.max_privacy)
        .collect();
    if private.is_empty() {
        return Err(RejectReason::NoPrivacyEligibleModel);
    }

    let tagged: Vec<&Model> = private
        .into_iter()
        .filter(|m| m.matches_tags(required_tags))
        .collect();
    if tagged.is_empty() {
        return Err(RejectReason::NoTagMatch);
    }

    let constrained: Vec<(Criterion, &ModelId)> = policy.thresholds.iter().collect();
    let graph = catalog.graph();

    let mut ranked: Vec<RankedCandidate> = Vec::with_capacity(tagged.len());
    'models: for model in tagged {
        let Some(provider) = catalog.provider(&model.provider_id) else {
            continue;
        };

        let mut failing = 0u32;
        let mut distance = 0u64;
        for &(criterion, threshold) in &constrained {
            match verdict(catalog, criterion, &model.id, threshold) {
                Threshold::Pass => {}
                Threshold::Incomparable => failing += 1,
                Threshold::Exceeded => continue 'models,
            }
            distance += u64::from(graph.distance(criterion, &model.id));
        }

        ranked.push(RankedCandidate {
            model_id: model.id.clone(),
            provider_id: provider.id.clone(),
            provider_kind: provider.kind,
            failing,
            distance,
        });
    }

    if ranked.is_empty() {
        return Err(RejectReason::NoModelWithinThresholds);
    }
    ranked.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
    Ok(ranked)
}

enum Threshold {
    Pass,
    /// The threshold model has no rank to compare against; kept but penalised
    Incomparable,
    /// Deeper than the threshold, or unranked on a thresholded criterion
    Exceeded,
}

fn verdict(catalog: &Catalog, criterion: Criterion, model_id: &str, threshold: &str) -> Threshold {
    if model_id == threshold {
        return Threshold::Pass;
    }
    let graph = catalog.graph();
    match (
        graph.placement(criterion, model_id),
        graph.placement(criterion, threshold),
    ) {
        (Placement::Isolated, _) => Threshold::Exceeded,
        (Placement::Ranked { .. }, Placement::Isolated) => Threshold::Incomparable,
        // Distance from the head is compared across chains too.
        (Placement::Ranked { depth, .. }, Placement::Ranked { depth: limit, .. }) => {
            if depth > limit {
                Threshold::Exceeded
            } else {
                Threshold::Pass
            }
        }
    }
}
