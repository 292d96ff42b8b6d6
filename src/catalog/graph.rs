//! Comparison-pointer graph.
//!
//! Each model may declare, per criterion, one model it is strictly better
//! than. Per criterion this gives a forest: out-degree <= 1, no cycles. The
//! graph is rebuilt on every catalog write and indexes, per criterion:
//!
//! - `successor`: model -> the model it beats
//! - `depth`: edge count from the chain head (0 = best)
//! - `chain`: the chain's terminal model, used to tell whether two models
//!   are comparable at all
//!
//! All traversals are iterative and bounded by the model count.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::types::{Criterion, Model, ModelId};

/// Where a model sits on one criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement<'a> {
    /// No edge in or out on this criterion
    Isolated,
    /// Part of a chain
    Ranked { depth: u32, chain: &'a str },
}

/// Structural problems found while building the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphFault {
    UnknownTarget { model: ModelId, criterion: Criterion, target: ModelId },
    SelfReference { model: ModelId, criterion: Criterion },
    Cycle { criterion: Criterion, models: Vec<ModelId> },
}

#[derive(Debug, Clone, Default)]
struct CriterionIndex {
    successor: HashMap<ModelId, ModelId>,
    depth: HashMap<ModelId, u32>,
    chain: HashMap<ModelId, ModelId>,
}

impl CriterionIndex {
    fn build(criterion: Criterion, models: &BTreeMap<ModelId, Model>) -> Result<Self, GraphFault> {
        let mut successor = HashMap::new();
        for (id, model) in models {
            let Some(target) = model.better_than.get(criterion) else {
                continue;
            };
            if target == id {
                return Err(GraphFault::SelfReference { model: id.clone(), criterion });
            }
            if !models.contains_key(target) {
                return Err(GraphFault::UnknownTarget {
                    model: id.clone(),
                    criterion,
                    target: target.clone(),
                });
            }
            successor.insert(id.clone(), target.clone());
        }

        // Kahn's algorithm over the nodes touching an edge. Longest path from
        // any head gives the depth; leftover nodes mean a cycle.
        let mut indegree: HashMap<&str, usize> = HashMap::new();
        for (from, to) in &successor {
            indegree.entry(from.as_str()).or_insert(0);
            *indegree.entry(to.as_str()).or_insert(0) += 1;
        }

        let mut ready: VecDeque<&str> = indegree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut depth: HashMap<ModelId, u32> = HashMap::new();
        let mut order: Vec<&str> = Vec::with_capacity(indegree.len());

        while let Some(id) = ready.pop_front() {
            order.push(id);
            let here = *depth.entry(id.to_string()).or_insert(0);
            if let Some(next) = successor.get(id) {
                let slot = depth.entry(next.clone()).or_insert(0);
                *slot = (*slot).max(here + 1);
                if let Some(d) = indegree.get_mut(next.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(next.as_str());
                    }
                }
            }
        }

        if order.len() != indegree.len() {
            let mut stuck: Vec<ModelId> = indegree
                .iter()
                .filter(|(_, &d)| d > 0)
                .map(|(&id, _)| id.to_string())
                .collect();
            stuck.sort();
            return Err(GraphFault::Cycle { criterion, models: stuck });
        }

        // Reverse topological order: successors resolve their chain first.
        let mut chain: HashMap<ModelId, ModelId> = HashMap::new();
        for id in order.iter().rev() {
            let tail = match successor.get(*id) {
                Some(next) => chain.get(next).cloned().unwrap_or_else(|| next.clone()),
                None => (*id).to_string(),
            };
            chain.insert((*id).to_string(), tail);
        }

        Ok(Self { successor, depth, chain })
    }
}

/// Per-criterion index over the whole model catalog.
#[derive(Debug, Clone, Default)]
pub struct ComparisonGraph {
    criteria: [CriterionIndex; 4],
    model_count: usize,
}

impl ComparisonGraph {
    pub fn build(models: &BTreeMap<ModelId, Model>) -> Result<Self, GraphFault> {
        Ok(Self {
            criteria: [
                CriterionIndex::build(Criterion::Latency, models)?,
                CriterionIndex::build(Criterion::Accuracy, models)?,
                CriterionIndex::build(Criterion::Cost, models)?,
                CriterionIndex::build(Criterion::Quality, models)?,
            ],
            model_count: models.len(),
        })
    }

    fn index(&self, criterion: Criterion) -> &CriterionIndex {
        &self.criteria[criterion.index()]
    }

    pub fn placement(&self, criterion: Criterion, model_id: &str) -> Placement<'_> {
        let index = self.index(criterion);
        match (index.depth.get(model_id), index.chain.get(model_id)) {
            (Some(&depth), Some(chain)) => Placement::Ranked {
                depth,
                chain: chain.as_str(),
            },
            _ => Placement::Isolated,
        }
    }

    /// Distance used for models with no position on a criterion.
    pub fn worst_distance(&self) -> u32 {
        u32::try_from(self.model_count).unwrap_or(u32::MAX)
    }

    /// Ranking distance: chain depth, or worst for isolated models.
    pub fn distance(&self, criterion: Criterion, model_id: &str) -> u32 {
        match self.placement(criterion, model_id) {
            Placement::Ranked { depth, .. } => depth,
            Placement::Isolated => self.worst_distance(),
        }
    }

    /// Models reachable from `model_id` by following pointers, in order.
    pub fn walk(&self, criterion: Criterion, model_id: &str) -> Vec<ModelId> {
        let index = self.index(criterion);
        let mut out = Vec::new();
        let mut current = model_id;
        while let Some(next) = index.successor.get(current) {
            if out.len() > self.model_count {
                break;
            }
            out.push(next.clone());
            current = next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PerCriterion, PrivacyClass};

    fn model(id: &str, latency_better_than: Option<&str>) -> Model {
        let mut better_than = PerCriterion::default();
        better_than.set(Criterion::Latency, latency_better_than.map(str::to_string));
        Model {
            id: id.to_string(),
            provider_id: "p".into(),
            endpoint_path: "/v1/chat/completions".into(),
            tags: Default::default(),
            max_parallel: 1,
            privacy: PrivacyClass::Local,
            footprint_mb: None,
            better_than,
        }
    }

    fn catalog(models: Vec<Model>) -> BTreeMap<ModelId, Model> {
        models.into_iter().map(|m| (m.id.clone(), m)).collect()
    }

    #[test]
    fn test_chain_depths() {
        let models = catalog(vec![
            model("a", Some("b")),
            model("b", Some("c")),
            model("c", None),
            model("lonely", None),
        ]);
        let graph = ComparisonGraph::build(&models).unwrap();

        assert_eq!(graph.distance(Criterion::Latency, "a"), 0);
        assert_eq!(graph.distance(Criterion::Latency, "b"), 1);
        assert_eq!(graph.distance(Criterion::Latency, "c"), 2);
        assert_eq!(graph.placement(Criterion::Latency, "lonely"), Placement::Isolated);
        assert_eq!(graph.distance(Criterion::Latency, "lonely"), 4);
        // Other criteria carry no edges at all.
        assert_eq!(graph.placement(Criterion::Cost, "a"), Placement::Isolated);
    }

    #[test]
    fn test_chain_identity() {
        let models = catalog(vec![
            model("a", Some("b")),
            model("b", None),
            model("x", Some("y")),
            model("y", None),
        ]);
        let graph = ComparisonGraph::build(&models).unwrap();

        let chain_of = |id: &str| match graph.placement(Criterion::Latency, id) {
            Placement::Ranked { chain, .. } => chain.to_string(),
            Placement::Isolated => String::new(),
        };
        assert_eq!(chain_of("a"), "b");
        assert_eq!(chain_of("b"), "b");
        assert_eq!(chain_of("x"), "y");
    }

    #[test]
    fn test_tree_uses_longest_path() {
        // a -> c, b -> x -> c
        let models = catalog(vec![
            model("a", Some("c")),
            model("b", Some("x")),
            model("x", Some("c")),
            model("c", None),
        ]);
        let graph = ComparisonGraph::build(&models).unwrap();
        assert_eq!(graph.distance(Criterion::Latency, "c"), 2);
        assert_eq!(graph.walk(Criterion::Latency, "b"), vec!["x".to_string(), "c".to_string()]);
    }

    #[test]
    fn test_cycle_detected() {
        let models = catalog(vec![
            model("a", Some("b")),
            model("b", Some("c")),
            model("c", Some("a")),
        ]);
        match ComparisonGraph::build(&models) {
            Err(GraphFault::Cycle { criterion, models }) => {
                assert_eq!(criterion, Criterion::Latency);
                assert_eq!(models, vec!["a", "b", "c"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_self_reference_and_unknown_target() {
        let models = catalog(vec![model("a", Some("a"))]);
        assert!(matches!(
            ComparisonGraph::build(&models),
            Err(GraphFault::SelfReference { .. })
        ));

        let models = catalog(vec![model("a", Some("ghost"))]);
        assert!(matches!(
            ComparisonGraph::build(&models),
            Err(GraphFault::UnknownTarget { .. })
        ));
    }
}
