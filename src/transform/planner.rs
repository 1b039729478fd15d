//! Shortest transform path between two versions of a handler.
//!
//! The version graph is searched as undirected: a step may follow an edge in
//! either orientation. A path costs one per transformer it applies, identity
//! hops are free. Among equally cheap paths the one whose whole sequence of
//! transformer ids sorts smallest wins, then the one with fewer hops.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt,
    sync::Arc,
};

use semver::Version;

use super::Direction;
use crate::{
    core::{RouteError, RouteResult, Transformer},
    version::HandlerGraph,
};

/// One hop of a transform path
#[derive(Clone)]
pub struct PlanStep {
    pub from: Version,
    pub to: Version,
    /// Adapts requests shaped as `from` into `to`
    pub request: Option<Arc<dyn Transformer>>,
    /// Adapts responses shaped as `to` back into `from`
    pub response: Option<Arc<dyn Transformer>>,
}

impl PlanStep {
    /// Transformer ids applied on this hop; empty for an identity hop.
    pub fn ids(&self) -> Vec<&str> {
        self.request
            .iter()
            .chain(self.response.iter())
            .map(|t| t.id())
            .collect()
    }
}

impl fmt::Debug for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlanStep")
            .field("from", &self.from.to_string())
            .field("to", &self.to.to_string())
            .field("transformers", &self.ids())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct TransformPlan {
    from: Version,
    to: Version,
    steps: Vec<PlanStep>,
}

impl TransformPlan {
    pub fn from(&self) -> &Version {
        &self.from
    }

    pub fn to(&self) -> &Version {
        &self.to
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Every transformer id along the path, in path order.
    pub fn transformer_ids(&self) -> Vec<&str> {
        self.steps.iter().flat_map(PlanStep::ids).collect()
    }

    pub fn is_identity(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Best known way to reach `version`, ordered cheapest first
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PathLabel {
    applications: usize,
    ids: Vec<String>,
    hops: usize,
    version: Version,
}

impl PathLabel {
    fn start(version: &Version) -> Self {
        Self {
            applications: 0,
            ids: Vec::new(),
            hops: 0,
            version: version.clone(),
        }
    }

    fn extend(&self, step: &PlanStep) -> Self {
        let mut ids = self.ids.clone();
        ids.extend(step.ids().into_iter().map(str::to_string));
        Self {
            applications: ids.len(),
            ids,
            hops: self.hops + 1,
            version: step.to.clone(),
        }
    }
}

pub struct TransformPlanner;

impl TransformPlanner {
    /// Plan the path from the version a caller speaks to the version a handler was authored for.
    pub fn plan(graph: &HandlerGraph, from: &Version, to: &Version) -> RouteResult<TransformPlan> {
        let no_path = || RouteError::NoTransformPath {
            handler_id: graph.handler_id().to_string(),
            from: from.to_string(),
            to: to.to_string(),
        };

        if !graph.contains(from) || !graph.contains(to) {
            return Err(no_path());
        }

        // Labels only grow along a path and equal costs mean equally long id
        // sequences, so the best label of a prefix extends to the best path.
        let mut best = HashMap::from([(from.clone(), PathLabel::start(from))]);
        let mut previous: HashMap<Version, PlanStep> = HashMap::new();
        let mut queue = BinaryHeap::from([Reverse(PathLabel::start(from))]);
        while let Some(Reverse(label)) = queue.pop() {
            if best.get(&label.version) != Some(&label) {
                continue;
            }
            if label.version == *to {
                break;
            }
            for neighbor in graph.neighbors(&label.version) {
                let step = Self::step(graph, &label.version, neighbor);
                let candidate = label.extend(&step);
                if best.get(neighbor).map_or(true, |known| candidate < *known) {
                    best.insert(neighbor.clone(), candidate.clone());
                    previous.insert(neighbor.clone(), step);
                    queue.push(Reverse(candidate));
                }
            }
        }

        if !best.contains_key(to) {
            return Err(no_path());
        }
        let mut steps = Vec::new();
        let mut current = to.clone();
        while current != *from {
            let step = previous.remove(&current).ok_or_else(no_path)?;
            current = step.from.clone();
            steps.push(step);
        }
        steps.reverse();

        Ok(TransformPlan {
            from: from.clone(),
            to: to.clone(),
            steps,
        })
    }

    fn step(graph: &HandlerGraph, from: &Version, to: &Version) -> PlanStep {
        PlanStep {
            from: from.clone(),
            to: to.clone(),
            request: graph.transformer(from, to, Direction::Request).cloned(),
            response: graph.transformer(to, from, Direction::Response).cloned(),
        }
    }
}
