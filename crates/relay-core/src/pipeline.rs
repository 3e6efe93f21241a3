//! The stage graph of a feature-delivery workflow.
//!
//! A [`PipelineGraph`] is validated once at construction (unique ids, known
//! predecessors, acyclic, every stage can reach a terminal stage) and is then
//! shared read-only between runs.

use crate::config::Conventions;
use crate::error::{RelayError, Result};
use crate::paths;
use crate::run::WorkflowRun;
use crate::stage::StageDefinition;
use crate::types::StageStatus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// PipelineDoc
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineDoc {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub stages: Vec<StageDefinition>,
    /// Stages whose completion completes the run. Defaults to every stage
    /// without successors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub terminal: Vec<String>,
}

// ---------------------------------------------------------------------------
// PipelineGraph
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PipelineGraph {
    name: String,
    description: Option<String>,
    stages: BTreeMap<String, StageDefinition>,
    successors: BTreeMap<String, BTreeSet<String>>,
    /// Deterministic topological order.
    order: Vec<String>,
    terminals: BTreeSet<String>,
    conventions: Arc<Conventions>,
}

impl PipelineGraph {
    pub fn new(doc: PipelineDoc, conventions: Arc<Conventions>) -> Result<Self> {
        paths::validate_id(&doc.name)?;
        if doc.stages.is_empty() {
            return Err(RelayError::config(format!(
                "pipeline '{}' has no stages",
                doc.name
            )));
        }

        let mut stages = BTreeMap::new();
        for stage in doc.stages {
            paths::validate_id(&stage.id)?;
            paths::validate_id(&stage.role)?;
            if stages.contains_key(&stage.id) {
                return Err(RelayError::config(format!(
                    "duplicate stage id '{}'",
                    stage.id
                )));
            }
            stages.insert(stage.id.clone(), stage);
        }

        let mut successors: BTreeMap<String, BTreeSet<String>> =
            stages.keys().map(|id| (id.clone(), BTreeSet::new())).collect();
        for stage in stages.values() {
            for pred in &stage.predecessors {
                let Some(succ) = successors.get_mut(pred) else {
                    return Err(RelayError::config(format!(
                        "stage '{}' depends on unknown stage '{pred}'",
                        stage.id
                    )));
                };
                succ.insert(stage.id.clone());
            }
        }

        let order = topological_order(&stages, &successors)?;

        let terminals: BTreeSet<String> = if doc.terminal.is_empty() {
            successors
                .iter()
                .filter(|(_, s)| s.is_empty())
                .map(|(id, _)| id.clone())
                .collect()
        } else {
            let mut set = BTreeSet::new();
            for id in doc.terminal {
                if !stages.contains_key(&id) {
                    return Err(RelayError::config(format!(
                        "terminal stage '{id}' is not defined"
                    )));
                }
                if !successors[&id].is_empty() {
                    return Err(RelayError::config(format!(
                        "terminal stage '{id}' has successors"
                    )));
                }
                set.insert(id);
            }
            set
        };

        let graph = Self {
            name: doc.name,
            description: doc.description,
            stages,
            successors,
            order,
            terminals,
            conventions,
        };
        graph.check_terminal_reachable()?;
        graph.check_rework_targets()?;
        Ok(graph)
    }

    pub fn from_yaml(data: &str, conventions: Arc<Conventions>) -> Result<Self> {
        let doc: PipelineDoc = serde_yaml::from_str(data)?;
        Self::new(doc, conventions)
    }

    pub fn load(root: &Path, conventions: Arc<Conventions>) -> Result<Self> {
        let path = paths::pipeline_path(root);
        if !path.exists() {
            return Err(RelayError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        Self::from_yaml(&data, conventions)
    }

    fn check_terminal_reachable(&self) -> Result<()> {
        // Walk backwards from the terminals; anything not visited can never
        // finish the run.
        let mut reaches: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = self.terminals.iter().map(|s| s.as_str()).collect();
        while let Some(id) = queue.pop_front() {
            if !reaches.insert(id) {
                continue;
            }
            for pred in &self.stages[id].predecessors {
                queue.push_back(pred);
            }
        }
        let entries_first = self
            .order
            .iter()
            .filter(|id| self.stages[*id].is_entry())
            .chain(self.order.iter().filter(|id| !self.stages[*id].is_entry()));
        for id in entries_first {
            if !reaches.contains(id.as_str()) {
                return Err(RelayError::UnreachableTerminal { stage: id.clone() });
            }
        }
        Ok(())
    }

    fn check_rework_targets(&self) -> Result<()> {
        for stage in self.stages.values() {
            let Some(target) = &stage.rework_from else {
                continue;
            };
            if target == &stage.id {
                continue;
            }
            if !self.stages.contains_key(target) {
                return Err(RelayError::config(format!(
                    "stage '{}' reworks from unknown stage '{target}'",
                    stage.id
                )));
            }
            if !self.ancestors(&stage.id).contains(target) {
                return Err(RelayError::config(format!(
                    "stage '{}' reworks from '{target}', which is not upstream of it",
                    stage.id
                )));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn conventions(&self) -> &Arc<Conventions> {
        &self.conventions
    }

    pub fn stage(&self, id: &str) -> Result<&StageDefinition> {
        self.stages
            .get(id)
            .ok_or_else(|| RelayError::StageNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.stages.contains_key(id)
    }

    /// Stages in topological order.
    pub fn stages(&self) -> impl Iterator<Item = &StageDefinition> {
        self.order.iter().map(|id| &self.stages[id])
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn entries(&self) -> BTreeSet<String> {
        self.stages
            .values()
            .filter(|s| s.is_entry())
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn terminals(&self) -> &BTreeSet<String> {
        &self.terminals
    }

    pub fn roles(&self) -> BTreeSet<String> {
        self.stages.values().map(|s| s.role.clone()).collect()
    }

    pub fn successors(&self, id: &str) -> impl Iterator<Item = &str> {
        self.successors
            .get(id)
            .into_iter()
            .flat_map(|s| s.iter().map(|x| x.as_str()))
    }

    /// Every stage downstream of `id`, excluding `id` itself.
    pub fn descendants(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = self.successors(id).collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.to_string()) {
                queue.extend(self.successors(next));
            }
        }
        seen
    }

    /// Every stage upstream of `id`, excluding `id` itself.
    pub fn ancestors(&self, id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = self
            .stages
            .get(id)
            .into_iter()
            .flat_map(|s| s.predecessors.iter().map(|p| p.as_str()))
            .collect();
        while let Some(next) = queue.pop_front() {
            if seen.insert(next.to_string()) {
                queue.extend(self.stages[next].predecessors.iter().map(|p| p.as_str()));
            }
        }
        seen
    }

    pub fn max_retries_for(&self, stage: &StageDefinition) -> u32 {
        stage
            .gate
            .as_ref()
            .and_then(|g| g.max_retries())
            .unwrap_or(self.conventions.max_retries)
    }

    pub fn timeout_for(&self, stage: &StageDefinition) -> Option<Duration> {
        let secs = stage
            .timeout_seconds
            .unwrap_or(self.conventions.stage_timeout_seconds);
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Stages whose predecessors have all passed and which have not passed
    /// themselves.
    pub fn next_eligible_stages(&self, run: &WorkflowRun) -> BTreeSet<String> {
        self.stages
            .values()
            .filter(|s| run.status_of(&s.id) != StageStatus::Passed)
            .filter(|s| {
                s.predecessors
                    .iter()
                    .all(|p| run.status_of(p) == StageStatus::Passed)
            })
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn is_complete(&self, run: &WorkflowRun) -> bool {
        self.terminals
            .iter()
            .all(|t| run.status_of(t) == StageStatus::Passed)
    }
}

/// Kahn's algorithm with a sorted ready set so the order is stable across
/// runs. On failure, reports one concrete cycle.
fn topological_order(
    stages: &BTreeMap<String, StageDefinition>,
    successors: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = stages
        .iter()
        .map(|(id, s)| (id.as_str(), s.predecessors.len()))
        .collect();
    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(stages.len());

    while let Some(id) = ready.pop_first() {
        order.push(id.to_string());
        for succ in &successors[id] {
            let d = in_degree.entry(succ.as_str()).or_default();
            *d -= 1;
            if *d == 0 {
                ready.insert(succ.as_str());
            }
        }
    }

    if order.len() == stages.len() {
        return Ok(order);
    }

    let placed: BTreeSet<&str> = order.iter().map(|s| s.as_str()).collect();
    let leftover: BTreeSet<&str> = stages
        .keys()
        .map(|s| s.as_str())
        .filter(|s| !placed.contains(s))
        .collect();
    Err(RelayError::CyclicPipeline {
        stages: find_cycle(stages, &leftover),
    })
}

/// Every leftover stage has at least one leftover predecessor, so walking
/// predecessors from any of them must revisit a stage.
fn find_cycle(stages: &BTreeMap<String, StageDefinition>, leftover: &BTreeSet<&str>) -> Vec<String> {
    let Some(start) = leftover.iter().next() else {
        return Vec::new();
    };
    let mut path: Vec<&str> = vec![start];
    loop {
        let current = path[path.len() - 1];
        let Some(pred) = stages[current]
            .predecessors
            .iter()
            .map(|p| p.as_str())
            .find(|p| leftover.contains(p))
        else {
            return path.iter().map(|s| s.to_string()).collect();
        };
        if let Some(pos) = path.iter().position(|s| *s == pred) {
            let mut cycle: Vec<String> = path[pos..].iter().map(|s| s.to_string()).collect();
            cycle.reverse();
            return cycle;
        }
        path.push(pred);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
