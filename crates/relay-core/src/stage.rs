use crate::gate::GateSpec;
use crate::types::Action;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One unit of work in a pipeline: who does it, what must finish first, and
/// what quality bar its result has to clear.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDefinition {
    pub id: String,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, alias = "after", skip_serializing_if = "BTreeSet::is_empty")]
    pub predecessors: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateSpec>,
    /// Actions the stage always needs. Checked against the actor's profile
    /// before the actor is invoked.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<Action>,
    /// Stage that produced the work this stage judges. A failed gate sends
    /// the run back there instead of re-running this stage alone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rework_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl StageDefinition {
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
            description: None,
            predecessors: BTreeSet::new(),
            gate: None,
            actions: Vec::new(),
            rework_from: None,
            timeout_seconds: None,
        }
    }

    pub fn after<I, S>(mut self, predecessors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.predecessors
            .extend(predecessors.into_iter().map(Into::into));
        self
    }

    pub fn gated(mut self, gate: GateSpec) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn requires(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    pub fn rework_from(mut self, stage: impl Into<String>) -> Self {
        self.rework_from = Some(stage.into());
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = Some(seconds);
        self
    }

    pub fn is_entry(&self) -> bool {
        self.predecessors.is_empty()
    }

    /// The stage a failed gate routes back to.
    pub fn rework_target(&self) -> &str {
        self.rework_from.as_deref().unwrap_or(&self.id)
    }
}
