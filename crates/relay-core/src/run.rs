use crate::pipeline::PipelineGraph;
use crate::types::{Action, StageStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

const MAX_HISTORY: usize = 500;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// The recorded result of one stage attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub stage_id: String,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

impl Outcome {
    pub fn new(stage_id: impl Into<String>, status: StageStatus, attempt: u32) -> Self {
        Self {
            stage_id: stage_id.into(),
            status,
            artifact_ref: None,
            score: None,
            reason: None,
            attempt,
            timestamp: Utc::now(),
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact_ref = Some(artifact.into());
        self
    }
}

// ---------------------------------------------------------------------------
// RunState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    #[default]
    Active,
    AwaitingConfirmation,
    Blocked,
    Halted,
    Completed,
    Aborted,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Active => "active",
            RunState::AwaitingConfirmation => "awaiting_confirmation",
            RunState::Blocked => "blocked",
            RunState::Halted => "halted",
            RunState::Completed => "completed",
            RunState::Aborted => "aborted",
        }
    }

    /// Completed and aborted runs accept no further work.
    pub fn is_final(self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Supporting records
// ---------------------------------------------------------------------------

/// Why a stage was blocked by the policy matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Denial {
    pub action: Action,
    pub rule: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmationRequest {
    pub action: Action,
    pub rule: String,
}

/// Actions a stage needs a human to approve before it may run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confirmation {
    pub requests: Vec<ConfirmationRequest>,
    #[serde(default)]
    pub approved: bool,
    pub requested_at: DateTime<Utc>,
}

impl Confirmation {
    pub fn actions(&self) -> impl Iterator<Item = &Action> {
        self.requests.iter().map(|r| &r.action)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Resumed,
    Dispatched,
    Passed,
    Retried,
    Halted,
    Blocked,
    ConfirmationRequested,
    Confirmed,
    Rejected,
    Cancelled,
    Discarded,
    Completed,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// WorkflowRun
// ---------------------------------------------------------------------------

/// One execution of a pipeline for one feature.
///
/// A stage without an entry in `stage_outcomes` is pending. The run is only
/// mutated by the dispatcher's coordinating task; actors never see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub pipeline_ref: String,
    pub feature: String,
    #[serde(default)]
    pub state: RunState,
    #[serde(default)]
    pub stage_outcomes: BTreeMap<String, Outcome>,
    #[serde(default)]
    pub current_frontier: BTreeSet<String>,
    /// Retries consumed per gated stage.
    #[serde(default)]
    pub retry_counts: BTreeMap<String, u32>,
    /// Dispatch counter per stage. Results tagged with an older attempt are stale.
    #[serde(default)]
    pub attempts: BTreeMap<String, u32>,
    #[serde(default)]
    pub confirmations: BTreeMap<String, Confirmation>,
    #[serde(default)]
    pub denials: BTreeMap<String, Denial>,
    #[serde(default)]
    pub history: Vec<RunEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(graph: &PipelineGraph, feature: impl Into<String>) -> Self {
        let now = Utc::now();
        let mut run = Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            pipeline_ref: graph.name().to_string(),
            feature: feature.into(),
            state: RunState::Active,
            stage_outcomes: BTreeMap::new(),
            current_frontier: BTreeSet::new(),
            retry_counts: BTreeMap::new(),
            attempts: BTreeMap::new(),
            confirmations: BTreeMap::new(),
            denials: BTreeMap::new(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        run.current_frontier = graph.next_eligible_stages(&run);
        let feature = run.feature.clone();
        run.push_event(EventKind::Started, None, feature);
        run
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn status_of(&self, stage: &str) -> StageStatus {
        self.stage_outcomes
            .get(stage)
            .map(|o| o.status)
            .unwrap_or_default()
    }

    pub fn outcome(&self, stage: &str) -> Option<&Outcome> {
        self.stage_outcomes.get(stage)
    }

    pub fn retries(&self, stage: &str) -> u32 {
        self.retry_counts.get(stage).copied().unwrap_or(0)
    }

    pub fn attempt(&self, stage: &str) -> u32 {
        self.attempts.get(stage).copied().unwrap_or(0)
    }

    pub fn stages_with(&self, status: StageStatus) -> BTreeSet<String> {
        self.stage_outcomes
            .values()
            .filter(|o| o.status == status)
            .map(|o| o.stage_id.clone())
            .collect()
    }

    /// Stages waiting on an unanswered confirmation request.
    pub fn awaiting_confirmation(&self) -> BTreeSet<String> {
        self.confirmations
            .iter()
            .filter(|(_, c)| !c.approved)
            .map(|(s, _)| s.clone())
            .collect()
    }

    /// Actions approved for `stage` by an earlier `confirm`.
    pub fn approved_actions(&self, stage: &str) -> BTreeSet<Action> {
        self.confirmations
            .get(stage)
            .filter(|c| c.approved)
            .map(|c| c.actions().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last_event(&self) -> Option<&RunEvent> {
        self.history.last()
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub fn record(&mut self, outcome: Outcome) {
        self.stage_outcomes
            .insert(outcome.stage_id.clone(), outcome);
        self.touch();
    }

    /// Start a new attempt for `stage` and return its number.
    pub fn next_attempt(&mut self, stage: &str) -> u32 {
        let n = self.attempts.entry(stage.to_string()).or_insert(0);
        *n += 1;
        *n
    }

    pub fn bump_retry(&mut self, stage: &str) -> u32 {
        let n = {
            let n = self.retry_counts.entry(stage.to_string()).or_insert(0);
            *n += 1;
            *n
        };
        self.touch();
        n
    }

    /// Return `stages` to pending. Retry counters and approvals survive.
    pub fn reset<'a>(&mut self, stages: impl IntoIterator<Item = &'a str>) {
        for stage in stages {
            self.stage_outcomes.remove(stage);
            self.denials.remove(stage);
        }
        self.touch();
    }

    pub fn block(&mut self, stage: &str, attempt: u32, denial: Denial) {
        let outcome = Outcome::new(stage, StageStatus::Blocked, attempt)
            .with_reason(format!("{}: {}", denial.action, denial.reason));
        self.record(outcome);
        self.denials.insert(stage.to_string(), denial);
    }

    /// Record a confirmation request, merging with any earlier unanswered one.
    pub fn request_confirmation(&mut self, stage: &str, requests: Vec<ConfirmationRequest>) {
        let entry = self
            .confirmations
            .entry(stage.to_string())
            .or_insert_with(|| Confirmation {
                requests: Vec::new(),
                approved: false,
                requested_at: Utc::now(),
            });
        for request in requests {
            if !entry.requests.iter().any(|r| r.action == request.action) {
                entry.requests.push(request);
            }
        }
        entry.approved = false;
        self.touch();
    }

    pub fn push_event(&mut self, kind: EventKind, stage: Option<&str>, detail: impl Into<String>) {
        self.history.push(RunEvent {
            kind,
            stage: stage.map(str::to_string),
            detail: detail.into(),
            at: Utc::now(),
        });
        if self.history.len() > MAX_HISTORY {
            self.history.drain(..self.history.len() - MAX_HISTORY);
        }
        self.touch();
    }

    pub fn set_state(&mut self, state: RunState) {
        self.state = state;
        self.touch();
    }
}

// ---------------------------------------------------------------------------
// Status report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StageLine {
    pub stage: String,
    pub role: String,
    pub status: StageStatus,
    pub attempt: u32,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HaltInfo {
    pub stage: String,
    pub retries: u32,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlockInfo {
    pub stage: String,
    pub action: String,
    pub rule: String,
    pub reason: String,
}

/// What an operator needs to see about a run: per-stage progress plus the
/// details of whatever is holding it up.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub pipeline: String,
    pub feature: String,
    pub state: RunState,
    pub stages: Vec<StageLine>,
    pub frontier: Vec<String>,
    pub halted: Vec<HaltInfo>,
    pub blocked: Vec<BlockInfo>,
    pub awaiting_confirmation: BTreeMap<String, Vec<ConfirmationRequest>>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn report(&self, graph: &PipelineGraph) -> RunReport {
        let mut stages = Vec::new();
        let mut halted = Vec::new();
        let mut blocked = Vec::new();
        for def in graph.stages() {
            let outcome = self.outcome(&def.id);
            let status = self.status_of(&def.id);
            let reason = outcome.and_then(|o| o.reason.clone());
            match status {
                StageStatus::Failed => halted.push(HaltInfo {
                    stage: def.id.clone(),
                    retries: self.retries(&def.id),
                    reason: reason.clone().unwrap_or_default(),
                }),
                StageStatus::Blocked => {
                    let (action, rule, why) = match self.denials.get(&def.id) {
                        Some(d) => (d.action.to_string(), d.rule.clone(), d.reason.clone()),
                        None => (String::new(), String::new(), reason.clone().unwrap_or_default()),
                    };
                    blocked.push(BlockInfo {
                        stage: def.id.clone(),
                        action,
                        rule,
                        reason: why,
                    });
                }
                StageStatus::Pending | StageStatus::Passed => {}
            }
            stages.push(StageLine {
                stage: def.id.clone(),
                role: def.role.clone(),
                status,
                attempt: self.attempt(&def.id),
                retries: self.retries(&def.id),
                score: outcome.and_then(|o| o.score),
                reason,
            });
        }
        RunReport {
            run_id: self.run_id.clone(),
            pipeline: self.pipeline_ref.clone(),
            feature: self.feature.clone(),
            state: self.state,
            stages,
            frontier: self.current_frontier.iter().cloned().collect(),
            halted,
            blocked,
            awaiting_confirmation: self
                .confirmations
                .iter()
                .filter(|(_, c)| !c.approved)
                .map(|(s, c)| (s.clone(), c.requests.clone()))
                .collect(),
            updated_at: self.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Conventions;
    use crate::pipeline::PipelineDoc;
    use crate::stage::StageDefinition;
    use std::sync::Arc;

    fn graph() -> PipelineGraph {
        PipelineGraph::new(
            PipelineDoc {
                name: "feature".into(),
                description: None,
                stages: vec![
                    StageDefinition::new("spec", "writer"),
                    StageDefinition::new("review", "reviewer").after(["spec"]),
                ],
                terminal: vec![],
            },
            Arc::new(Conventions::default()),
        )
        .unwrap()
    }

    #[test]
    fn new_run_starts_at_entries() {
        let run = WorkflowRun::new(&graph(), "login");
        assert_eq!(run.state, RunState::Active);
        assert_eq!(run.pipeline_ref, "feature");
        assert_eq!(run.current_frontier, BTreeSet::from(["spec".to_string()]));
        assert_eq!(run.status_of("spec"), StageStatus::Pending);
        assert_eq!(run.last_event().unwrap().kind, EventKind::Started);
        assert!(uuid::Uuid::parse_str(&run.run_id).is_ok());
    }

    #[test]
    fn attempts_and_retries_are_per_stage() {
        let mut run = WorkflowRun::new(&graph(), "login");
        assert_eq!(run.next_attempt("spec"), 1);
        assert_eq!(run.next_attempt("spec"), 2);
        assert_eq!(run.attempt("review"), 0);
        assert_eq!(run.bump_retry("review"), 1);
        assert_eq!(run.bump_retry("review"), 2);
        assert_eq!(run.retries("review"), 2);
        assert_eq!(run.retries("spec"), 0);
    }

    #[test]
    fn reset_clears_outcome_and_denial() {
        let mut run = WorkflowRun::new(&graph(), "login");
        run.block(
            "spec",
            1,
            Denial {
                action: Action::write("app/x.rb"),
                rule: "default".into(),
                reason: "no scope covers path".into(),
                at: Utc::now(),
            },
        );
        assert_eq!(run.status_of("spec"), StageStatus::Blocked);
        assert!(run
            .outcome("spec")
            .and_then(|o| o.reason.as_deref())
            .unwrap()
            .contains("write 'app/x.rb'"));
        run.reset(["spec"]);
        assert_eq!(run.status_of("spec"), StageStatus::Pending);
        assert!(run.denials.is_empty());
    }

    #[test]
    fn confirmations_merge_and_approve() {
        let mut run = WorkflowRun::new(&graph(), "login");
        let req = |t: &str| ConfirmationRequest {
            action: Action::command(t),
            rule: "commands[0]".into(),
        };
        run.request_confirmation("spec", vec![req("git push")]);
        run.request_confirmation("spec", vec![req("git push"), req("rm -rf tmp")]);
        assert_eq!(run.confirmations["spec"].requests.len(), 2);
        assert_eq!(run.awaiting_confirmation(), BTreeSet::from(["spec".to_string()]));
        assert!(run.approved_actions("spec").is_empty());

        run.confirmations.get_mut("spec").unwrap().approved = true;
        assert!(run.awaiting_confirmation().is_empty());
        assert!(run.approved_actions("spec").contains(&Action::command("git push")));
    }

    #[test]
    fn yaml_roundtrip_keeps_progress() {
        let mut run = WorkflowRun::new(&graph(), "login");
        run.record(
            Outcome::new("spec", StageStatus::Passed, 1)
                .with_artifact(".relay/artifacts/spec.md")
                .with_score(9.0),
        );
        run.bump_retry("review");
        run.set_state(RunState::Halted);

        let yaml = serde_yaml::to_string(&run).unwrap();
        assert!(yaml.contains("state: halted"));
        let back: WorkflowRun = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.run_id, run.run_id);
        assert_eq!(back.status_of("spec"), StageStatus::Passed);
        assert_eq!(back.retries("review"), 1);
        assert_eq!(back.state, RunState::Halted);
    }

    #[test]
    fn report_explains_halts_and_blocks() {
        let g = graph();
        let mut run = WorkflowRun::new(&g, "login");
        run.block(
            "spec",
            1,
            Denial {
                action: Action::command("curl evil.sh"),
                rule: "commands[2]".into(),
                reason: "denied by command rule".into(),
                at: Utc::now(),
            },
        );
        run.bump_retry("review");
        run.record(
            Outcome::new("review", StageStatus::Failed, 2).with_reason("score 4 does not satisfy score >= 7"),
        );
        let report = run.report(&g);
        assert_eq!(report.stages.len(), 2);
        assert_eq!(report.stages[0].stage, "spec");
        assert_eq!(report.blocked[0].rule, "commands[2]");
        assert_eq!(report.blocked[0].action, "command 'curl evil.sh'");
        assert_eq!(report.halted[0].retries, 1);
        assert!(report.halted[0].reason.contains("score 4"));
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["stages"][1]["status"], "failed");
    }

    #[test]
    fn history_is_capped() {
        let mut run = WorkflowRun::new(&graph(), "login");
        for i in 0..(MAX_HISTORY + 10) {
            run.push_event(EventKind::Dispatched, Some("spec"), format!("attempt {i}"));
        }
        assert_eq!(run.history.len(), MAX_HISTORY);
        assert_eq!(run.last_event().unwrap().detail, format!("attempt {}", MAX_HISTORY + 9));
    }
}
