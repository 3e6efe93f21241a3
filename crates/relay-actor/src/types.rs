use relay_core::actor::{ActorReport, StageRequest};
use relay_core::types::Action;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ─── Actor → engine ───────────────────────────────────────────────────────

/// Every message a script actor may print on stdout, one JSON object per
/// line, discriminated by `"type"`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActorMessage {
    /// Progress output, forwarded to the engine's log.
    Log {
        #[serde(default)]
        level: LogLevel,
        message: String,
    },
    /// Actions the actor is about to perform. The engine answers with a
    /// [`EngineMessage::Verdict`] line on stdin.
    Declare { actions: Vec<Action> },
    /// Terminal message. Anything printed afterwards is ignored.
    Outcome(ActorReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

// ─── Engine → actor ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineMessage {
    Request(RequestPayload),
    Verdict {
        allowed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule: Option<String>,
    },
}

/// The first line an actor reads: what to do, with which inputs, under which
/// capability profile.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RequestPayload {
    pub run_id: String,
    pub stage_id: String,
    pub role: String,
    pub feature: String,
    pub attempt: u32,
    pub actor_id: String,
    #[serde(default)]
    pub input_artifacts: BTreeMap<String, String>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    pub artifact_dir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instructions: String,
}

impl From<&StageRequest> for RequestPayload {
    fn from(req: &StageRequest) -> Self {
        Self {
            run_id: req.run_id.clone(),
            stage_id: req.stage_id.clone(),
            role: req.required_role.clone(),
            feature: req.feature.clone(),
            attempt: req.attempt,
            actor_id: req.profile.actor_id.clone(),
            input_artifacts: req.input_artifacts.clone(),
            actions: req.actions.clone(),
            allowed_tools: req.profile.allowed_tools.iter().cloned().collect(),
            artifact_dir: req.profile.conventions.artifact_dir.clone(),
            instructions: req.profile.instructions.clone(),
        }
    }
}

impl EngineMessage {
    pub fn allowed() -> Self {
        EngineMessage::Verdict {
            allowed: true,
            reason: None,
            rule: None,
        }
    }

    pub fn refused(reason: impl Into<String>, rule: Option<String>) -> Self {
        EngineMessage::Verdict {
            allowed: false,
            reason: Some(reason.into()),
            rule,
        }
    }
}
