//! The seam between the engine and whatever performs a stage's work.
//!
//! An [`Actor`] receives a [`StageRequest`] plus an [`ActionGuard`] bound to
//! its capability profile. Well-behaved actors call [`ActionGuard::review`]
//! before each side effect; whatever they report in
//! [`ActorReport::declared_actions`] is checked again by the dispatcher.

use crate::error::{RelayError, Result};
use crate::policy::{self, Verdict};
use crate::profile::CapabilityProfile;
use crate::run::ConfirmationRequest;
use crate::types::{Action, StageStatus};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Request / report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StageRequest {
    pub run_id: String,
    pub stage_id: String,
    pub required_role: String,
    pub feature: String,
    pub attempt: u32,
    /// Artifact references produced by the stage's predecessors, by stage id.
    pub input_artifacts: BTreeMap<String, String>,
    /// Actions the stage definition declares up front.
    pub actions: Vec<Action>,
    #[serde(skip)]
    pub profile: Arc<CapabilityProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorReport {
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Side effects the actor performed, for after-the-fact verification.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub declared_actions: Vec<Action>,
}

impl ActorReport {
    pub fn passed() -> Self {
        Self {
            status: StageStatus::Passed,
            score: None,
            artifact_ref: None,
            reason: None,
            declared_actions: Vec::new(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Failed,
            reason: Some(reason.into()),
            ..Self::passed()
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact_ref = Some(artifact.into());
        self
    }

    pub fn with_actions(mut self, actions: impl IntoIterator<Item = Action>) -> Self {
        self.declared_actions.extend(actions);
        self
    }
}

// ---------------------------------------------------------------------------
// ActorError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum ActorError {
    #[error("permission denied for {action}: {reason} (rule: {rule})")]
    PermissionDenied {
        action: Action,
        rule: String,
        reason: String,
    },

    #[error("confirmation required for {}", describe(requests))]
    ConfirmationRequired { requests: Vec<ConfirmationRequest> },

    #[error("{0}")]
    Failed(String),
}

fn describe(requests: &[ConfirmationRequest]) -> String {
    requests
        .iter()
        .map(|r| r.action.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// ActionGuard
// ---------------------------------------------------------------------------

/// Aggregate result of checking a batch of actions.
#[derive(Debug, Clone, PartialEq)]
pub enum Review {
    Clear,
    Denied {
        action: Action,
        rule: String,
        reason: String,
    },
    NeedsConfirmation(Vec<ConfirmationRequest>),
}

/// Policy checks for one stage attempt, with the confirmations a human has
/// already granted for that stage.
#[derive(Debug, Clone)]
pub struct ActionGuard {
    profile: Arc<CapabilityProfile>,
    approved: Arc<BTreeSet<Action>>,
}

impl ActionGuard {
    pub fn new(profile: Arc<CapabilityProfile>, approved: BTreeSet<Action>) -> Self {
        Self {
            profile,
            approved: Arc::new(approved),
        }
    }

    pub fn profile(&self) -> &CapabilityProfile {
        &self.profile
    }

    /// Evaluate one action. An "ask" rule that was already confirmed counts
    /// as allowed.
    pub fn check(&self, action: &Action) -> Verdict {
        match policy::evaluate(&self.profile, action) {
            Verdict::RequireConfirmation { rule } if self.approved.contains(action) => {
                Verdict::Allow { rule }
            }
            verdict => verdict,
        }
    }

    /// Check every action. The first denial wins; otherwise all unapproved
    /// confirmations are collected.
    pub fn review_all(&self, actions: &[Action]) -> Review {
        let mut pending = Vec::new();
        for action in actions {
            match self.check(action) {
                Verdict::Allow { .. } => {}
                Verdict::Deny { reason, rule } => {
                    return Review::Denied {
                        action: action.clone(),
                        rule: rule.unwrap_or_else(|| "default".to_string()),
                        reason,
                    }
                }
                Verdict::RequireConfirmation { rule } => pending.push(ConfirmationRequest {
                    action: action.clone(),
                    rule,
                }),
            }
        }
        if pending.is_empty() {
            Review::Clear
        } else {
            Review::NeedsConfirmation(pending)
        }
    }

    /// Actor-facing form of [`review_all`](Self::review_all).
    pub fn review(&self, actions: &[Action]) -> std::result::Result<(), ActorError> {
        match self.review_all(actions) {
            Review::Clear => Ok(()),
            Review::Denied {
                action,
                rule,
                reason,
            } => Err(ActorError::PermissionDenied {
                action,
                rule,
                reason,
            }),
            Review::NeedsConfirmation(requests) => {
                Err(ActorError::ConfirmationRequired { requests })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Actor: Send + Sync {
    /// Short label for logs.
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        request: StageRequest,
        guard: ActionGuard,
    ) -> std::result::Result<ActorReport, ActorError>;
}

/// Role to actor bindings, with an optional fallback for unbound roles.
#[derive(Clone, Default)]
pub struct ActorRegistry {
    by_role: HashMap<String, Arc<dyn Actor>>,
    fallback: Option<Arc<dyn Actor>>,
}

impl ActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, role: impl Into<String>, actor: Arc<dyn Actor>) -> &mut Self {
        self.by_role.insert(role.into(), actor);
        self
    }

    pub fn set_fallback(&mut self, actor: Arc<dyn Actor>) -> &mut Self {
        self.fallback = Some(actor);
        self
    }

    pub fn for_role(&self, role: &str) -> Result<Arc<dyn Actor>> {
        self.by_role
            .get(role)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| RelayError::ActorNotBound(role.to_string()))
    }

    pub fn is_bound(&self, role: &str) -> bool {
        self.by_role.contains_key(role) || self.fallback.is_some()
    }
}

impl std::fmt::Debug for ActorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut roles: Vec<_> = self.by_role.keys().collect();
        roles.sort();
        f.debug_struct("ActorRegistry")
            .field("roles", &roles)
            .field("fallback", &self.fallback.as_ref().map(|a| a.name().to_string()))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Conventions;

    fn profile() -> Arc<CapabilityProfile> {
        let yaml = r#"
actor_id: tester
role: tester
tools: [editor]
fs_scopes:
  - { glob: "test/**", mode: write }
commands:
  - { glob: "bundle exec rspec*", effect: allow }
  - { glob: "git push*", effect: ask }
  - { glob: "rm -rf *", effect: deny }
"#;
        Arc::new(CapabilityProfile::from_yaml(yaml, Arc::new(Conventions::default())).unwrap())
    }

    #[test]
    fn review_clear_for_allowed_actions() {
        let guard = ActionGuard::new(profile(), BTreeSet::new());
        let actions = [
            Action::write("test/models/user_spec.rb"),
            Action::command("bundle exec rspec spec/models"),
            Action::tool("editor"),
        ];
        assert_eq!(guard.review_all(&actions), Review::Clear);
        assert!(guard.review(&actions).is_ok());
    }

    #[test]
    fn first_denial_wins_over_confirmation() {
        let guard = ActionGuard::new(profile(), BTreeSet::new());
        let review = guard.review_all(&[
            Action::command("git push origin main"),
            Action::write("app/models/user.rb"),
        ]);
        let Review::Denied { action, reason, .. } = review else {
            panic!("expected denial, got {review:?}")
        };
        assert_eq!(action, Action::write("app/models/user.rb"));
        assert_eq!(reason, policy::NO_SCOPE);
    }

    #[test]
    fn approved_confirmation_counts_as_allow() {
        let push = Action::command("git push origin main");
        let guard = ActionGuard::new(profile(), BTreeSet::new());
        let err = guard.review(std::slice::from_ref(&push)).unwrap_err();
        assert!(matches!(err, ActorError::ConfirmationRequired { ref requests } if requests.len() == 1));
        assert!(err.to_string().contains("command 'git push origin main'"));

        let guard = ActionGuard::new(profile(), BTreeSet::from([push.clone()]));
        assert!(guard.check(&push).is_allow());
        // Approval never lifts a deny.
        assert!(guard.check(&Action::command("rm -rf /")).is_deny());
    }

    #[test]
    fn registry_fallback_and_missing_binding() {
        struct Nop;
        #[async_trait]
        impl Actor for Nop {
            fn name(&self) -> &str {
                "nop"
            }
            async fn invoke(
                &self,
                _request: StageRequest,
                _guard: ActionGuard,
            ) -> std::result::Result<ActorReport, ActorError> {
                Ok(ActorReport::passed())
            }
        }

        let mut registry = ActorRegistry::new();
        registry.bind("tester", Arc::new(Nop));
        assert!(registry.for_role("tester").is_ok());
        assert!(matches!(
            registry.for_role("linter"),
            Err(RelayError::ActorNotBound(_))
        ));
        registry.set_fallback(Arc::new(Nop));
        assert_eq!(registry.for_role("linter").unwrap().name(), "nop");
    }

    #[test]
    fn report_yaml_defaults() {
        let report: ActorReport = serde_json::from_str(r#"{"status":"failed"}"#).unwrap();
        assert_eq!(report.status, StageStatus::Failed);
        assert!(report.declared_actions.is_empty());
        let report = ActorReport::passed()
            .with_score(8.5)
            .with_actions([Action::read("spec/x.md")]);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"score\":8.5"));
        assert!(json.contains("\"kind\":\"read\""));
    }
}
