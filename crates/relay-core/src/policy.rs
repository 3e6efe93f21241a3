//! Policy matcher: decides whether one action is permitted by a profile.
//!
//! Evaluation is a pure function of `(profile, action)`. Identical inputs
//! always produce identical verdicts, which is what makes recorded runs
//! replayable for audit.

use crate::pattern::{normalize_command, normalize_path};
use crate::profile::CapabilityProfile;
use crate::types::{Action, ActionKind, Effect};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const NO_SCOPE: &str = "no scope covers path";
pub const NOT_ALLOWED: &str = "not explicitly allowed";
pub const TOOL_NOT_ALLOWED: &str = "tool not in allow-list";
pub const PATH_ESCAPES: &str = "path escapes workspace";
pub const EMPTY_COMMAND: &str = "empty command";
pub const DENIED_BY_SCOPE: &str = "denied by fs scope";
pub const DENIED_BY_RULE: &str = "denied by command rule";

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Allow {
        rule: String,
    },
    Deny {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rule: Option<String>,
    },
    /// Permitted only after a human confirms it ("ask first").
    RequireConfirmation {
        rule: String,
    },
}

impl Verdict {
    fn deny(reason: &str) -> Self {
        Verdict::Deny {
            reason: reason.to_string(),
            rule: None,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Verdict::Allow { .. })
    }

    pub fn is_deny(&self) -> bool {
        matches!(self, Verdict::Deny { .. })
    }

    /// The rule that produced the verdict, or `default` when the verdict came
    /// from the allow-list fallback.
    pub fn rule(&self) -> &str {
        match self {
            Verdict::Allow { rule } | Verdict::RequireConfirmation { rule } => rule,
            Verdict::Deny { rule, .. } => rule.as_deref().unwrap_or("default"),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow { rule } => write!(f, "allow ({rule})"),
            Verdict::RequireConfirmation { rule } => write!(f, "ask ({rule})"),
            Verdict::Deny { reason, rule: Some(rule) } => write!(f, "deny: {reason} ({rule})"),
            Verdict::Deny { reason, rule: None } => write!(f, "deny: {reason}"),
        }
    }
}

fn from_effect(effect: Effect, rule: String, deny_reason: &str) -> Verdict {
    match effect {
        Effect::Allow => Verdict::Allow { rule },
        Effect::Ask => Verdict::RequireConfirmation { rule },
        Effect::Deny => Verdict::Deny {
            reason: deny_reason.to_string(),
            rule: Some(rule),
        },
    }
}

// ---------------------------------------------------------------------------
// evaluate
// ---------------------------------------------------------------------------

pub fn evaluate(profile: &CapabilityProfile, action: &Action) -> Verdict {
    match action.kind {
        ActionKind::Read | ActionKind::Write => evaluate_fs(profile, action),
        ActionKind::Command => evaluate_command(profile, &action.target),
        ActionKind::Tool => evaluate_tool(profile, &action.target),
    }
}

fn evaluate_fs(profile: &CapabilityProfile, action: &Action) -> Verdict {
    let Some(mode) = action.kind.fs_mode() else {
        return Verdict::deny(NO_SCOPE);
    };
    if normalize_path(&action.target).is_none() {
        return Verdict::deny(PATH_ESCAPES);
    }
    match profile.scope_for(&action.target, mode) {
        Some(scope) => from_effect(scope.effect, scope.to_string(), DENIED_BY_SCOPE),
        None => Verdict::deny(NO_SCOPE),
    }
}

fn evaluate_command(profile: &CapabilityProfile, line: &str) -> Verdict {
    let line = normalize_command(line);
    if line.is_empty() {
        return Verdict::deny(EMPTY_COMMAND);
    }

    let matching: Vec<_> = profile
        .command_rules
        .iter()
        .filter(|r| r.pattern.is_match(&line))
        .collect();
    let Some(top) = matching.iter().map(|r| r.pattern.specificity()).max() else {
        return Verdict::deny(NOT_ALLOWED);
    };
    let tied: Vec<_> = matching
        .into_iter()
        .filter(|r| r.pattern.specificity() == top)
        .collect();

    // Deny overrides any allow or ask at the same specificity, whatever
    // their priority.
    if let Some(deny) = tied.iter().find(|r| r.effect == Effect::Deny) {
        return from_effect(Effect::Deny, deny.to_string(), DENIED_BY_RULE);
    }

    let winner = tied
        .into_iter()
        .max_by_key(|r| (r.priority, r.effect.rank(), std::cmp::Reverse(r.index)));
    match winner {
        Some(rule) => from_effect(rule.effect, rule.to_string(), DENIED_BY_RULE),
        None => Verdict::deny(NOT_ALLOWED),
    }
}

fn evaluate_tool(profile: &CapabilityProfile, tool: &str) -> Verdict {
    let tool = tool.trim();
    if profile.forbids(tool) {
        Verdict::deny(TOOL_NOT_ALLOWED)
    } else {
        Verdict::Allow {
            rule: format!("tools '{tool}'"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
