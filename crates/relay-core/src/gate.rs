use crate::run::Outcome;
use crate::types::StageStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Comparator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Comparator {
    pub fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            Comparator::Ge => lhs >= rhs,
            Comparator::Gt => lhs > rhs,
            Comparator::Le => lhs <= rhs,
            Comparator::Lt => lhs < rhs,
            Comparator::Eq => lhs == rhs,
            Comparator::Ne => lhs != rhs,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Comparator::Ge => ">=",
            Comparator::Gt => ">",
            Comparator::Le => "<=",
            Comparator::Lt => "<",
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// GateSpec
// ---------------------------------------------------------------------------

/// A pass/fail rule applied to a stage's outcome.
///
/// `max_retries` is the number of retries after the first attempt: `0` means
/// one attempt total, `2` means up to three. When unset, the project-wide
/// convention applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateSpec {
    /// Passes when the reported score satisfies `comparator value`.
    Threshold {
        comparator: Comparator,
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_retries: Option<u32>,
    },
    /// Passes when the reported status is `passed`.
    Boolean {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_retries: Option<u32>,
    },
}

impl GateSpec {
    pub fn threshold(comparator: Comparator, value: f64) -> Self {
        GateSpec::Threshold {
            comparator,
            value,
            max_retries: None,
        }
    }

    pub fn boolean() -> Self {
        GateSpec::Boolean { max_retries: None }
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        match &mut self {
            GateSpec::Threshold { max_retries, .. } | GateSpec::Boolean { max_retries } => {
                *max_retries = Some(retries)
            }
        }
        self
    }

    pub fn max_retries(&self) -> Option<u32> {
        match self {
            GateSpec::Threshold { max_retries, .. } | GateSpec::Boolean { max_retries } => {
                *max_retries
            }
        }
    }

    /// Whether `outcome` satisfies the gate, ignoring the retry budget.
    pub fn passes(&self, outcome: &Outcome) -> bool {
        match self {
            GateSpec::Threshold {
                comparator, value, ..
            } => {
                outcome.status != StageStatus::Failed
                    && outcome
                        .score
                        .is_some_and(|s| !s.is_nan() && comparator.holds(s, *value))
            }
            GateSpec::Boolean { .. } => outcome.status == StageStatus::Passed,
        }
    }
}

impl fmt::Display for GateSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GateSpec::Threshold {
                comparator, value, ..
            } => write!(f, "score {comparator} {value}"),
            GateSpec::Boolean { .. } => f.write_str("status == passed"),
        }
    }
}

// ---------------------------------------------------------------------------
// GateDecision
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum GateDecision {
    Advance,
    Retry { reason: String },
    Halt { reason: String },
}

/// Decide what happens after a stage produced `outcome`.
///
/// `retries_used` is the gated stage's retry counter before this decision.
/// Stages without a gate advance on `passed` and halt on anything else; they
/// never retry implicitly.
pub fn decide(
    gate: Option<&GateSpec>,
    outcome: &Outcome,
    retries_used: u32,
    default_max_retries: u32,
) -> GateDecision {
    let Some(gate) = gate else {
        return match outcome.status {
            StageStatus::Passed => GateDecision::Advance,
            _ => GateDecision::Halt {
                reason: failure_reason(None, outcome),
            },
        };
    };

    if gate.passes(outcome) {
        return GateDecision::Advance;
    }

    let reason = failure_reason(Some(gate), outcome);
    let budget = gate.max_retries().unwrap_or(default_max_retries);
    if retries_used < budget {
        GateDecision::Retry { reason }
    } else {
        GateDecision::Halt {
            reason: format!("{reason} (retry budget {budget} exhausted)"),
        }
    }
}

fn failure_reason(gate: Option<&GateSpec>, outcome: &Outcome) -> String {
    if let Some(reason) = &outcome.reason {
        return reason.clone();
    }
    match (gate, outcome.score) {
        (Some(g @ GateSpec::Threshold { .. }), Some(score)) => {
            format!("score {score} does not satisfy {g}")
        }
        (Some(GateSpec::Threshold { .. }), None) => "no score reported".to_string(),
        _ => format!("stage reported {}", outcome.status),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(score: f64) -> Outcome {
        Outcome::new("review", StageStatus::Passed, 1).with_score(score)
    }

    #[test]
    fn threshold_yaml_shape() {
        let gate: GateSpec =
            serde_yaml::from_str("kind: threshold\ncomparator: \">=\"\nvalue: 7\n").unwrap();
        assert_eq!(gate, GateSpec::threshold(Comparator::Ge, 7.0));
        let yaml = serde_yaml::to_string(&gate.clone().with_max_retries(3)).unwrap();
        assert!(yaml.contains("kind: threshold"));
        assert!(yaml.contains("max_retries: 3"));
    }

    #[test]
    fn boolean_yaml_shape() {
        let gate: GateSpec = serde_yaml::from_str("kind: boolean\nmax_retries: 1\n").unwrap();
        assert_eq!(gate, GateSpec::boolean().with_max_retries(1));
    }

    #[test]
    fn comparators() {
        assert!(Comparator::Ge.holds(7.0, 7.0));
        assert!(!Comparator::Gt.holds(7.0, 7.0));
        assert!(Comparator::Le.holds(3.0, 7.0));
        assert!(Comparator::Lt.holds(3.0, 7.0));
        assert!(Comparator::Eq.holds(1.0, 1.0));
        assert!(Comparator::Ne.holds(1.0, 2.0));
    }

    #[test]
    fn threshold_retry_then_advance() {
        let gate = GateSpec::threshold(Comparator::Ge, 7.0);
        assert!(matches!(
            decide(Some(&gate), &scored(4.0), 0, 2),
            GateDecision::Retry { .. }
        ));
        assert_eq!(decide(Some(&gate), &scored(8.0), 1, 2), GateDecision::Advance);
    }

    #[test]
    fn threshold_halts_when_budget_exhausted() {
        let gate = GateSpec::threshold(Comparator::Ge, 7.0).with_max_retries(1);
        let d = decide(Some(&gate), &scored(5.0), 1, 5);
        let GateDecision::Halt { reason } = d else {
            panic!("expected halt, got {d:?}")
        };
        assert!(reason.contains("score 5 does not satisfy score >= 7"));
        assert!(reason.contains("retry budget 1 exhausted"));
    }

    #[test]
    fn threshold_missing_score_fails() {
        let gate = GateSpec::threshold(Comparator::Ge, 7.0);
        let outcome = Outcome::new("review", StageStatus::Passed, 1);
        assert_eq!(
            decide(Some(&gate), &outcome, 0, 1),
            GateDecision::Retry {
                reason: "no score reported".into()
            }
        );
    }

    #[test]
    fn threshold_ignores_score_on_failed_status() {
        let gate = GateSpec::threshold(Comparator::Ge, 7.0);
        let outcome = Outcome::new("review", StageStatus::Failed, 1).with_score(9.0);
        assert!(matches!(
            decide(Some(&gate), &outcome, 0, 1),
            GateDecision::Retry { .. }
        ));
    }

    #[test]
    fn boolean_gate() {
        let gate = GateSpec::boolean();
        let passed = Outcome::new("green", StageStatus::Passed, 1);
        let failed = Outcome::new("green", StageStatus::Failed, 1).with_reason("3 examples failed");
        assert_eq!(decide(Some(&gate), &passed, 0, 2), GateDecision::Advance);
        assert_eq!(
            decide(Some(&gate), &failed, 0, 2),
            GateDecision::Retry {
                reason: "3 examples failed".into()
            }
        );
        assert!(matches!(
            decide(Some(&gate), &failed, 2, 2),
            GateDecision::Halt { .. }
        ));
    }

    #[test]
    fn ungated_stage_never_retries() {
        let failed = Outcome::new("plan", StageStatus::Failed, 1);
        assert!(matches!(
            decide(None, &failed, 0, 5),
            GateDecision::Halt { .. }
        ));
        let passed = Outcome::new("plan", StageStatus::Passed, 1);
        assert_eq!(decide(None, &passed, 0, 5), GateDecision::Advance);
    }

    #[test]
    fn decide_is_idempotent() {
        let gate = GateSpec::threshold(Comparator::Gt, 6.5);
        for score in [0.0, 6.5, 6.6, 10.0] {
            let outcome = scored(score);
            assert_eq!(
                decide(Some(&gate), &outcome, 1, 2),
                decide(Some(&gate), &outcome, 1, 2)
            );
        }
    }
}
