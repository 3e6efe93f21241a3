use async_trait::async_trait;
use relay_core::actor::{ActionGuard, Actor, ActorError, ActorReport, StageRequest};
use relay_core::types::StageStatus;

/// Reports a fixed status (and optional score) for every stage it is given.
///
/// Stub actors let a pipeline be rehearsed end to end before real actors
/// exist. Declared stage actions are still reviewed, so a stub bound to a
/// role whose profile forbids the stage's actions blocks like a real actor.
#[derive(Debug, Clone)]
pub struct StubActor {
    name: String,
    status: StageStatus,
    score: Option<f64>,
}

impl StubActor {
    pub fn new(name: impl Into<String>, status: StageStatus, score: Option<f64>) -> Self {
        Self {
            name: name.into(),
            status,
            score,
        }
    }

    pub fn passing(name: impl Into<String>) -> Self {
        Self::new(name, StageStatus::Passed, None)
    }
}

#[async_trait]
impl Actor for StubActor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        request: StageRequest,
        guard: ActionGuard,
    ) -> Result<ActorReport, ActorError> {
        guard.review(&request.actions)?;
        tracing::debug!(actor = %self.name, stage_id = %request.stage_id, status = %self.status, "stub report");

        let mut report = match self.status {
            StageStatus::Failed => ActorReport::failed(format!("stub '{}' reports failure", self.name)),
            _ => ActorReport::passed(),
        };
        report.status = self.status;
        if let Some(score) = self.score {
            report = report.with_score(score);
        }
        Ok(report.with_actions(request.actions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::config::Conventions;
    use relay_core::profile::CapabilityProfile;
    use relay_core::types::Action;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::Arc;

    fn request(actions: Vec<Action>) -> (StageRequest, ActionGuard) {
        let profile = Arc::new(
            CapabilityProfile::from_yaml(
                "actor_id: linter\nrole: linter\ncommands:\n  - { glob: \"cargo clippy*\", effect: allow }\n",
                Arc::new(Conventions::default()),
            )
            .unwrap(),
        );
        let req = StageRequest {
            run_id: "r".into(),
            stage_id: "lint".into(),
            required_role: "linter".into(),
            feature: "f".into(),
            attempt: 1,
            input_artifacts: BTreeMap::new(),
            actions,
            profile: Arc::clone(&profile),
        };
        (req, ActionGuard::new(profile, BTreeSet::new()))
    }

    #[tokio::test]
    async fn reports_configured_score() {
        let stub = StubActor::new("rehearsal", StageStatus::Passed, Some(9.0));
        let (req, guard) = request(vec![Action::command("cargo clippy -- -D warnings")]);
        let report = stub.invoke(req, guard).await.unwrap();
        assert_eq!(report.status, StageStatus::Passed);
        assert_eq!(report.score, Some(9.0));
        assert_eq!(report.declared_actions.len(), 1);
    }

    #[tokio::test]
    async fn failing_stub_gives_a_reason() {
        let stub = StubActor::new("rehearsal", StageStatus::Failed, None);
        let (req, guard) = request(vec![]);
        let report = stub.invoke(req, guard).await.unwrap();
        assert_eq!(report.status, StageStatus::Failed);
        assert!(report.reason.unwrap().contains("rehearsal"));
    }

    #[tokio::test]
    async fn stage_actions_are_still_reviewed() {
        let stub = StubActor::passing("rehearsal");
        let (req, guard) = request(vec![Action::command("rm -rf target")]);
        assert!(matches!(
            stub.invoke(req, guard).await,
            Err(ActorError::PermissionDenied { .. })
        ));
    }
}
