//! The stage coordinator.
//!
//! One coordinating task per run owns the [`WorkflowRun`]. Each dispatched
//! stage runs as its own tokio task in a [`JoinSet`]; the coordinator waits for
//! whichever finishes first (or for an abort signal), applies the gate, and
//! dispatches whatever became eligible. Results carry the attempt number they
//! were started with so that anything superseded by rework or abort is
//! discarded instead of recorded.

use crate::actor::{
    ActionGuard, Actor, ActorError, ActorRegistry, ActorReport, Review, StageRequest,
};
use crate::error::{RelayError, Result};
use crate::gate::{self, GateDecision};
use crate::pipeline::PipelineGraph;
use crate::profile::ProfileSet;
use crate::run::{ConfirmationRequest, Denial, EventKind, Outcome, RunState, WorkflowRun};
use crate::stage::StageDefinition;
use crate::store::{RunLock, RunStore};
use crate::types::{Action, StageStatus};
use chrono::Utc;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Task plumbing
// ---------------------------------------------------------------------------

enum Completion {
    Report(ActorReport),
    Error(ActorError),
    TimedOut(u64),
    Panicked(String),
}

struct StageResult {
    stage_id: String,
    attempt: u32,
    completion: Completion,
}

struct InFlight {
    attempt: u32,
    handle: tokio::task::AbortHandle,
}

/// Requests that an in-progress [`Dispatcher::advance_until`] abort its run.
#[derive(Debug, Clone)]
pub struct AbortSignal(watch::Sender<bool>);

impl AbortSignal {
    pub fn abort(&self) {
        self.0.send_replace(true);
    }
}

pub fn abort_channel() -> (AbortSignal, watch::Receiver<bool>) {
    let (tx, rx) = watch::channel(false);
    (AbortSignal(tx), rx)
}

async fn abort_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nobody can abort any more.
            std::future::pending::<()>().await;
        }
    }
}

async fn execute(
    actor: Arc<dyn Actor>,
    request: StageRequest,
    guard: ActionGuard,
    timeout: Option<Duration>,
) -> StageResult {
    let stage_id = request.stage_id.clone();
    let attempt = request.attempt;
    let invocation = AssertUnwindSafe(actor.invoke(request, guard)).catch_unwind();

    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, invocation).await {
            Ok(joined) => joined,
            Err(_) => {
                return StageResult {
                    stage_id,
                    attempt,
                    completion: Completion::TimedOut(limit.as_secs()),
                }
            }
        },
        None => invocation.await,
    };

    let completion = match joined {
        Ok(Ok(report)) => Completion::Report(report),
        Ok(Err(e)) => Completion::Error(e),
        Err(panic) => Completion::Panicked(
            panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string()),
        ),
    };
    StageResult {
        stage_id,
        attempt,
        completion,
    }
}

fn outcome_from_report(stage_id: &str, attempt: u32, report: ActorReport) -> Outcome {
    let (status, reason) = match report.status {
        StageStatus::Passed => (StageStatus::Passed, report.reason),
        StageStatus::Failed => (StageStatus::Failed, report.reason),
        other => (
            StageStatus::Failed,
            Some(
                report
                    .reason
                    .unwrap_or_else(|| format!("actor reported {other}")),
            ),
        ),
    };
    Outcome {
        stage_id: stage_id.to_string(),
        status,
        artifact_ref: report.artifact_ref,
        score: report.score,
        reason,
        attempt,
        timestamp: Utc::now(),
    }
}

fn describe(requests: &[ConfirmationRequest]) -> String {
    requests
        .iter()
        .map(|r| format!("{} ({})", r.action, r.rule))
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    pipeline: Arc<PipelineGraph>,
    profiles: Arc<ProfileSet>,
    actors: ActorRegistry,
    store: Option<RunStore>,
}

impl Dispatcher {
    /// Every role the pipeline uses must have a profile and an actor.
    pub fn new(
        pipeline: Arc<PipelineGraph>,
        profiles: Arc<ProfileSet>,
        actors: ActorRegistry,
    ) -> Result<Self> {
        for role in pipeline.roles() {
            profiles.for_role(&role)?;
            actors.for_role(&role)?;
        }
        Ok(Self {
            pipeline,
            profiles,
            actors,
            store: None,
        })
    }

    pub fn with_store(mut self, store: RunStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn pipeline(&self) -> &Arc<PipelineGraph> {
        &self.pipeline
    }

    pub fn profiles(&self) -> &Arc<ProfileSet> {
        &self.profiles
    }

    fn store(&self) -> Result<&RunStore> {
        self.store
            .as_ref()
            .ok_or_else(|| RelayError::config("dispatcher has no run store attached"))
    }

    /// Take the run's coordinator lock and make sure `run` is not older than
    /// the persisted copy. Without a store there is nothing to contend for.
    fn claim(&self, run: &WorkflowRun) -> Result<Option<RunLock>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let lock = store.lock(&run.run_id)?;
        match store.load(&run.run_id) {
            Ok(stored) if stored.updated_at > run.updated_at => {
                Err(RelayError::InvalidTransition {
                    from: stored.state.to_string(),
                    to: run.state.to_string(),
                    reason: format!("run '{}' changed on disk since it was loaded", run.run_id),
                })
            }
            Ok(_) | Err(RelayError::RunNotFound(_)) => Ok(Some(lock)),
            Err(e) => Err(e),
        }
    }

    fn persist(&self, run: &WorkflowRun) -> Result<()> {
        match &self.store {
            Some(store) if run.state.is_final() => store.archive(run),
            Some(store) => store.save(run),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Create and persist a run for `feature` without dispatching anything.
    pub fn open(&self, feature: &str) -> Result<WorkflowRun> {
        let feature = feature.trim();
        if feature.is_empty() {
            return Err(RelayError::config("feature must not be empty"));
        }
        let run = WorkflowRun::new(&self.pipeline, feature);
        info!(run_id = %run.run_id, feature, pipeline = %run.pipeline_ref, "run started");
        self.persist(&run)?;
        Ok(run)
    }

    /// Reload a persisted run for further dispatch. Passed stages are kept.
    pub fn reopen(&self, run_id: &str) -> Result<WorkflowRun> {
        let mut run = self.store()?.load(run_id)?;
        self.check_advanceable(&run)?;
        run.push_event(EventKind::Resumed, None, "");
        info!(run_id = %run.run_id, state = %run.state, "run resumed");
        Ok(run)
    }

    /// Create a run for `feature` and drive it as far as it can go.
    pub async fn start(&self, feature: &str) -> Result<WorkflowRun> {
        let run = self.open(feature)?;
        self.advance(run).await
    }

    pub async fn resume(&self, run_id: &str) -> Result<WorkflowRun> {
        let run = self.reopen(run_id)?;
        self.advance(run).await
    }

    pub async fn advance(&self, run: WorkflowRun) -> Result<WorkflowRun> {
        let (_signal, rx) = abort_channel();
        self.advance_until(run, rx).await
    }

    /// Dispatch eligible stages until nothing is runnable or in flight, or
    /// until `abort` fires.
    pub async fn advance_until(
        &self,
        mut run: WorkflowRun,
        mut abort: watch::Receiver<bool>,
    ) -> Result<WorkflowRun> {
        self.check_advanceable(&run)?;
        let _lock = self.claim(&run)?;
        run.set_state(RunState::Active);

        let mut tasks: JoinSet<StageResult> = JoinSet::new();
        let mut in_flight: HashMap<String, InFlight> = HashMap::new();

        loop {
            self.dispatch_ready(&mut run, &mut tasks, &mut in_flight)?;
            self.persist(&run)?;
            if in_flight.is_empty() {
                break;
            }

            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = abort_requested(&mut abort) => {
                    tasks.abort_all();
                    self.abort_in_place(&mut run, "abort requested");
                    self.persist(&run)?;
                    return Ok(run);
                }
            };

            match joined {
                Some(Ok(result)) => self.apply(&mut run, result, &mut in_flight)?,
                Some(Err(e)) if e.is_cancelled() => {}
                Some(Err(e)) => {
                    warn!(run_id = %run.run_id, error = %e, "stage task failed to join")
                }
                None => break,
            }
        }

        self.settle(&mut run);
        self.persist(&run)?;
        Ok(run)
    }

    fn check_advanceable(&self, run: &WorkflowRun) -> Result<()> {
        if run.pipeline_ref != self.pipeline.name() {
            return Err(RelayError::config(format!(
                "run '{}' belongs to pipeline '{}', not '{}'",
                run.run_id,
                run.pipeline_ref,
                self.pipeline.name()
            )));
        }
        ensure_open(run, RunState::Active)
    }

    /// Mark every unfinished stage blocked and the run aborted.
    pub fn abort(&self, run: &mut WorkflowRun, reason: &str) -> Result<()> {
        ensure_open(run, RunState::Aborted)?;
        let _lock = self.claim(run)?;
        self.abort_in_place(run, reason);
        self.persist(run)
    }

    fn abort_in_place(&self, run: &mut WorkflowRun, reason: &str) {
        for stage in self.pipeline.stages() {
            if run.status_of(&stage.id) == StageStatus::Passed {
                continue;
            }
            // Bumping the attempt makes any result still on its way stale.
            let attempt = run.next_attempt(&stage.id);
            run.record(
                Outcome::new(&stage.id, StageStatus::Blocked, attempt)
                    .with_reason(format!("run aborted: {reason}")),
            );
        }
        run.current_frontier.clear();
        run.set_state(RunState::Aborted);
        run.push_event(EventKind::Aborted, None, reason);
        warn!(run_id = %run.run_id, reason, "run aborted");
    }

    /// Approve the pending confirmation request of `stage_id`.
    pub fn confirm(&self, run: &mut WorkflowRun, stage_id: &str) -> Result<()> {
        ensure_open(run, RunState::Active)?;
        let _lock = self.claim(run)?;
        let from = run.state.to_string();
        match run.confirmations.get_mut(stage_id) {
            Some(c) if !c.approved => c.approved = true,
            _ => return Err(no_confirmation(from, stage_id)),
        }
        run.push_event(EventKind::Confirmed, Some(stage_id), "");
        run.set_state(RunState::Active);
        info!(run_id = %run.run_id, stage_id, "confirmation approved");
        self.persist(run)
    }

    /// Refuse the pending confirmation request of `stage_id`, blocking it.
    pub fn reject(&self, run: &mut WorkflowRun, stage_id: &str) -> Result<()> {
        ensure_open(run, RunState::Blocked)?;
        let _lock = self.claim(run)?;
        let from = run.state.to_string();
        let pending = run
            .confirmations
            .get(stage_id)
            .is_some_and(|c| !c.approved);
        let first = if pending {
            run.confirmations
                .remove(stage_id)
                .and_then(|c| c.requests.into_iter().next())
        } else {
            None
        };
        let Some(request) = first else {
            return Err(no_confirmation(from, stage_id));
        };

        let attempt = run.attempt(stage_id);
        self.block_stage(
            run,
            stage_id,
            attempt,
            request.action,
            request.rule,
            "rejected by operator".to_string(),
        );
        run.push_event(EventKind::Rejected, Some(stage_id), "");
        self.settle(run);
        self.persist(run)
    }

    /// Manual intervention after a halt or block: the stage goes back to
    /// pending with a fresh retry budget.
    pub fn retry(&self, run: &mut WorkflowRun, stage_id: &str) -> Result<()> {
        ensure_open(run, RunState::Active)?;
        self.pipeline.stage(stage_id)?;
        let _lock = self.claim(run)?;
        let status = run.status_of(stage_id);
        if !matches!(status, StageStatus::Failed | StageStatus::Blocked) {
            return Err(RelayError::InvalidTransition {
                from: status.to_string(),
                to: StageStatus::Pending.to_string(),
                reason: format!("stage '{stage_id}' is not halted or blocked"),
            });
        }
        run.retry_counts.remove(stage_id);
        run.reset([stage_id]);
        run.push_event(EventKind::Retried, Some(stage_id), "manual retry");
        run.set_state(RunState::Active);
        info!(run_id = %run.run_id, stage_id, "stage reset for manual retry");
        self.persist(run)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    fn dispatch_ready(
        &self,
        run: &mut WorkflowRun,
        tasks: &mut JoinSet<StageResult>,
        in_flight: &mut HashMap<String, InFlight>,
    ) -> Result<()> {
        let eligible = self.pipeline.next_eligible_stages(run);
        let awaiting = run.awaiting_confirmation();

        for stage_id in &eligible {
            if in_flight.contains_key(stage_id)
                || awaiting.contains(stage_id)
                || run.status_of(stage_id) != StageStatus::Pending
            {
                continue;
            }
            let stage = self.pipeline.stage(stage_id)?;
            let profile = Arc::clone(self.profiles.for_role(&stage.role)?);
            let actor = self.actors.for_role(&stage.role)?;
            let attempt = run.next_attempt(stage_id);
            let guard = ActionGuard::new(Arc::clone(&profile), run.approved_actions(stage_id));

            if !self.admit(run, stage_id, attempt, guard.review_all(&stage.actions)) {
                continue;
            }

            let request = StageRequest {
                run_id: run.run_id.clone(),
                stage_id: stage_id.clone(),
                required_role: stage.role.clone(),
                feature: run.feature.clone(),
                attempt,
                input_artifacts: input_artifacts(run, stage),
                actions: stage.actions.clone(),
                profile: Arc::clone(&profile),
            };
            let timeout = self.pipeline.timeout_for(stage);
            let handle = tasks.spawn(execute(actor, request, guard, timeout));
            in_flight.insert(stage_id.clone(), InFlight { attempt, handle });

            info!(
                run_id = %run.run_id,
                stage_id = %stage_id,
                attempt,
                actor = %profile.actor_id,
                "stage dispatched"
            );
            run.push_event(
                EventKind::Dispatched,
                Some(stage_id),
                format!("attempt {attempt} by {}", profile.actor_id),
            );
        }

        run.current_frontier = eligible
            .into_iter()
            .filter(|s| run.status_of(s) == StageStatus::Pending)
            .collect();
        Ok(())
    }

    /// Returns true when the stage may run. Denials block it; unapproved
    /// "ask" rules park it until someone confirms.
    fn admit(&self, run: &mut WorkflowRun, stage_id: &str, attempt: u32, review: Review) -> bool {
        match review {
            Review::Clear => true,
            Review::Denied {
                action,
                rule,
                reason,
            } => {
                self.block_stage(run, stage_id, attempt, action, rule, reason);
                false
            }
            Review::NeedsConfirmation(requests) => {
                info!(
                    run_id = %run.run_id,
                    stage_id,
                    actions = %describe(&requests),
                    "stage awaiting confirmation"
                );
                run.push_event(
                    EventKind::ConfirmationRequested,
                    Some(stage_id),
                    describe(&requests),
                );
                run.request_confirmation(stage_id, requests);
                false
            }
        }
    }

    fn block_stage(
        &self,
        run: &mut WorkflowRun,
        stage_id: &str,
        attempt: u32,
        action: Action,
        rule: String,
        reason: String,
    ) {
        let err = RelayError::PermissionDenied {
            action: action.to_string(),
            rule: rule.clone(),
            reason: reason.clone(),
        };
        warn!(run_id = %run.run_id, stage_id, "stage blocked: {err}");
        run.push_event(EventKind::Blocked, Some(stage_id), err.to_string());
        run.block(
            stage_id,
            attempt,
            Denial {
                action,
                rule,
                reason,
                at: Utc::now(),
            },
        );
    }

    // -----------------------------------------------------------------------
    // Results
    // -----------------------------------------------------------------------

    fn apply(
        &self,
        run: &mut WorkflowRun,
        result: StageResult,
        in_flight: &mut HashMap<String, InFlight>,
    ) -> Result<()> {
        let StageResult {
            stage_id,
            attempt,
            completion,
        } = result;

        match in_flight.get(&stage_id) {
            Some(flight) if flight.attempt == attempt => {
                in_flight.remove(&stage_id);
            }
            _ => {
                debug!(run_id = %run.run_id, stage_id = %stage_id, attempt, "discarding stale result");
                run.push_event(
                    EventKind::Discarded,
                    Some(&stage_id),
                    format!("stale attempt {attempt}"),
                );
                return Ok(());
            }
        }

        let stage = self.pipeline.stage(&stage_id)?;
        let outcome = match completion {
            Completion::Report(report) => {
                let profile = Arc::clone(self.profiles.for_role(&stage.role)?);
                let guard = ActionGuard::new(profile, run.approved_actions(&stage_id));
                let review = guard.review_all(&report.declared_actions);
                if !self.admit(run, &stage_id, attempt, review) {
                    warn!(
                        run_id = %run.run_id,
                        stage_id = %stage_id,
                        "result discarded: actor reported actions outside its profile"
                    );
                    return Ok(());
                }
                outcome_from_report(&stage_id, attempt, report)
            }
            Completion::Error(ActorError::PermissionDenied {
                action,
                rule,
                reason,
            }) => {
                self.block_stage(run, &stage_id, attempt, action, rule, reason);
                return Ok(());
            }
            Completion::Error(ActorError::ConfirmationRequired { requests }) => {
                self.admit(run, &stage_id, attempt, Review::NeedsConfirmation(requests));
                return Ok(());
            }
            Completion::Error(ActorError::Failed(message)) => {
                Outcome::new(&stage_id, StageStatus::Failed, attempt).with_reason(message)
            }
            Completion::TimedOut(seconds) => {
                let err = RelayError::Timeout {
                    stage: stage_id.clone(),
                    seconds,
                };
                warn!(run_id = %run.run_id, stage_id = %stage_id, "{err}");
                Outcome::new(&stage_id, StageStatus::Failed, attempt)
                    .with_reason(format!("timed out after {seconds}s"))
            }
            Completion::Panicked(message) => {
                Outcome::new(&stage_id, StageStatus::Failed, attempt)
                    .with_reason(format!("actor panicked: {message}"))
            }
        };

        self.judge(run, stage, outcome, in_flight);
        Ok(())
    }

    fn judge(
        &self,
        run: &mut WorkflowRun,
        stage: &StageDefinition,
        mut outcome: Outcome,
        in_flight: &mut HashMap<String, InFlight>,
    ) {
        let decision = gate::decide(
            stage.gate.as_ref(),
            &outcome,
            run.retries(&stage.id),
            self.pipeline.conventions().max_retries,
        );

        match decision {
            GateDecision::Advance => {
                outcome.status = StageStatus::Passed;
                info!(
                    run_id = %run.run_id,
                    stage_id = %stage.id,
                    score = ?outcome.score,
                    "stage passed"
                );
                let detail = outcome
                    .score
                    .map(|s| format!("score {s}"))
                    .unwrap_or_default();
                run.push_event(EventKind::Passed, Some(&stage.id), detail);
                run.record(outcome);
            }
            GateDecision::Retry { reason } => {
                let used = run.bump_retry(&stage.id);
                let budget = self.pipeline.max_retries_for(stage);
                let target = stage.rework_target();

                // Blocked stages keep their denial and wait for an operator.
                let mut reset = self.pipeline.descendants(target);
                reset.insert(target.to_string());
                reset.retain(|id| run.status_of(id) != StageStatus::Blocked);
                for id in &reset {
                    if let Some(flight) = in_flight.remove(id) {
                        flight.handle.abort();
                        run.push_event(
                            EventKind::Cancelled,
                            Some(id),
                            format!("attempt {} superseded by rework", flight.attempt),
                        );
                    }
                }
                run.reset(reset.iter().map(String::as_str));

                warn!(
                    run_id = %run.run_id,
                    stage_id = %stage.id,
                    retry = used,
                    budget,
                    rework_from = %target,
                    "gate failed: {reason}"
                );
                run.push_event(
                    EventKind::Retried,
                    Some(&stage.id),
                    format!("retry {used}/{budget} from '{target}': {reason}"),
                );
            }
            GateDecision::Halt { reason } => {
                let failure = RelayError::StageFailure {
                    stage: stage.id.clone(),
                    reason,
                };
                warn!(
                    run_id = %run.run_id,
                    stage_id = %stage.id,
                    retries = run.retries(&stage.id),
                    "{failure}"
                );
                run.push_event(EventKind::Halted, Some(&stage.id), failure.to_string());
                outcome.status = StageStatus::Failed;
                outcome.reason = Some(failure.to_string());
                run.record(outcome);
            }
        }
    }

    /// Derive the run state once nothing is in flight.
    fn settle(&self, run: &mut WorkflowRun) {
        let state = if self.pipeline.is_complete(run) {
            RunState::Completed
        } else if !run.awaiting_confirmation().is_empty() {
            RunState::AwaitingConfirmation
        } else if !run.stages_with(StageStatus::Failed).is_empty() {
            RunState::Halted
        } else if !run.stages_with(StageStatus::Blocked).is_empty() {
            RunState::Blocked
        } else {
            RunState::Active
        };
        if state == run.state {
            return;
        }
        run.set_state(state);
        if state == RunState::Completed {
            run.current_frontier.clear();
            run.push_event(EventKind::Completed, None, "");
            info!(run_id = %run.run_id, "run completed");
        } else {
            info!(run_id = %run.run_id, state = %state, "run paused");
        }
    }
}

fn input_artifacts(run: &WorkflowRun, stage: &StageDefinition) -> BTreeMap<String, String> {
    stage
        .predecessors
        .iter()
        .filter_map(|p| {
            run.outcome(p)
                .and_then(|o| o.artifact_ref.clone())
                .map(|a| (p.clone(), a))
        })
        .collect()
}

fn ensure_open(run: &WorkflowRun, to: RunState) -> Result<()> {
    if run.state.is_final() {
        return Err(RelayError::InvalidTransition {
            from: run.state.to_string(),
            to: to.to_string(),
            reason: format!("run '{}' is already {}", run.run_id, run.state),
        });
    }
    Ok(())
}

fn no_confirmation(from: String, stage_id: &str) -> RelayError {
    RelayError::InvalidTransition {
        from,
        to: RunState::Active.to_string(),
        reason: format!("stage '{stage_id}' has no pending confirmation"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
