use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use relay_core::actor::{ActionGuard, Actor, ActorError, ActorReport, StageRequest};
use tokio::process::Command;

use crate::process::ScriptProcess;
use crate::types::{ActorMessage, EngineMessage, LogLevel, RequestPayload};
use crate::{ActorProcessError, Result};

// ─── ScriptActor ──────────────────────────────────────────────────────────

/// Runs one subprocess per stage attempt.
///
/// With no `args`, `command` is a shell line run through `sh -c`. Otherwise
/// `command` is resolved on `PATH` and executed directly with `args`.
#[derive(Debug, Clone)]
pub struct ScriptActor {
    name: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: PathBuf,
}

impl ScriptActor {
    pub fn new(name: impl Into<String>, command: impl Into<String>, cwd: &Path) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: cwd.to_path_buf(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    fn build_command(&self, request: &StageRequest) -> Result<Command> {
        let mut cmd = if self.args.is_empty() {
            let mut c = Command::new("sh");
            c.arg("-c").arg(&self.command);
            c
        } else {
            let exe = which::which(&self.command).map_err(|source| {
                ActorProcessError::CommandNotFound {
                    command: self.command.clone(),
                    source,
                }
            })?;
            let mut c = Command::new(exe);
            c.args(&self.args);
            c
        };
        cmd.current_dir(&self.cwd)
            .env("RELAY_RUN_ID", &request.run_id)
            .env("RELAY_STAGE_ID", &request.stage_id)
            .env("RELAY_ROLE", &request.required_role)
            .env("RELAY_ATTEMPT", request.attempt.to_string());
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        Ok(cmd)
    }

    async fn drive(
        &self,
        request: StageRequest,
        guard: ActionGuard,
    ) -> std::result::Result<ActorReport, ActorError> {
        let cmd = self.build_command(&request).map_err(failed)?;
        let mut process = ScriptProcess::spawn(cmd).map_err(failed)?;
        let stage_id = request.stage_id.clone();

        process
            .send(&EngineMessage::Request(RequestPayload::from(&request)))
            .await
            .map_err(failed)?;

        let mut declared = Vec::new();
        loop {
            let msg = match process.next_message().await {
                Ok(Some(msg)) => msg,
                Ok(None) => return Err(failed(process.exit_error().await)),
                Err(e) => {
                    process.kill().await;
                    return Err(failed(e));
                }
            };

            match msg {
                ActorMessage::Log { level, message } => {
                    log_line(&self.name, &stage_id, level, &message)
                }
                ActorMessage::Declare { actions } => match guard.review(&actions) {
                    Ok(()) => {
                        tracing::debug!(actor = %self.name, stage_id = %stage_id, count = actions.len(), "actions approved");
                        declared.extend(actions);
                        process
                            .send(&EngineMessage::allowed())
                            .await
                            .map_err(failed)?;
                    }
                    Err(refusal) => {
                        let rule = match &refusal {
                            ActorError::PermissionDenied { rule, .. } => Some(rule.clone()),
                            _ => None,
                        };
                        // Best effort: the actor may already be gone.
                        let _ = process
                            .send(&EngineMessage::refused(refusal.to_string(), rule))
                            .await;
                        process.kill().await;
                        return Err(refusal);
                    }
                },
                ActorMessage::Outcome(mut report) => {
                    process.close_stdin();
                    process.kill().await;
                    for action in declared {
                        if !report.declared_actions.contains(&action) {
                            report.declared_actions.push(action);
                        }
                    }
                    return Ok(report);
                }
            }
        }
    }
}

fn failed(e: ActorProcessError) -> ActorError {
    ActorError::Failed(e.to_string())
}

fn log_line(actor: &str, stage_id: &str, level: LogLevel, message: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(actor, stage_id, "{message}"),
        LogLevel::Info => tracing::info!(actor, stage_id, "{message}"),
        LogLevel::Warn => tracing::warn!(actor, stage_id, "{message}"),
        LogLevel::Error => tracing::error!(actor, stage_id, "{message}"),
    }
}

#[async_trait]
impl Actor for ScriptActor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn invoke(
        &self,
        request: StageRequest,
        guard: ActionGuard,
    ) -> std::result::Result<ActorReport, ActorError> {
        self.drive(request, guard).await
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
