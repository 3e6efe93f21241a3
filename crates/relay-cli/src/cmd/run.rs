use crate::output::{print_json, print_table};
use anyhow::Context;
use clap::Subcommand;
use relay_actor::registry_from_config;
use relay_core::dispatcher::{abort_channel, Dispatcher};
use relay_core::run::{RunReport, RunState, WorkflowRun};
use relay_core::workspace::Workspace;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum RunSubcommand {
    /// Start a run for a feature and drive it until it stops
    Start {
        /// Feature name or description
        feature: String,
    },

    /// Continue a run; passed stages are not re-executed
    Resume { run_id: String },

    /// Show per-stage progress and whatever is holding the run up
    Status { run_id: String },

    /// List runs
    List {
        /// Include completed and aborted runs
        #[arg(long)]
        all: bool,
    },

    /// Abort a run, marking every unfinished stage blocked
    Abort {
        run_id: String,
        #[arg(long, default_value = "aborted by operator")]
        reason: String,
    },

    /// Approve the actions a stage is waiting on
    Confirm { run_id: String, stage: String },

    /// Refuse the actions a stage is waiting on, blocking it
    Reject { run_id: String, stage: String },

    /// Reset a halted or blocked stage with a fresh retry budget
    Retry { run_id: String, stage: String },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcmd: RunSubcommand, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::load(root).context("failed to load workspace")?;
    match subcmd {
        RunSubcommand::Start { feature } => start(&ws, &feature, json),
        RunSubcommand::Resume { run_id } => resume(&ws, &run_id, json),
        RunSubcommand::Status { run_id } => status(&ws, &run_id, json),
        RunSubcommand::List { all } => list(&ws, all, json),
        RunSubcommand::Abort { run_id, reason } => {
            steer(&ws, &run_id, json, |d, run| d.abort(run, &reason))
        }
        RunSubcommand::Confirm { run_id, stage } => {
            steer(&ws, &run_id, json, |d, run| d.confirm(run, &stage))
        }
        RunSubcommand::Reject { run_id, stage } => {
            steer(&ws, &run_id, json, |d, run| d.reject(run, &stage))
        }
        RunSubcommand::Retry { run_id, stage } => {
            steer(&ws, &run_id, json, |d, run| d.retry(run, &stage))
        }
    }
}

fn dispatcher(ws: &Workspace) -> anyhow::Result<Dispatcher> {
    let actors = registry_from_config(&ws.config.actors, &ws.root);
    ws.dispatcher(actors).context("failed to build dispatcher")
}

/// Drive `run` on a fresh runtime. Ctrl-C aborts the run instead of killing
/// the process mid-write.
fn drive(dispatcher: &Dispatcher, run: WorkflowRun) -> anyhow::Result<WorkflowRun> {
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let (signal, rx) = abort_channel();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal.abort();
            }
        });
        dispatcher
            .advance_until(run, rx)
            .await
            .map_err(anyhow::Error::from)
    })
}

// ---------------------------------------------------------------------------
// start / resume
// ---------------------------------------------------------------------------

fn start(ws: &Workspace, feature: &str, json: bool) -> anyhow::Result<()> {
    let d = dispatcher(ws)?;
    let run = d.open(feature).context("failed to start run")?;
    let run = drive(&d, run)?;
    show(ws, &run, json)
}

fn resume(ws: &Workspace, run_id: &str, json: bool) -> anyhow::Result<()> {
    let d = dispatcher(ws)?;
    let run = d
        .reopen(run_id)
        .with_context(|| format!("failed to resume run '{run_id}'"))?;
    let run = drive(&d, run)?;
    show(ws, &run, json)
}

// ---------------------------------------------------------------------------
// status / list
// ---------------------------------------------------------------------------

fn status(ws: &Workspace, run_id: &str, json: bool) -> anyhow::Result<()> {
    let run = ws
        .store()
        .load(run_id)
        .with_context(|| format!("failed to load run '{run_id}'"))?;
    show(ws, &run, json)
}

fn list(ws: &Workspace, all: bool, json: bool) -> anyhow::Result<()> {
    let store = ws.store();
    let mut runs = store.list().context("failed to list runs")?;
    if all {
        runs.extend(store.list_archived().context("failed to list archived runs")?);
    }
    runs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));

    if json {
        let rows: Vec<_> = runs
            .iter()
            .map(|r| {
                serde_json::json!({
                    "run_id": r.run_id,
                    "feature": r.feature,
                    "pipeline": r.pipeline_ref,
                    "state": r.state,
                    "updated_at": r.updated_at,
                })
            })
            .collect();
        return print_json(&rows);
    }

    if runs.is_empty() {
        println!("No runs. Start one with: relay run start <feature>");
        return Ok(());
    }
    let rows = runs
        .iter()
        .map(|r| {
            vec![
                r.run_id.clone(),
                r.feature.clone(),
                r.state.to_string(),
                r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
            ]
        })
        .collect();
    print_table(&["RUN", "FEATURE", "STATE", "UPDATED"], rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// abort / confirm / reject / retry
// ---------------------------------------------------------------------------

fn steer<F>(ws: &Workspace, run_id: &str, json: bool, op: F) -> anyhow::Result<()>
where
    F: FnOnce(&Dispatcher, &mut WorkflowRun) -> relay_core::Result<()>,
{
    let d = dispatcher(ws)?;
    let mut run = ws
        .store()
        .load(run_id)
        .with_context(|| format!("failed to load run '{run_id}'"))?;
    op(&d, &mut run)?;
    show(ws, &run, json)?;
    if !json && run.state == RunState::Active {
        println!("\nContinue with: relay run resume {}", run.run_id);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn show(ws: &Workspace, run: &WorkflowRun, json: bool) -> anyhow::Result<()> {
    let report = run.report(&ws.pipeline);
    if json {
        return print_json(&report);
    }
    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("Run:      {}", report.run_id);
    println!("Pipeline: {}", report.pipeline);
    println!("Feature:  {}", report.feature);
    println!("State:    {}", report.state);
    println!();

    let rows = report
        .stages
        .iter()
        .map(|s| {
            vec![
                s.stage.clone(),
                s.role.clone(),
                s.status.to_string(),
                s.attempt.to_string(),
                s.retries.to_string(),
                s.score.map(|v| format!("{v}")).unwrap_or_else(|| "-".into()),
            ]
        })
        .collect();
    print_table(&["STAGE", "ROLE", "STATUS", "ATTEMPT", "RETRIES", "SCORE"], rows);

    for h in &report.halted {
        println!(
            "\nHalted: {} after {} retr{}: {}",
            h.stage,
            h.retries,
            if h.retries == 1 { "y" } else { "ies" },
            h.reason
        );
        println!("  relay run retry {} {}", report.run_id, h.stage);
    }
    for b in &report.blocked {
        if b.action.is_empty() {
            println!("\nBlocked: {}: {}", b.stage, b.reason);
        } else {
            println!(
                "\nBlocked: {}: {} denied by rule '{}' ({})",
                b.stage, b.action, b.rule, b.reason
            );
        }
    }
    for (stage, requests) in &report.awaiting_confirmation {
        println!("\nAwaiting confirmation: {stage}");
        for r in requests {
            println!("  {} (rule '{}')", r.action, r.rule);
        }
        println!("  relay run confirm {} {stage}", report.run_id);
    }
}
