use crate::output::print_json;
use anyhow::Context;
use relay_core::types::StageStatus;
use relay_core::workspace::Workspace;
use std::path::Path;

pub fn run(root: &Path, run_id: &str, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::load(root).context("failed to load workspace")?;
    let run = ws
        .store()
        .load(run_id)
        .with_context(|| format!("failed to load run '{run_id}'"))?;
    let eligible = ws.pipeline.next_eligible_stages(&run);
    let awaiting = run.awaiting_confirmation();

    if json {
        let value = serde_json::json!({
            "run_id": run.run_id,
            "state": run.state,
            "eligible": eligible,
            "awaiting_confirmation": awaiting,
        });
        return print_json(&value);
    }

    if run.state.is_final() {
        println!("Run {} is {}; nothing to dispatch.", run.run_id, run.state);
        return Ok(());
    }
    if eligible.is_empty() {
        println!("No eligible stages (run is {}).", run.state);
        return Ok(());
    }
    for stage_id in &eligible {
        let stage = ws.pipeline.stage(stage_id)?;
        let status = if awaiting.contains(stage_id) {
            "awaiting confirmation".to_string()
        } else {
            match run.status_of(stage_id) {
                StageStatus::Pending => "ready".to_string(),
                StageStatus::Failed => "halted (relay run retry)".to_string(),
                other => other.to_string(),
            }
        };
        println!("{:<20} {:<14} {status}", stage.id, stage.role);
    }
    Ok(())
}
