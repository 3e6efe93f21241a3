use crate::output::print_json;
use anyhow::Context;
use relay_core::config::WarnLevel;
use relay_core::workspace::Workspace;
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    Workspace::require_initialized(root)?;
    let ws = Workspace::load(root).context("invalid project")?;
    let warnings = ws.warnings();
    let errors = warnings
        .iter()
        .filter(|w| w.level == WarnLevel::Error)
        .count();

    if json {
        let value = serde_json::json!({
            "pipeline": ws.pipeline.name(),
            "stages": ws.pipeline.stages().map(|s| &s.id).collect::<Vec<_>>(),
            "terminals": ws.pipeline.terminals(),
            "profiles": ws.profiles.iter().map(|p| &p.actor_id).collect::<Vec<_>>(),
            "warnings": warnings,
        });
        print_json(&value)?;
    } else {
        println!(
            "Pipeline '{}': {} stages, {} profiles",
            ws.pipeline.name(),
            ws.pipeline.len(),
            ws.profiles.len()
        );
        for w in &warnings {
            let tag = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("  {tag}: {}", w.message);
        }
        if warnings.is_empty() {
            println!("OK");
        }
    }

    if errors > 0 {
        anyhow::bail!("{errors} configuration error(s)");
    }
    Ok(())
}
