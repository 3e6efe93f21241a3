use crate::output::print_json;
use anyhow::Context;
use clap::Args;
use relay_core::policy::{self, Verdict};
use relay_core::types::Action;
use relay_core::workspace::Workspace;
use std::path::Path;

/// Exactly one action to evaluate.
#[derive(Args)]
#[group(required = true, multiple = false)]
pub struct CheckTarget {
    /// Read a path
    #[arg(long, value_name = "PATH")]
    read: Option<String>,
    /// Write a path
    #[arg(long, value_name = "PATH")]
    write: Option<String>,
    /// Run a shell command line
    #[arg(long, value_name = "LINE")]
    command: Option<String>,
    /// Use a named tool
    #[arg(long, value_name = "NAME")]
    tool: Option<String>,
}

impl CheckTarget {
    fn into_action(self) -> Option<Action> {
        self.read
            .map(Action::read)
            .or(self.write.map(Action::write))
            .or(self.command.map(Action::command))
            .or(self.tool.map(Action::tool))
    }
}

pub fn run(root: &Path, actor: &str, target: CheckTarget, json: bool) -> anyhow::Result<()> {
    let ws = Workspace::load(root).context("failed to load workspace")?;
    let profile = ws
        .profile(actor)
        .with_context(|| format!("no profile for actor '{actor}'"))?;
    let action = target
        .into_action()
        .context("one of --read, --write, --command or --tool is required")?;

    let verdict = policy::evaluate(profile, &action);

    if json {
        let value = serde_json::json!({
            "actor": profile.actor_id,
            "role": profile.role,
            "action": action,
            "verdict": verdict,
        });
        return print_json(&value);
    }

    let label = match &verdict {
        Verdict::Allow { .. } => "allow",
        Verdict::RequireConfirmation { .. } => "ask",
        Verdict::Deny { .. } => "deny",
    };
    println!("Actor:   {} ({})", profile.actor_id, profile.role);
    println!("Action:  {action}");
    println!("Verdict: {label}");
    println!("Rule:    {}", verdict.rule());
    if let Verdict::Deny { reason, .. } = &verdict {
        println!("Reason:  {reason}");
    }
    Ok(())
}
