mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{check::CheckTarget, run::RunSubcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "relay",
    about = "Drive feature pipelines through capability-gated agent stages",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .relay/ or .git/)
    #[arg(long, global = true, env = "RELAY_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scaffold .relay/ with a sample pipeline, profiles and stub actors
    Init,

    /// Load the pipeline and every profile, reporting errors and warnings
    Validate,

    /// Evaluate one action against an actor's capability profile
    Check {
        /// Actor id or role whose profile to use
        #[arg(long)]
        actor: String,

        #[command(flatten)]
        target: CheckTarget,
    },

    /// Show the stages a run would dispatch next
    Next {
        /// Run id
        run_id: String,
    },

    /// Start, resume and steer pipeline runs
    Run {
        #[command(subcommand)]
        subcommand: RunSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run { .. } => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root),
        Commands::Validate => cmd::validate::run(&root, cli.json),
        Commands::Check { actor, target } => cmd::check::run(&root, &actor, target, cli.json),
        Commands::Next { run_id } => cmd::next::run(&root, &run_id, cli.json),
        Commands::Run { subcommand } => cmd::run::run(&root, subcommand, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
