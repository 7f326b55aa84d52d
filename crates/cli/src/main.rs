//! convoy - change-driven deployment automation.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cmd;
mod components;
mod output;

/// convoy - change-driven deployment automation
#[derive(Parser)]
#[command(name = "convoy")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// State directory (defaults to the platform data dir or $CONVOY_STATE_DIR)
  #[arg(long, global = true)]
  state_dir: Option<PathBuf>,

  /// Directory holding per-role settings files
  #[arg(long, global = true, default_value = "settings")]
  settings_dir: PathBuf,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Show deployment state, for one role or all of them
  Status {
    role: Option<String>,
  },

  /// Show the plan a deployment would execute, without side effects
  Preview {
    role: String,
  },

  /// Detect changes and run a deployment for a role
  Run {
    role: String,

    /// Identity file for ssh/scp steps
    #[arg(short, long)]
    identity: Option<PathBuf>,
  },

  /// Resume the outstanding plan for a role
  Resume {
    role: String,

    /// Identity file for ssh/scp steps
    #[arg(short, long)]
    identity: Option<PathBuf>,
  },

  /// Show the diff between the last manifest and current state
  ShowDiff {
    role: String,

    /// Limit output to one component
    component: Option<String>,

    /// Emit the diff as JSON
    #[arg(long)]
    json: bool,
  },

  /// Compact a role's plan history into a single completed plan
  Truncate {
    role: String,
  },
}

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::from_default_env())
    .without_time()
    .init();

  let cli = Cli::parse();
  if let Err(e) = run(cli) {
    output::print_error(&format!("{e:#}"));
    std::process::exit(1);
  }
}

fn run(cli: Cli) -> Result<()> {
  let app = cmd::App::new(cli.state_dir, cli.settings_dir);

  match cli.command {
    Commands::Status { role } => cmd::cmd_status(&app, role.as_deref()),
    Commands::Preview { role } => cmd::cmd_preview(&app, &role),
    Commands::Run { role, identity } => cmd::cmd_run(&app, &role, identity),
    Commands::Resume { role, identity } => cmd::cmd_resume(&app, &role, identity),
    Commands::ShowDiff { role, component, json } => cmd::cmd_show_diff(&app, &role, component.as_deref(), json),
    Commands::Truncate { role } => cmd::cmd_truncate(&app, &role),
  }
}
