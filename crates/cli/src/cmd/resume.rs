//! Implementation of the `convoy resume` command.
//!
//! Picks up the role's outstanding plan at its persisted index and drives it
//! to completion, including thumbprints and the manifest record.

use std::path::PathBuf;

use anyhow::Result;

use convoy_lib::deploy::{LogNotifier, Outcome, resume_deployment};
use convoy_lib::plan::ShellRunner;

use crate::cmd::App;
use crate::output::{print_stat, print_success};

pub fn cmd_resume(app: &App, role: &str, identity: Option<PathBuf>) -> Result<()> {
  let registry = app.registry()?;
  let ctx = app.deploy_context(role)?;
  let runner = ShellRunner { identity };

  let outcome = resume_deployment(&registry, &ctx, &app.manifests(), &app.plans(), &runner, &LogNotifier)?;

  if let Outcome::Deployed(report) = outcome {
    print_success(&format!("Resumed and completed plan {} for role {role}", report.plan));
    print_stat("Steps executed", &report.executed.to_string());
  }
  Ok(())
}
