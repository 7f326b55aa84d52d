//! Implementation of the `convoy run` command.
//!
//! Detects changes for a role and drives a full deployment: plan creation,
//! step execution, thumbprints, and the new manifest record.

use std::path::PathBuf;

use anyhow::Result;

use convoy_lib::deploy::{DeployOptions, LogNotifier, Outcome, run_deployment};
use convoy_lib::plan::ShellRunner;

use crate::cmd::App;
use crate::output::{print_info, print_stat, print_success};

pub fn cmd_run(app: &App, role: &str, identity: Option<PathBuf>) -> Result<()> {
  let registry = app.registry()?;
  let ctx = app.deploy_context(role)?;
  let runner = ShellRunner { identity };

  let outcome = run_deployment(
    &registry,
    &ctx,
    &app.manifests(),
    &app.plans(),
    &runner,
    &LogNotifier,
    &DeployOptions::default(),
  )?;

  match outcome {
    Outcome::NoChanges => print_info("No changes to deploy."),
    Outcome::Deployed(report) => {
      print_success(&format!("Deployed role {role}"));
      print_stat("Plan", &report.plan);
      print_stat("Steps executed", &report.executed.to_string());
      let components: Vec<&str> = report.components.iter().map(|c| c.as_str()).collect();
      print_stat("Components", &components.join(", "));
    }
    // Preview mode is off.
    Outcome::Previewed(_) => {}
  }
  Ok(())
}
