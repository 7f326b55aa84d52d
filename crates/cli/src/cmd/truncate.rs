//! Implementation of the `convoy truncate` command.
//!
//! Compacts a role's plan history into a single completed plan whose
//! thumbprints capture the current state.

use anyhow::Result;

use convoy_lib::manifest::record_current_manifest;
use convoy_lib::plan::truncate;
use convoy_lib::registry::RecordContext;

use crate::cmd::App;
use crate::output::{print_stat, print_success};

pub fn cmd_truncate(app: &App, role: &str) -> Result<()> {
  let registry = app.registry()?;
  let ctx = app.deploy_context(role)?;

  let current = record_current_manifest(
    &registry,
    &RecordContext {
      role: &ctx.role,
      settings: &ctx.settings,
    },
  );

  let plan = truncate(&app.plans(), role, &current)?;
  print_success(&format!("Truncated plan history for role {role}"));
  print_stat("Plan", &plan.name());
  print_stat("Hosts", &plan.hosts().len().to_string());
  Ok(())
}
