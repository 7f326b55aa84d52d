//! Implementation of the `convoy preview` command.
//!
//! Computes the full deployment plan for a role and prints it without
//! executing anything or touching the ledger.

use anyhow::Result;

use convoy_lib::deploy::{DeployOptions, LogNotifier, Outcome, run_deployment};
use convoy_lib::plan::ShellRunner;

use crate::cmd::App;
use crate::output::{print_info, symbols};

pub fn cmd_preview(app: &App, role: &str) -> Result<()> {
  let registry = app.registry()?;
  let ctx = app.deploy_context(role)?;

  let outcome = run_deployment(
    &registry,
    &ctx,
    &app.manifests(),
    &app.plans(),
    &ShellRunner::new(),
    &LogNotifier,
    &DeployOptions { preview: true },
  )?;

  let Outcome::Previewed(preview) = outcome else {
    print_info("No changes would be made.");
    return Ok(());
  };

  println!("Changes:");
  for change in &preview.changes {
    let symbol = if change.is_new() { symbols::ADD } else { symbols::MODIFY };
    println!("  {symbol} {}", change.component);
  }
  for component in &preview.removed {
    println!("  {} {} (no longer recorded)", symbols::REMOVE, component);
  }

  println!();
  println!("Execution order:");
  for (i, component) in preview.order.iter().enumerate() {
    println!("  {}. {component}", i + 1);
  }

  println!();
  println!("Actions:");
  for action in &preview.actions {
    println!("  {} {action}", symbols::ARROW);
  }

  println!();
  println!("Steps ({}):", preview.steps.len());
  for step in &preview.steps {
    println!("  {step}");
  }

  Ok(())
}
