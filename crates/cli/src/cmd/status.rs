//! Status command implementation.
//!
//! Without a role, summarizes every role with persisted state. With a role,
//! lists its plans, their progress, and the last manifest record.

use anyhow::Result;

use crate::cmd::App;
use crate::output::{format_age, print_info, print_stat, print_warning, symbols};

pub fn cmd_status(app: &App, role: Option<&str>) -> Result<()> {
  print_stat("State dir", &app.state().base().display().to_string());
  println!();

  match role {
    Some(role) => role_status(app, role),
    None => overview(app),
  }
}

fn overview(app: &App) -> Result<()> {
  let roles = app.roles()?;
  if roles.is_empty() {
    print_info("No roles have been deployed yet.");
    return Ok(());
  }

  let plans = app.plans();
  let manifests = app.manifests();
  for role in roles {
    let count = plans.numbers(&role)?.len();
    let outstanding = plans.outstanding(&role)?;
    let last = manifests.last_manifest(&role)?;

    let marker = if outstanding.is_some() {
      symbols::WARNING
    } else {
      symbols::SUCCESS
    };
    let deployed = if last.is_empty() {
      "never deployed".to_string()
    } else {
      format!("last deployed {}", format_age(last.created_at()))
    };
    println!("  {marker} {role}: {count} plan(s), {deployed}");
    if let Some(plan) = outstanding {
      print_warning(&format!(
        "  plan {} is outstanding ({:.0}% executed); resume or truncate it",
        plan.name(),
        plan.completion() * 100.0
      ));
    }
  }
  Ok(())
}

fn role_status(app: &App, role: &str) -> Result<()> {
  let plans = app.plans().list(role)?;
  if plans.is_empty() {
    print_info(&format!("No plans for role {role}."));
    return Ok(());
  }

  for plan in &plans {
    let state = if plan.is_complete() {
      symbols::SUCCESS
    } else {
      symbols::WARNING
    };
    println!(
      "  {state} plan {}: {}/{} steps, {} host(s)",
      plan.name(),
      plan.executed(),
      plan.steps().len(),
      plan.hosts().len()
    );
    if let Some(row) = plan.history()?.last() {
      print_stat("last step finished", &format_age(row.end));
    }
  }

  let last = app.manifests().last_manifest(role)?;
  if !last.is_empty() {
    println!();
    print_stat("Last manifest", &format_age(last.created_at()));
    print_stat("Components", &last.len().to_string());
  }
  Ok(())
}
