//! Implementation of the `convoy show-diff` command.
//!
//! Records the current manifest and prints the differences against the last
//! persisted one, component by component.

use anyhow::Result;
use serde_json::json;

use convoy_lib::diff::{diff, diff_removed};
use convoy_lib::manifest::record_current_manifest;
use convoy_lib::registry::{ComponentName, RecordContext};

use crate::cmd::App;
use crate::output::{print_info, print_json, symbols};

pub fn cmd_show_diff(app: &App, role: &str, component: Option<&str>, as_json: bool) -> Result<()> {
  let registry = app.registry()?;
  let ctx = app.deploy_context(role)?;

  let last = app.manifests().last_manifest(role)?;
  let current = record_current_manifest(
    &registry,
    &RecordContext {
      role: &ctx.role,
      settings: &ctx.settings,
    },
  );

  let mut changes = diff(&last, &current);
  let mut removed = diff_removed(&last, &current);
  if let Some(component) = component {
    let name = ComponentName::new(component);
    changes.retain(|c| c.component == name);
    removed.retain(|r| *r == name);
  }

  if as_json {
    let changes: Vec<_> = changes
      .iter()
      .map(|c| json!({ "component": c.component, "last": c.last, "current": c.current }))
      .collect();
    return print_json(&json!({ "role": role, "changes": changes, "removed": removed }));
  }

  if changes.is_empty() && removed.is_empty() {
    match component {
      Some(component) => print_info(&format!("No changes for component {component}.")),
      None => print_info(&format!("Role {role} matches its last manifest.")),
    }
    return Ok(());
  }

  for change in &changes {
    if change.is_new() {
      println!("{} {} (new)", symbols::ADD, change.component);
      println!("    {}", change.current);
    } else {
      println!("{} {}", symbols::MODIFY, change.component);
      if let Some(last) = &change.last {
        println!("  {} {last}", symbols::REMOVE);
      }
      println!("  {} {}", symbols::ADD, change.current);
    }
  }
  for component in &removed {
    println!("{} {component} (no longer recorded)", symbols::REMOVE);
  }

  Ok(())
}
