//! Command implementations and the shared invocation context.

mod preview;
mod resume;
mod run;
mod show_diff;
mod status;
mod truncate;

pub use preview::cmd_preview;
pub use resume::cmd_resume;
pub use run::cmd_run;
pub use show_diff::cmd_show_diff;
pub use status::cmd_status;
pub use truncate::cmd_truncate;

use std::fs;
use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

use convoy_lib::deploy::DeployContext;
use convoy_lib::manifest::ManifestStore;
use convoy_lib::plan::PlanStore;
use convoy_lib::registry::Registry;
use convoy_lib::settings;
use convoy_lib::statedir::StateDir;

use crate::components;

/// Shared handles for one CLI invocation.
pub struct App {
  state: StateDir,
  settings_dir: PathBuf,
}

impl App {
  pub fn new(state_dir: Option<PathBuf>, settings_dir: PathBuf) -> Self {
    let state = match state_dir {
      Some(dir) => StateDir::at(dir),
      None => StateDir::default_dir(),
    };
    Self { state, settings_dir }
  }

  pub fn state(&self) -> &StateDir {
    &self.state
  }

  pub fn manifests(&self) -> ManifestStore {
    ManifestStore::new(self.state.clone())
  }

  pub fn plans(&self) -> PlanStore {
    PlanStore::new(self.state.clone())
  }

  pub fn registry(&self) -> Result<Registry> {
    components::registry().context("Failed to assemble component registry")
  }

  /// Load a role's settings and build its deployment context.
  pub fn deploy_context(&self, role: &str) -> Result<DeployContext> {
    let settings = settings::load_role(&self.settings_dir, role)
      .with_context(|| format!("Failed to load settings for role {role}"))?;
    let hosts = components::hosts(&settings);
    if hosts.is_empty() {
      bail!("Role {role} has no hosts configured");
    }
    Ok(DeployContext::new(role, hosts, settings))
  }

  /// Roles with persisted state, sorted by name.
  pub fn roles(&self) -> Result<Vec<String>> {
    let entries = match fs::read_dir(self.state.base().join("roles")) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(e).context("Failed to list roles"),
    };

    let mut roles = Vec::new();
    for entry in entries {
      let entry = entry.context("Failed to list roles")?;
      if let Some(name) = entry.file_name().to_str() {
        roles.push(name.to_string());
      }
    }
    roles.sort();
    Ok(roles)
  }
}
