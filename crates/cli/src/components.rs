//! The built-in component set.
//!
//! Every Convoy registry ships three components: OS packages, pushed config
//! files, and the application release. Role settings drive what each one
//! records and the exact commands its actions emit; the precedence chain is
//! packages, then config files, then the release.
//!
//! Recognized settings keys:
//! - `hosts`: target hosts for the role
//! - `deploy_user`: acting user for remote steps (default `deploy`)
//! - `packages`: list of OS packages to install
//! - `config_files`: mapping of local source path to remote destination
//! - `release`: application release version
//! - `service`: service unit restarted after a release (default `app`)

use std::sync::Arc;

use serde_json::Value;

use convoy_lib::plan::{RunMethod, Step};
use convoy_lib::registry::{
  Action, ActionContext, ActionError, Comparer, Component, DiffCompare, Phase, Registry, RegistryError,
  SettingsRecorder,
};
use convoy_lib::settings::Settings;

const DEFAULT_USER: &str = "deploy";
const DEFAULT_SERVICE: &str = "app";

/// The acting user for remote steps.
pub fn acting_user(settings: &Settings) -> String {
  settings.get_str("deploy_user").unwrap_or(DEFAULT_USER).to_string()
}

/// Target hosts declared in the role settings.
pub fn hosts(settings: &Settings) -> Vec<String> {
  settings.get_str_list("hosts")
}

/// Assemble the registry of built-in components.
pub fn registry() -> Result<Registry, RegistryError> {
  Registry::builder()
    .component(packages())
    .component(config_files())
    .component(app_release())
    .build()
}

fn packages() -> Component {
  Component::named("packages", Arc::new(SettingsRecorder::key("packages")))
    .deploy_before(["config-files"])
    .action(Phase::Deploy, Arc::new(InstallPackages))
    .build()
}

fn config_files() -> Component {
  Component::named("config-files", Arc::new(SettingsRecorder::key("config_files")))
    .deploy_before(["app-release"])
    .action(Phase::Deploy, Arc::new(PushConfigs))
    .build()
}

fn app_release() -> Component {
  Component::named("app-release", Arc::new(SettingsRecorder::key("release")))
    .comparer(Comparer::DiffAware(Arc::new(ReleaseComparer)))
    .action(Phase::Deploy, Arc::new(BootstrapRelease))
    .action(Phase::Deploy, Arc::new(InstallRelease))
    .action(Phase::Restart, Arc::new(RestartService))
    .build()
}

/// Install the role's declared package list.
struct InstallPackages;

impl Action for InstallPackages {
  fn id(&self) -> &str {
    "install"
  }

  fn steps(&self, ctx: &ActionContext<'_>) -> Result<Vec<Step>, ActionError> {
    let packages = ctx.settings.get_str_list("packages");
    if packages.is_empty() {
      return Ok(Vec::new());
    }
    Ok(vec![Step::new(
      ctx.host,
      acting_user(ctx.settings),
      RunMethod::Sudo,
      format!(
        "env DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
        packages.join(" ")
      ),
    )])
  }
}

/// Transfer each declared config file to its destination.
struct PushConfigs;

impl Action for PushConfigs {
  fn id(&self) -> &str {
    "push"
  }

  fn steps(&self, ctx: &ActionContext<'_>) -> Result<Vec<Step>, ActionError> {
    let Some(value) = ctx.settings.get("config_files") else {
      return Ok(Vec::new());
    };
    let mapping = value.as_mapping().ok_or_else(|| ActionError::Failed {
      action: "config-files.push".to_string(),
      message: "config_files must map local sources to remote destinations".to_string(),
    })?;

    let user = acting_user(ctx.settings);
    let mut steps = Vec::new();
    for (src, dest) in mapping {
      let (Some(src), Some(dest)) = (src.as_str(), dest.as_str()) else {
        return Err(ActionError::Failed {
          action: "config-files.push".to_string(),
          message: "config_files entries must be strings".to_string(),
        });
      };
      steps.push(Step::new(ctx.host, &user, RunMethod::Put, format!("{src} {dest}")));
    }
    Ok(steps)
  }
}

/// First apply bootstraps the release layout before installing; later changes
/// only install.
struct ReleaseComparer;

impl DiffCompare for ReleaseComparer {
  fn pending(&self, last: Option<&Value>, _current: &Value) -> Vec<String> {
    if last.is_none() {
      vec!["bootstrap".to_string(), "install".to_string()]
    } else {
      vec!["install".to_string()]
    }
  }
}

/// Create the release directory layout on a fresh host.
struct BootstrapRelease;

impl Action for BootstrapRelease {
  fn id(&self) -> &str {
    "bootstrap"
  }

  fn steps(&self, ctx: &ActionContext<'_>) -> Result<Vec<Step>, ActionError> {
    let user = acting_user(ctx.settings);
    Ok(vec![Step::new(
      ctx.host,
      &user,
      RunMethod::Sudo,
      format!("install -d -o {user} /srv/app/releases"),
    )])
  }
}

/// Install the release version named in the role settings.
struct InstallRelease;

impl Action for InstallRelease {
  fn id(&self) -> &str {
    "install"
  }

  fn steps(&self, ctx: &ActionContext<'_>) -> Result<Vec<Step>, ActionError> {
    let release = ctx.settings.get_str("release").ok_or_else(|| ActionError::Failed {
      action: "app-release.install".to_string(),
      message: "missing setting: release".to_string(),
    })?;
    Ok(vec![Step::new(
      ctx.host,
      acting_user(ctx.settings),
      RunMethod::Run,
      format!("/srv/app/bin/install-release {release}"),
    )])
  }
}

/// Restart the application service unit.
struct RestartService;

impl Action for RestartService {
  fn id(&self) -> &str {
    "restart"
  }

  fn steps(&self, ctx: &ActionContext<'_>) -> Result<Vec<Step>, ActionError> {
    let service = ctx.settings.get_str("service").unwrap_or(DEFAULT_SERVICE);
    Ok(vec![Step::new(
      ctx.host,
      acting_user(ctx.settings),
      RunMethod::Sudo,
      format!("systemctl restart {service}"),
    )])
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use convoy_lib::diff::ComponentChange;
  use convoy_lib::registry::ComponentName;
  use serde_json::json;

  fn settings(yaml: &str) -> Settings {
    let mapping: serde_yaml::Mapping = serde_yaml::from_str(yaml).unwrap();
    let mut settings = Settings::new();
    for (key, value) in mapping {
      settings.set(key.as_str().unwrap().to_string(), value);
    }
    settings
  }

  fn ctx<'a>(settings: &'a Settings, change: Option<&'a ComponentChange>) -> ActionContext<'a> {
    ActionContext {
      role: "prod",
      host: "web1",
      settings,
      change,
    }
  }

  #[test]
  fn registry_assembles_with_precedence_chain() {
    let registry = registry().unwrap();
    assert_eq!(registry.len(), 3);

    let packages = registry.get(&"packages".into()).unwrap();
    assert_eq!(packages.deploy_before(), [ComponentName::new("config-files")]);
    let configs = registry.get(&"config-files".into()).unwrap();
    assert_eq!(configs.deploy_before(), [ComponentName::new("app-release")]);
  }

  #[test]
  fn install_packages_resolves_command_from_settings() {
    let settings = settings("packages: [nginx, curl]\ndeploy_user: ops\n");
    let steps = InstallPackages.steps(&ctx(&settings, None)).unwrap();

    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].user, "ops");
    assert_eq!(steps[0].method, RunMethod::Sudo);
    assert_eq!(
      steps[0].command,
      "env DEBIAN_FRONTEND=noninteractive apt-get install -y nginx curl"
    );
  }

  #[test]
  fn install_packages_with_no_packages_emits_nothing() {
    let settings = Settings::new();
    assert!(InstallPackages.steps(&ctx(&settings, None)).unwrap().is_empty());
  }

  #[test]
  fn push_configs_emits_one_put_per_entry() {
    let settings = settings("config_files:\n  conf/app.toml: /etc/app/app.toml\n  conf/env: /etc/app/env\n");
    let steps = PushConfigs.steps(&ctx(&settings, None)).unwrap();

    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s.method == RunMethod::Put));
    assert!(steps.iter().any(|s| s.command == "conf/app.toml /etc/app/app.toml"));
  }

  #[test]
  fn push_configs_rejects_non_mapping() {
    let settings = settings("config_files: [not, a, mapping]\n");
    assert!(matches!(
      PushConfigs.steps(&ctx(&settings, None)),
      Err(ActionError::Failed { .. })
    ));
  }

  #[test]
  fn release_comparer_bootstraps_only_on_first_apply() {
    assert_eq!(ReleaseComparer.pending(None, &json!("1.0.0")), vec!["bootstrap", "install"]);
    assert_eq!(
      ReleaseComparer.pending(Some(&json!("1.0.0")), &json!("1.1.0")),
      vec!["install"]
    );
  }

  #[test]
  fn install_release_requires_release_setting() {
    let settings = Settings::new();
    assert!(matches!(
      InstallRelease.steps(&ctx(&settings, None)),
      Err(ActionError::Failed { .. })
    ));

    let settings = self::settings("release: 2.4.1\n");
    let steps = InstallRelease.steps(&ctx(&settings, None)).unwrap();
    assert_eq!(steps[0].command, "/srv/app/bin/install-release 2.4.1");
    assert_eq!(steps[0].user, DEFAULT_USER);
  }

  #[test]
  fn restart_uses_service_setting() {
    let settings = settings("service: frontend\n");
    let steps = RestartService.steps(&ctx(&settings, None)).unwrap();
    assert_eq!(steps[0].command, "systemctl restart frontend");
  }

  #[test]
  fn hosts_and_user_come_from_settings() {
    let settings = settings("hosts: [web1, web2]\ndeploy_user: ops\n");
    assert_eq!(hosts(&settings), vec!["web1", "web2"]);
    assert_eq!(acting_user(&settings), "ops");
    assert_eq!(acting_user(&Settings::new()), "deploy");
  }
}
