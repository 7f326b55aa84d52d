//! The component registry.
//!
//! A [`Component`] is a named unit of configurable infrastructure: it declares
//! required packages, a manifest [`Recorder`], a [`Comparer`] selecting the
//! deploy actions pending for a detected change, lifecycle [`Action`]s, and
//! `deploy_before` precedence constraints over other components.
//!
//! The registry is an explicit value built once at startup via
//! [`Registry::builder`] and passed by reference into the manifest engine,
//! diff engine, and plan builder. There is no global component table.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::diff::ComponentChange;
use crate::plan::{Step, StepError};
use crate::settings::Settings;

/// A case-insensitive component name, normalized to uppercase.
///
/// The normalized form doubles as the component's manifest key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ComponentName(String);

impl ComponentName {
  pub fn new(name: impl AsRef<str>) -> Self {
    Self(name.as_ref().to_uppercase())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ComponentName {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ComponentName {
  fn from(name: &str) -> Self {
    Self::new(name)
  }
}

/// Lifecycle phase an action is registered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
  PreDeploy,
  Deploy,
  PostDeploy,
  Restart,
  Stop,
}

/// Context handed to manifest recorders.
#[derive(Debug, Clone, Copy)]
pub struct RecordContext<'a> {
  pub role: &'a str,
  pub settings: &'a Settings,
}

/// Context handed to actions when they emit steps.
///
/// `change` carries the before/after manifest values for the component the
/// action belongs to; it is `None` for pre/post-deploy framing actions and for
/// phases outside a diff-driven deployment.
#[derive(Debug, Clone, Copy)]
pub struct ActionContext<'a> {
  pub role: &'a str,
  pub host: &'a str,
  pub settings: &'a Settings,
  pub change: Option<&'a ComponentChange>,
}

/// A recorder failed to snapshot its component's state.
///
/// Recovered locally by the manifest engine: the component's manifest entry
/// becomes a structured error marker and aggregation continues.
#[derive(Debug, Error)]
pub enum RecordError {
  #[error("{0}")]
  Message(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// An action could not produce or execute its steps.
#[derive(Debug, Error)]
pub enum ActionError {
  #[error("action {action} failed: {message}")]
  Failed { action: String, message: String },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Step(#[from] StepError),
}

/// Snapshots a component's current state as a serializable value.
pub trait Recorder: Send + Sync {
  fn record(&self, ctx: &RecordContext<'_>) -> Result<Value, RecordError>;
}

/// An idempotent action invoked when a component changed.
///
/// Actions have a stable identifier (unique within their component) and emit
/// fully-resolved [`Step`]s for one host. The core never resolves actions by
/// dotted-path strings at runtime; dispatch is through this trait.
pub trait Action: Send + Sync {
  fn id(&self) -> &str;
  fn steps(&self, ctx: &ActionContext<'_>) -> Result<Vec<Step>, ActionError>;
}

/// Selects pending deploy actions without looking at manifest values.
pub trait StatelessCompare: Send + Sync {
  fn pending(&self) -> Vec<String>;
}

/// Selects pending deploy actions from the before/after manifest values.
pub trait DiffCompare: Send + Sync {
  fn pending(&self, last: Option<&Value>, current: &Value) -> Vec<String>;
}

/// How a component decides which deploy actions a change requires.
///
/// A sum type instead of the flag-plus-duck-typed callable this replaces:
/// whether a comparer wants the diff is encoded in the variant, not probed at
/// call time.
#[derive(Clone, Default)]
pub enum Comparer {
  /// Every registered deploy action is pending. The common case.
  #[default]
  AllDeployActions,
  Stateless(Arc<dyn StatelessCompare>),
  DiffAware(Arc<dyn DiffCompare>),
}

impl fmt::Debug for Comparer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Comparer::AllDeployActions => f.write_str("AllDeployActions"),
      Comparer::Stateless(_) => f.write_str("Stateless(..)"),
      Comparer::DiffAware(_) => f.write_str("DiffAware(..)"),
    }
  }
}

/// A recorder that snapshots a single settings key.
///
/// Small components are often "whatever the role settings say": this recorder
/// covers them without a bespoke impl. A missing key records as JSON null.
pub struct SettingsRecorder {
  key: String,
}

impl SettingsRecorder {
  pub fn key(key: impl Into<String>) -> Self {
    Self { key: key.into() }
  }
}

impl Recorder for SettingsRecorder {
  fn record(&self, ctx: &RecordContext<'_>) -> Result<Value, RecordError> {
    match ctx.settings.get(&self.key) {
      Some(value) => serde_json::to_value(value).map_err(|e| RecordError::Message(e.to_string())),
      None => Ok(Value::Null),
    }
  }
}

/// A named unit of configurable infrastructure.
///
/// Registered once at process start and immutable thereafter.
pub struct Component {
  name: ComponentName,
  packages: BTreeMap<String, Vec<String>>,
  recorder: Arc<dyn Recorder>,
  comparer: Comparer,
  deploy_before: Vec<ComponentName>,
  actions: BTreeMap<Phase, Vec<Arc<dyn Action>>>,
}

impl Component {
  /// Start building a component with the given name and recorder.
  pub fn named(name: impl AsRef<str>, recorder: Arc<dyn Recorder>) -> ComponentBuilder {
    ComponentBuilder {
      component: Component {
        name: ComponentName::new(name),
        packages: BTreeMap::new(),
        recorder,
        comparer: Comparer::AllDeployActions,
        deploy_before: Vec::new(),
        actions: BTreeMap::new(),
      },
    }
  }

  pub fn name(&self) -> &ComponentName {
    &self.name
  }

  pub fn recorder(&self) -> &dyn Recorder {
    self.recorder.as_ref()
  }

  pub fn comparer(&self) -> &Comparer {
    &self.comparer
  }

  /// Components that must deploy after this one.
  pub fn deploy_before(&self) -> &[ComponentName] {
    &self.deploy_before
  }

  /// Actions registered for a phase, in registration order.
  pub fn actions(&self, phase: Phase) -> &[Arc<dyn Action>] {
    self.actions.get(&phase).map(Vec::as_slice).unwrap_or_default()
  }

  /// Required packages for one OS distribution/version.
  pub fn packages_for(&self, distro: &str) -> &[String] {
    self.packages.get(distro).map(Vec::as_slice).unwrap_or_default()
  }

  /// The deploy actions this component's comparer considers pending for a
  /// change, in registration order.
  pub fn pending_deploy_actions(&self, change: &ComponentChange) -> Vec<Arc<dyn Action>> {
    let deploy = self.actions(Phase::Deploy);
    let selected: Vec<String> = match &self.comparer {
      Comparer::AllDeployActions => return deploy.to_vec(),
      Comparer::Stateless(comparer) => comparer.pending(),
      Comparer::DiffAware(comparer) => comparer.pending(change.last.as_ref(), &change.current),
    };
    deploy
      .iter()
      .filter(|action| selected.iter().any(|id| id == action.id()))
      .cloned()
      .collect()
  }
}

impl fmt::Debug for Component {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Component")
      .field("name", &self.name)
      .field("deploy_before", &self.deploy_before)
      .field("comparer", &self.comparer)
      .finish_non_exhaustive()
  }
}

/// Builder for [`Component`].
pub struct ComponentBuilder {
  component: Component,
}

impl ComponentBuilder {
  /// Declare required packages for an OS distribution/version.
  pub fn packages(mut self, distro: impl Into<String>, packages: impl IntoIterator<Item = impl Into<String>>) -> Self {
    self
      .component
      .packages
      .insert(distro.into(), packages.into_iter().map(Into::into).collect());
    self
  }

  pub fn comparer(mut self, comparer: Comparer) -> Self {
    self.component.comparer = comparer;
    self
  }

  /// Name components that must deploy after this one.
  pub fn deploy_before(mut self, names: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
    self
      .component
      .deploy_before
      .extend(names.into_iter().map(ComponentName::new));
    self
  }

  /// Register an action under a lifecycle phase.
  pub fn action(mut self, phase: Phase, action: Arc<dyn Action>) -> Self {
    self.component.actions.entry(phase).or_default().push(action);
    self
  }

  pub fn build(self) -> Component {
    self.component
  }
}

/// Errors from assembling a registry.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
  #[error("duplicate component: {0}")]
  DuplicateComponent(ComponentName),

  #[error("component {component} declares deploy_before on unknown component {depends}")]
  UnknownDependency {
    component: ComponentName,
    depends: ComponentName,
  },
}

/// The process-wide component table, constructed once and then immutable.
#[derive(Debug, Default)]
pub struct Registry {
  components: Vec<Component>,
}

impl Registry {
  pub fn builder() -> RegistryBuilder {
    RegistryBuilder { components: Vec::new() }
  }

  /// Components in registration order.
  pub fn iter(&self) -> impl Iterator<Item = &Component> {
    self.components.iter()
  }

  pub fn get(&self, name: &ComponentName) -> Option<&Component> {
    self.components.iter().find(|c| c.name() == name)
  }

  pub fn len(&self) -> usize {
    self.components.len()
  }

  pub fn is_empty(&self) -> bool {
    self.components.is_empty()
  }

  /// Aggregate required packages across all components for one distribution.
  pub fn required_packages(&self, distro: &str) -> Vec<String> {
    let mut packages: Vec<String> = self
      .components
      .iter()
      .flat_map(|c| c.packages_for(distro).iter().cloned())
      .collect();
    packages.sort();
    packages.dedup();
    packages
  }
}

/// Builder for [`Registry`].
pub struct RegistryBuilder {
  components: Vec<Component>,
}

impl RegistryBuilder {
  pub fn component(mut self, component: Component) -> Self {
    self.components.push(component);
    self
  }

  /// Validate and assemble the registry.
  ///
  /// Rejects duplicate names (case-insensitive) and `deploy_before`
  /// references to components that were never registered.
  pub fn build(self) -> Result<Registry, RegistryError> {
    for (i, component) in self.components.iter().enumerate() {
      if self.components[..i].iter().any(|c| c.name() == component.name()) {
        return Err(RegistryError::DuplicateComponent(component.name().clone()));
      }
    }
    for component in &self.components {
      for depends in component.deploy_before() {
        if !self.components.iter().any(|c| c.name() == depends) {
          return Err(RegistryError::UnknownDependency {
            component: component.name().clone(),
            depends: depends.clone(),
          });
        }
      }
    }
    Ok(Registry {
      components: self.components,
    })
  }
}

#[cfg(test)]
pub(crate) mod test_support {
  //! Shared fixtures for registry-driven tests in other modules.

  use super::*;
  use crate::plan::RunMethod;

  /// Recorder returning a fixed value.
  pub struct FixedRecorder(pub Value);

  impl Recorder for FixedRecorder {
    fn record(&self, _ctx: &RecordContext<'_>) -> Result<Value, RecordError> {
      Ok(self.0.clone())
    }
  }

  /// Recorder that always fails.
  pub struct FailingRecorder;

  impl Recorder for FailingRecorder {
    fn record(&self, _ctx: &RecordContext<'_>) -> Result<Value, RecordError> {
      Err(RecordError::Message("probe exploded".to_string()))
    }
  }

  /// Action emitting a single `local` step echoing its id.
  pub struct EchoAction(pub &'static str);

  impl Action for EchoAction {
    fn id(&self) -> &str {
      self.0
    }

    fn steps(&self, ctx: &ActionContext<'_>) -> Result<Vec<Step>, ActionError> {
      Ok(vec![Step::new(
        ctx.host,
        "deploy",
        RunMethod::Local,
        format!("echo {}", self.0),
      )])
    }
  }

  /// A minimal component with one deploy action and a fixed snapshot value.
  pub fn component(name: &str, value: Value) -> Component {
    Component::named(name, Arc::new(FixedRecorder(value)))
      .action(Phase::Deploy, Arc::new(EchoAction("deploy")))
      .build()
  }
}
