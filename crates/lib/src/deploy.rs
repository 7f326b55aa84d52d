//! The orchestration driver.
//!
//! Top-level control loop for one role: guard against outstanding plans,
//! diff the last manifest against current state, resolve the deployment
//! order, turn pending actions into steps, drive the plan ledger, and record
//! the new manifest and per-host thumbprints on success.
//!
//! All state is explicit: the registry, context, and stores are passed by
//! reference into every entry point.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::{info, warn};

use crate::diff::{ComponentChange, diff, diff_removed};
use crate::manifest::{Manifest, ManifestError, ManifestStore, record_current_manifest};
use crate::order::{OrderError, deploy_order};
use crate::plan::{Plan, PlanError, PlanStore, Step, StepRunner};
use crate::registry::{ActionContext, ActionError, ComponentName, Phase, RecordContext, Registry};
use crate::settings::Settings;

/// Everything a deployment run needs to know about its target.
///
/// Constructed once per invocation and passed by reference; core functions
/// never read ambient role/site state.
#[derive(Debug, Clone)]
pub struct DeployContext {
  pub role: String,
  /// Host set for the role; frozen into the plan at creation time.
  pub hosts: Vec<String>,
  pub settings: Settings,
}

impl DeployContext {
  pub fn new(role: impl Into<String>, hosts: Vec<String>, settings: Settings) -> Self {
    Self {
      role: role.into(),
      hosts,
      settings,
    }
  }

  fn record_ctx(&self) -> RecordContext<'_> {
    RecordContext {
      role: &self.role,
      settings: &self.settings,
    }
  }
}

/// Options for a deployment run.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeployOptions {
  /// Compute and return the plan without executing anything or touching the
  /// ledger.
  pub preview: bool,
}

/// Errors from the orchestration driver.
#[derive(Debug, Error)]
pub enum DeployError {
  /// A previous plan for the role is incomplete. Deployments are serialized
  /// per role; resolve the outstanding plan first (resume or truncate).
  #[error("plan {plan} for role {role} is incomplete; resume or truncate it before deploying")]
  OutstandingPlan { role: String, plan: String },

  /// Resume was requested but every plan for the role is complete.
  #[error("no outstanding plan for role {0}")]
  NoOutstandingPlan(String),

  /// Cyclic or unresolvable component dependency graph. Raised before any
  /// action runs.
  #[error(transparent)]
  Configuration(#[from] OrderError),

  /// An action failed to produce its steps.
  #[error(transparent)]
  Action(#[from] ActionError),

  #[error(transparent)]
  Manifest(#[from] ManifestError),

  /// Ledger failures, including a step failing mid-plan
  /// ([`PlanError::Step`]): the plan stays resumable at the last good index.
  #[error(transparent)]
  Plan(#[from] PlanError),
}

/// The computed plan for a preview run. No side effects have occurred.
#[derive(Debug)]
pub struct PlanPreview {
  /// Changed components in execution order.
  pub order: Vec<ComponentName>,
  /// Fully-qualified action names (`component.action`) in invocation order.
  pub actions: Vec<String>,
  /// Every step the plan would contain.
  pub steps: Vec<Step>,
  /// The per-component before/after values driving the plan.
  pub changes: Vec<ComponentChange>,
  /// Components present in the last manifest but no longer recorded.
  pub removed: Vec<ComponentName>,
}

/// Summary of a completed deployment.
#[derive(Debug, Clone)]
pub struct DeployReport {
  pub role: String,
  pub plan: String,
  /// Steps executed by this invocation.
  pub executed: usize,
  /// Changed components, in execution order. Empty for a resumed plan.
  pub components: Vec<ComponentName>,
}

/// What a driver invocation did.
#[derive(Debug)]
pub enum Outcome {
  /// The current state already matches the last manifest.
  NoChanges,
  Previewed(PlanPreview),
  Deployed(DeployReport),
}

/// Invoked once per completed deployment. Delivery (email, chat) is the
/// collaborator's concern.
pub trait Notifier {
  fn notify(&self, role: &str, report: &DeployReport);
}

/// Default notifier: logs the completion.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn notify(&self, role: &str, report: &DeployReport) {
    info!(role, plan = %report.plan, steps = report.executed, "deployment complete");
  }
}

/// Run a full deployment for a role.
///
/// 1. Abort if an outstanding plan exists (per-role serialization guard).
/// 2. Diff the last persisted manifest against freshly recorded state; no
///    differences means no work.
/// 3. Resolve the changed components' execution order.
/// 4. Collect steps: every component's pre-deploy actions, the pending deploy
///    actions of each changed component in order, then every component's
///    post-deploy actions.
/// 5. In preview mode, return the computed plan without side effects.
/// 6. Otherwise create the next plan, execute it, thumbprint every host,
///    persist the new manifest, and notify.
///
/// A failing step leaves the plan in progress at its last good index; the
/// error propagates and the plan can be finished later with
/// [`resume_deployment`].
pub fn run_deployment(
  registry: &Registry,
  ctx: &DeployContext,
  manifests: &ManifestStore,
  plans: &PlanStore,
  runner: &dyn StepRunner,
  notifier: &dyn Notifier,
  options: &DeployOptions,
) -> Result<Outcome, DeployError> {
  if let Some(outstanding) = plans.outstanding(&ctx.role)? {
    return Err(DeployError::OutstandingPlan {
      role: ctx.role.clone(),
      plan: outstanding.name(),
    });
  }

  let last = manifests.last_manifest(&ctx.role)?;
  let current = record_current_manifest(registry, &ctx.record_ctx());

  let changes = diff(&last, &current);
  let removed = diff_removed(&last, &current);
  for name in &removed {
    warn!(role = %ctx.role, component = %name, "component no longer recorded; no cleanup actions will run");
  }
  if changes.is_empty() {
    info!(role = %ctx.role, "no changes");
    return Ok(Outcome::NoChanges);
  }

  let changed: BTreeSet<ComponentName> = changes.iter().map(|c| c.component.clone()).collect();
  let order = deploy_order(registry, &changed)?;
  let (steps, actions) = collect_steps(registry, ctx, &order, &changes)?;

  if options.preview {
    return Ok(Outcome::Previewed(PlanPreview {
      order,
      actions,
      steps,
      changes,
      removed,
    }));
  }

  let mut plan = Plan::get_or_create_next(plans, &ctx.role, ctx.hosts.iter().cloned())?;
  plan.append_steps(steps)?;
  let executed = plan.execute(runner, None, None)?;

  finish_plan(&plan, ctx, manifests, &current)?;
  let report = DeployReport {
    role: ctx.role.clone(),
    plan: plan.name(),
    executed,
    components: order,
  };
  notifier.notify(&ctx.role, &report);
  Ok(Outcome::Deployed(report))
}

/// Resume the role's outstanding plan from its persisted index.
///
/// Executes the remaining steps, then records the missing thumbprints and
/// manifests and notifies, exactly as a fresh run would on success.
pub fn resume_deployment(
  registry: &Registry,
  ctx: &DeployContext,
  manifests: &ManifestStore,
  plans: &PlanStore,
  runner: &dyn StepRunner,
  notifier: &dyn Notifier,
) -> Result<Outcome, DeployError> {
  let Some(mut plan) = plans.outstanding(&ctx.role)? else {
    return Err(DeployError::NoOutstandingPlan(ctx.role.clone()));
  };
  info!(role = %ctx.role, plan = %plan.name(), index = plan.executed(), "resuming plan");

  let executed = plan.execute(runner, None, None)?;

  // Thumbprints capture the state as of completion, so record fresh.
  let current = record_current_manifest(registry, &ctx.record_ctx());
  finish_plan(&plan, ctx, manifests, &current)?;

  let report = DeployReport {
    role: ctx.role.clone(),
    plan: plan.name(),
    executed,
    components: Vec::new(),
  };
  notifier.notify(&ctx.role, &report);
  Ok(Outcome::Deployed(report))
}

/// Record thumbprints and manifest records for every host that does not have
/// one yet. Idempotent across resumed completions.
fn finish_plan(
  plan: &Plan,
  ctx: &DeployContext,
  manifests: &ManifestStore,
  current: &Manifest,
) -> Result<(), DeployError> {
  for host in plan.hosts() {
    if plan.has_thumbprint(host) {
      continue;
    }
    plan.record_thumbprint(host, current)?;
    manifests.persist(current, &ctx.role, host)?;
  }
  Ok(())
}

/// Collect the plan's steps and the fully-qualified action names behind them.
///
/// Pre-deploy and post-deploy actions of every registered component always
/// run, framing the deploy actions of the changed components. Steps are
/// emitted per host in the context's host order.
fn collect_steps(
  registry: &Registry,
  ctx: &DeployContext,
  order: &[ComponentName],
  changes: &[ComponentChange],
) -> Result<(Vec<Step>, Vec<String>), DeployError> {
  let mut steps = Vec::new();
  let mut actions = Vec::new();

  let emit = |component: &ComponentName,
                  action: &dyn crate::registry::Action,
                  change: Option<&ComponentChange>,
                  steps: &mut Vec<Step>,
                  actions: &mut Vec<String>|
   -> Result<(), DeployError> {
    actions.push(format!("{}.{}", component.as_str().to_lowercase(), action.id()));
    for host in &ctx.hosts {
      let action_ctx = ActionContext {
        role: &ctx.role,
        host,
        settings: &ctx.settings,
        change,
      };
      steps.extend(action.steps(&action_ctx)?);
    }
    Ok(())
  };

  for component in registry.iter() {
    for action in component.actions(Phase::PreDeploy) {
      emit(component.name(), action.as_ref(), None, &mut steps, &mut actions)?;
    }
  }

  for name in order {
    let component = registry.get(name).ok_or_else(|| OrderError::UnknownComponent(name.clone()))?;
    let change = changes
      .iter()
      .find(|c| &c.component == name)
      .ok_or_else(|| OrderError::UnknownComponent(name.clone()))?;
    for action in component.pending_deploy_actions(change) {
      emit(name, action.as_ref(), Some(change), &mut steps, &mut actions)?;
    }
  }

  for component in registry.iter() {
    for action in component.actions(Phase::PostDeploy) {
      emit(component.name(), action.as_ref(), None, &mut steps, &mut actions)?;
    }
  }

  Ok((steps, actions))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::plan::{RunMethod, StepError};
  use crate::registry::test_support::{EchoAction, FixedRecorder};
  use crate::registry::Component;
  use crate::statedir::StateDir;
  use serde_json::json;
  use std::cell::RefCell;
  use std::sync::Arc;
  use tempfile::TempDir;

  #[derive(Default)]
  struct FakeRunner {
    ran: RefCell<Vec<String>>,
    fail_on: Option<String>,
  }

  impl StepRunner for FakeRunner {
    fn run_step(&self, step: &Step) -> Result<(), StepError> {
      if self.fail_on.as_deref() == Some(step.command.as_str()) {
        return Err(StepError::Failed {
          step: step.render(),
          code: Some(1),
        });
      }
      self.ran.borrow_mut().push(step.command.clone());
      Ok(())
    }
  }

  #[derive(Default)]
  struct RecordingNotifier {
    calls: RefCell<Vec<String>>,
  }

  impl Notifier for RecordingNotifier {
    fn notify(&self, role: &str, report: &DeployReport) {
      self.calls.borrow_mut().push(format!("{role}:{}", report.plan));
    }
  }

  struct Env {
    _temp: TempDir,
    manifests: ManifestStore,
    plans: PlanStore,
    ctx: DeployContext,
  }

  fn env(hosts: &[&str]) -> Env {
    let temp = TempDir::new().unwrap();
    let state = StateDir::at(temp.path());
    Env {
      manifests: ManifestStore::new(state.clone()),
      plans: PlanStore::new(state),
      ctx: DeployContext::new("prod", hosts.iter().map(|h| h.to_string()).collect(), Settings::new()),
      _temp: temp,
    }
  }

  fn component(name: &str, value: serde_json::Value, deploy_before: &[&str]) -> Component {
    Component::named(name, Arc::new(FixedRecorder(value)))
      .deploy_before(deploy_before.iter().copied())
      .action(Phase::Deploy, Arc::new(EchoAction("deploy")))
      .build()
  }

  #[test]
  fn fresh_role_deploys_everything_in_order() {
    let env = env(&["web1"]);
    // A must deploy before B.
    let registry = Registry::builder()
      .component(component("b", json!(1), &[]))
      .component(component("a", json!(2), &["b"]))
      .build()
      .unwrap();
    let runner = FakeRunner::default();
    let notifier = RecordingNotifier::default();

    let outcome = run_deployment(
      &registry,
      &env.ctx,
      &env.manifests,
      &env.plans,
      &runner,
      &notifier,
      &DeployOptions::default(),
    )
    .unwrap();

    let Outcome::Deployed(report) = outcome else {
      panic!("expected deployment");
    };
    assert_eq!(report.plan, "0001");
    assert_eq!(report.executed, 2);
    assert_eq!(report.components, vec![ComponentName::new("a"), ComponentName::new("b")]);
    assert_eq!(*notifier.calls.borrow(), vec!["prod:0001"]);

    // Plan is complete and the manifest was persisted.
    assert!(env.plans.outstanding("prod").unwrap().is_none());
    let last = env.manifests.last_manifest("prod").unwrap();
    assert_eq!(last.get(&"a".into()), Some(&json!(2)));
  }

  #[test]
  fn second_run_with_no_drift_reports_no_changes() {
    let env = env(&["web1"]);
    let registry = Registry::builder().component(component("a", json!(1), &[])).build().unwrap();
    let runner = FakeRunner::default();
    let notifier = RecordingNotifier::default();
    let options = DeployOptions::default();

    run_deployment(&registry, &env.ctx, &env.manifests, &env.plans, &runner, &notifier, &options).unwrap();
    let outcome =
      run_deployment(&registry, &env.ctx, &env.manifests, &env.plans, &runner, &notifier, &options).unwrap();

    assert!(matches!(outcome, Outcome::NoChanges));
    assert_eq!(notifier.calls.borrow().len(), 1);
  }

  #[test]
  fn preview_has_no_side_effects() {
    let env = env(&["web1", "web2"]);
    let registry = Registry::builder().component(component("a", json!(1), &[])).build().unwrap();
    let runner = FakeRunner::default();
    let notifier = RecordingNotifier::default();

    let outcome = run_deployment(
      &registry,
      &env.ctx,
      &env.manifests,
      &env.plans,
      &runner,
      &notifier,
      &DeployOptions { preview: true },
    )
    .unwrap();

    let Outcome::Previewed(preview) = outcome else {
      panic!("expected preview");
    };
    assert_eq!(preview.order, vec![ComponentName::new("a")]);
    assert_eq!(preview.actions, vec!["a.deploy"]);
    assert_eq!(preview.steps.len(), 2); // one per host

    // Nothing ran, nothing persisted.
    assert!(runner.ran.borrow().is_empty());
    assert!(notifier.calls.borrow().is_empty());
    assert!(env.plans.numbers("prod").unwrap().is_empty());
    assert!(env.manifests.last_manifest("prod").unwrap().is_empty());
  }

  #[test]
  fn outstanding_plan_blocks_new_deployment() {
    let env = env(&["web1"]);
    let registry = Registry::builder().component(component("a", json!(1), &[])).build().unwrap();
    let notifier = RecordingNotifier::default();
    let options = DeployOptions::default();

    // First run fails mid-plan, leaving it outstanding.
    let failing = FakeRunner {
      ran: RefCell::new(Vec::new()),
      fail_on: Some("echo deploy".to_string()),
    };
    let err = run_deployment(
      &registry, &env.ctx, &env.manifests, &env.plans, &failing, &notifier, &options,
    )
    .unwrap_err();
    assert!(matches!(err, DeployError::Plan(PlanError::Step { .. })));

    // Second run is refused before diffing.
    let runner = FakeRunner::default();
    let err = run_deployment(
      &registry, &env.ctx, &env.manifests, &env.plans, &runner, &notifier, &options,
    )
    .unwrap_err();
    assert!(matches!(err, DeployError::OutstandingPlan { .. }));
    assert!(runner.ran.borrow().is_empty());
  }

  #[test]
  fn failed_plan_resumes_to_completion() {
    let env = env(&["web1"]);
    let registry = Registry::builder()
      .component(component("b", json!(1), &[]))
      .component(component("a", json!(2), &["b"]))
      .build()
      .unwrap();
    let notifier = RecordingNotifier::default();

    // The first run fails on the second step (component B's action emits the
    // same command for both components, so fail on the second occurrence by
    // count instead: use a runner that fails once).
    struct FailOnce {
      failed: RefCell<bool>,
      ran: RefCell<usize>,
    }
    impl StepRunner for FailOnce {
      fn run_step(&self, step: &Step) -> Result<(), StepError> {
        if *self.ran.borrow() == 1 && !*self.failed.borrow() {
          *self.failed.borrow_mut() = true;
          return Err(StepError::Failed {
            step: step.render(),
            code: Some(1),
          });
        }
        *self.ran.borrow_mut() += 1;
        Ok(())
      }
    }

    let flaky = FailOnce {
      failed: RefCell::new(false),
      ran: RefCell::new(0),
    };
    let err = run_deployment(
      &registry,
      &env.ctx,
      &env.manifests,
      &env.plans,
      &flaky,
      &notifier,
      &DeployOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, DeployError::Plan(PlanError::Step { index: 1, .. })));

    // Resume finishes the remaining step and completes the plan.
    let outcome = resume_deployment(&registry, &env.ctx, &env.manifests, &env.plans, &flaky, &notifier).unwrap();
    let Outcome::Deployed(report) = outcome else {
      panic!("expected deployment");
    };
    assert_eq!(report.executed, 1);
    assert!(env.plans.outstanding("prod").unwrap().is_none());
    assert!(!env.manifests.last_manifest("prod").unwrap().is_empty());
  }

  #[test]
  fn resume_without_outstanding_plan_is_an_error() {
    let env = env(&["web1"]);
    let registry = Registry::builder().component(component("a", json!(1), &[])).build().unwrap();
    let err = resume_deployment(
      &registry,
      &env.ctx,
      &env.manifests,
      &env.plans,
      &FakeRunner::default(),
      &RecordingNotifier::default(),
    )
    .unwrap_err();
    assert!(matches!(err, DeployError::NoOutstandingPlan(_)));
  }

  #[test]
  fn cycle_aborts_before_any_action() {
    let env = env(&["web1"]);
    let registry = Registry::builder()
      .component(component("a", json!(1), &["b"]))
      .component(component("b", json!(2), &["a"]))
      .build()
      .unwrap();
    let runner = FakeRunner::default();

    let err = run_deployment(
      &registry,
      &env.ctx,
      &env.manifests,
      &env.plans,
      &runner,
      &RecordingNotifier::default(),
      &DeployOptions::default(),
    )
    .unwrap_err();

    assert!(matches!(err, DeployError::Configuration(OrderError::Cycle(_))));
    assert!(runner.ran.borrow().is_empty());
    assert!(env.plans.numbers("prod").unwrap().is_empty());
  }

  #[test]
  fn pre_and_post_deploy_actions_frame_the_plan() {
    let env = env(&["web1"]);
    let framed = Component::named("base", Arc::new(FixedRecorder(json!(0))))
      .action(Phase::PreDeploy, Arc::new(EchoAction("before")))
      .action(Phase::PostDeploy, Arc::new(EchoAction("after")))
      .build();
    let registry = Registry::builder()
      .component(framed)
      .component(component("app", json!(1), &[]))
      .build()
      .unwrap();
    let runner = FakeRunner::default();

    run_deployment(
      &registry,
      &env.ctx,
      &env.manifests,
      &env.plans,
      &runner,
      &RecordingNotifier::default(),
      &DeployOptions::default(),
    )
    .unwrap();

    assert_eq!(*runner.ran.borrow(), vec!["echo before", "echo deploy", "echo after"]);
  }

  #[test]
  fn diff_values_reach_deploy_actions() {
    struct AssertChange;
    impl crate::registry::Action for AssertChange {
      fn id(&self) -> &str {
        "assert-change"
      }
      fn steps(&self, ctx: &ActionContext<'_>) -> Result<Vec<Step>, ActionError> {
        let change = ctx.change.expect("deploy actions receive the change");
        assert_eq!(change.current, json!(7));
        Ok(vec![Step::new(ctx.host, "deploy", RunMethod::Local, "true")])
      }
    }

    let env = env(&["web1"]);
    let comp = Component::named("app", Arc::new(FixedRecorder(json!(7))))
      .action(Phase::Deploy, Arc::new(AssertChange))
      .build();
    let registry = Registry::builder().component(comp).build().unwrap();

    run_deployment(
      &registry,
      &env.ctx,
      &env.manifests,
      &env.plans,
      &FakeRunner::default(),
      &RecordingNotifier::default(),
      &DeployOptions::default(),
    )
    .unwrap();
  }
}
