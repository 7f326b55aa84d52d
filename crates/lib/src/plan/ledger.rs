//! The plan execution ledger.
//!
//! A [`Plan`] is an ordered sequence of steps scoped to a role, persisted on
//! disk so a deployment can be interrupted and resumed without re-running
//! completed steps.
//!
//! # Storage Layout
//!
//! ```text
//! {state_dir}/roles/<role>/plans/<NNNN>/
//! ├── steps               # one `[user@host] method: command` line per step
//! ├── index               # plain integer: number of leading steps completed
//! ├── history             # CSV append-only log: step,start,end
//! ├── hosts               # newline-delimited host set, frozen at creation
//! └── thumbprints/
//!     └── <host>.json     # per-host manifest captured at completion
//! ```
//!
//! The `index` and `steps` files are replaced atomically; `history` is
//! append-only and never rewritten. A plan is complete only when the index
//! equals the step count AND every host in the host set has a thumbprint.

use std::fs;
use std::io;
use std::io::Write as _;
use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::manifest::Manifest;
use crate::statedir::{StateDir, write_atomic};

use super::step::{Step, StepError, StepParseError, StepRunner};

const STEPS_FILE: &str = "steps";
const INDEX_FILE: &str = "index";
const HISTORY_FILE: &str = "history";
const HOSTS_FILE: &str = "hosts";
const THUMBPRINTS_DIR: &str = "thumbprints";
const HISTORY_HEADER: &str = "step,start,end";

/// Errors from the plan ledger. Persistence failures always surface
/// immediately; silently losing progress tracking would corrupt future diffs.
#[derive(Debug, Error)]
pub enum PlanError {
  #[error("failed to create plan directory: {0}")]
  CreateDir(io::Error),

  #[error("failed to read plan file: {0}")]
  Read(io::Error),

  #[error("failed to write plan file: {0}")]
  Write(io::Error),

  #[error(transparent)]
  ParseStep(#[from] StepParseError),

  #[error("corrupt plan record: {0}")]
  Corrupt(String),

  #[error("failed to serialize thumbprint: {0}")]
  Serialize(serde_json::Error),

  #[error("no plan {number:04} for role {role}")]
  NoSuchPlan { role: String, number: u32 },

  #[error("no plans exist for role {0}")]
  NoPlans(String),

  #[error("step range {from}..={to} out of bounds for {len} steps")]
  RangeOutOfBounds { from: usize, to: usize, len: usize },

  #[error("thumbprint already recorded for host {0}")]
  ThumbprintExists(String),

  /// A step failed during execution. The index reflects only the steps that
  /// completed; re-invoking `execute` resumes from there.
  #[error("step {index} failed: {source}")]
  Step { index: usize, source: StepError },
}

/// One row of a plan's execution history.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRow {
  pub step: usize,
  pub start: DateTime<Utc>,
  pub end: DateTime<Utc>,
}

/// Locates plan ledgers for roles under a [`StateDir`].
#[derive(Debug, Clone)]
pub struct PlanStore {
  state: StateDir,
}

impl PlanStore {
  pub fn new(state: StateDir) -> Self {
    Self { state }
  }

  fn plan_dir(&self, role: &str, number: u32) -> PathBuf {
    self.state.plans_dir(role).join(format!("{number:04}"))
  }

  /// Plan numbers present for a role, ascending. Non-numeric entries in the
  /// plans directory are ignored.
  pub fn numbers(&self, role: &str) -> Result<Vec<u32>, PlanError> {
    let dir = self.state.plans_dir(role);
    let entries = match fs::read_dir(&dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(PlanError::Read(e)),
    };

    let mut numbers = Vec::new();
    for entry in entries {
      let entry = entry.map_err(PlanError::Read)?;
      if let Some(number) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
        numbers.push(number);
      }
    }
    numbers.sort_unstable();
    Ok(numbers)
  }

  /// Load every plan for a role, ascending by number.
  pub fn list(&self, role: &str) -> Result<Vec<Plan>, PlanError> {
    self
      .numbers(role)?
      .into_iter()
      .map(|number| Plan::load(self, role, number))
      .collect()
  }

  /// The most recent plan for a role, if it is incomplete.
  ///
  /// This is the driver's serialization guard: a new deployment must refuse
  /// to start while the previous plan is outstanding.
  pub fn outstanding(&self, role: &str) -> Result<Option<Plan>, PlanError> {
    let Some(&last) = self.numbers(role)?.last() else {
      return Ok(None);
    };
    let plan = Plan::load(self, role, last)?;
    Ok(if plan.is_complete() { None } else { Some(plan) })
  }
}

/// An ordered, resumable sequence of steps for one deployment attempt.
#[derive(Debug)]
pub struct Plan {
  dir: PathBuf,
  role: String,
  number: u32,
  steps: Vec<Step>,
  index: usize,
  hosts: Vec<String>,
}

impl Plan {
  /// Create the next numbered plan for a role, snapshotting the host set.
  ///
  /// Reads the last plan number (0 if none) and increments it. The new plan
  /// has no steps and index 0.
  pub fn get_or_create_next(
    store: &PlanStore,
    role: &str,
    hosts: impl IntoIterator<Item = impl Into<String>>,
  ) -> Result<Self, PlanError> {
    let number = store.numbers(role)?.last().copied().unwrap_or(0) + 1;
    let dir = store.plan_dir(role, number);
    fs::create_dir_all(dir.join(THUMBPRINTS_DIR)).map_err(PlanError::CreateDir)?;

    let plan = Self {
      dir,
      role: role.to_string(),
      number,
      steps: Vec::new(),
      index: 0,
      hosts: hosts.into_iter().map(Into::into).collect(),
    };

    let hosts_blob = plan.hosts.join("\n") + "\n";
    write_atomic(&plan.dir.join(HOSTS_FILE), hosts_blob.as_bytes()).map_err(PlanError::Write)?;
    write_atomic(&plan.dir.join(STEPS_FILE), b"").map_err(PlanError::Write)?;
    plan.write_index()?;

    info!(role, plan = %plan.name(), hosts = plan.hosts.len(), "created plan");
    Ok(plan)
  }

  /// Load an existing plan.
  pub fn load(store: &PlanStore, role: &str, number: u32) -> Result<Self, PlanError> {
    let dir = store.plan_dir(role, number);
    if !dir.is_dir() {
      return Err(PlanError::NoSuchPlan {
        role: role.to_string(),
        number,
      });
    }

    let read = |file: &str| fs::read_to_string(dir.join(file)).map_err(PlanError::Read);

    let steps = read(STEPS_FILE)?
      .lines()
      .map(Step::parse)
      .collect::<Result<Vec<_>, _>>()?;

    let raw_index = read(INDEX_FILE)?;
    let index: usize = raw_index
      .trim()
      .parse()
      .map_err(|_| PlanError::Corrupt(format!("index file holds {raw_index:?}")))?;
    if index > steps.len() {
      return Err(PlanError::Corrupt(format!(
        "index {index} exceeds step count {}",
        steps.len()
      )));
    }

    let hosts = read(HOSTS_FILE)?.lines().map(str::to_string).filter(|h| !h.is_empty()).collect();

    Ok(Self {
      dir,
      role: role.to_string(),
      number,
      steps,
      index,
      hosts,
    })
  }

  /// Zero-padded plan name, e.g. `0007`.
  pub fn name(&self) -> String {
    format!("{:04}", self.number)
  }

  pub fn role(&self) -> &str {
    &self.role
  }

  pub fn number(&self) -> u32 {
    self.number
  }

  pub fn steps(&self) -> &[Step] {
    &self.steps
  }

  /// Number of leading steps confirmed executed. Never decreases.
  pub fn executed(&self) -> usize {
    self.index
  }

  /// Host set frozen at creation time.
  pub fn hosts(&self) -> &[String] {
    &self.hosts
  }

  /// Append steps to the plan and persist the step file.
  pub fn append_steps(&mut self, steps: impl IntoIterator<Item = Step>) -> Result<(), PlanError> {
    self.steps.extend(steps);
    let mut blob = String::new();
    for step in &self.steps {
      blob.push_str(&step.render());
      blob.push('\n');
    }
    write_atomic(&self.dir.join(STEPS_FILE), blob.as_bytes()).map_err(PlanError::Write)
  }

  /// Execute steps from `from` (defaulting to the persisted index) through
  /// `to` inclusive (defaulting to the last step). Returns the number of
  /// steps executed by this call.
  ///
  /// After each step succeeds the index is advanced and persisted atomically
  /// and a history row is appended. If a step fails, execution halts
  /// immediately, the index reflects only the completed steps, and the error
  /// propagates; re-invoking `execute` resumes from the persisted index.
  pub fn execute(
    &mut self,
    runner: &dyn StepRunner,
    from: Option<usize>,
    to: Option<usize>,
  ) -> Result<usize, PlanError> {
    let from = from.unwrap_or(self.index);
    let to = to.unwrap_or(self.steps.len().saturating_sub(1));
    if self.steps.is_empty() || from == self.steps.len() {
      // Nothing left to execute; resuming a finished plan is a no-op.
      return Ok(0);
    }
    if from > to || to >= self.steps.len() {
      return Err(PlanError::RangeOutOfBounds {
        from,
        to,
        len: self.steps.len(),
      });
    }

    let mut executed = 0;
    for i in from..=to {
      let step = &self.steps[i];
      debug!(role = %self.role, plan = %self.name(), step = i, "executing {step}");

      let start = Utc::now();
      runner
        .run_step(step)
        .map_err(|source| PlanError::Step { index: i, source })?;
      let end = Utc::now();

      // The index is monotonic: re-running an earlier range never rewinds it.
      if i + 1 > self.index {
        self.index = i + 1;
        self.write_index()?;
      }
      self.append_history(i, start, end)?;
      executed += 1;
    }

    Ok(executed)
  }

  /// Whether every step has executed and every host has a thumbprint.
  pub fn is_complete(&self) -> bool {
    self.index == self.steps.len() && self.hosts.iter().all(|host| self.has_thumbprint(host))
  }

  /// Fraction of steps executed, in `0.0..=1.0`. A plan with no steps counts
  /// as fully executed.
  pub fn completion(&self) -> f64 {
    if self.steps.is_empty() {
      1.0
    } else {
      self.index as f64 / self.steps.len() as f64
    }
  }

  fn thumbprint_path(&self, host: &str) -> PathBuf {
    self.dir.join(THUMBPRINTS_DIR).join(format!("{host}.json"))
  }

  pub fn has_thumbprint(&self, host: &str) -> bool {
    self.thumbprint_path(host).exists()
  }

  /// Record the completion thumbprint for one host: the manifest captured
  /// once that host finished applying the plan.
  ///
  /// Writing a second thumbprint for the same host is rejected; the state
  /// may have drifted between captures and the first record must stand.
  pub fn record_thumbprint(&self, host: &str, manifest: &Manifest) -> Result<(), PlanError> {
    let path = self.thumbprint_path(host);
    if path.exists() {
      return Err(PlanError::ThumbprintExists(host.to_string()));
    }
    let content = serde_json::to_string_pretty(manifest).map_err(PlanError::Serialize)?;
    write_atomic(&path, content.as_bytes()).map_err(PlanError::Write)
  }

  /// Load the thumbprint recorded for a host, if any.
  pub fn thumbprint(&self, host: &str) -> Result<Option<Manifest>, PlanError> {
    let content = match fs::read_to_string(self.thumbprint_path(host)) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => return Err(PlanError::Read(e)),
    };
    let manifest = serde_json::from_str(&content).map_err(|e| PlanError::Corrupt(e.to_string()))?;
    Ok(Some(manifest))
  }

  /// The execution history, oldest first.
  pub fn history(&self) -> Result<Vec<HistoryRow>, PlanError> {
    let content = match fs::read_to_string(self.dir.join(HISTORY_FILE)) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(PlanError::Read(e)),
    };

    let mut rows = Vec::new();
    for line in content.lines().skip(1) {
      let corrupt = || PlanError::Corrupt(format!("history row {line:?}"));
      let mut fields = line.splitn(3, ',');
      let step = fields.next().and_then(|f| f.parse().ok()).ok_or_else(corrupt)?;
      let start = fields
        .next()
        .and_then(|f| f.parse::<DateTime<Utc>>().ok())
        .ok_or_else(corrupt)?;
      let end = fields
        .next()
        .and_then(|f| f.parse::<DateTime<Utc>>().ok())
        .ok_or_else(corrupt)?;
      rows.push(HistoryRow { step, start, end });
    }
    Ok(rows)
  }

  fn write_index(&self) -> Result<(), PlanError> {
    write_atomic(&self.dir.join(INDEX_FILE), format!("{}\n", self.index).as_bytes()).map_err(PlanError::Write)
  }

  fn append_history(&self, step: usize, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), PlanError> {
    let path = self.dir.join(HISTORY_FILE);
    let mut file = fs::OpenOptions::new()
      .create(true)
      .append(true)
      .open(&path)
      .map_err(PlanError::Write)?;

    let mut row = String::new();
    if file.metadata().map_err(PlanError::Write)?.len() == 0 {
      row.push_str(HISTORY_HEADER);
      row.push('\n');
    }
    row.push_str(&format!(
      "{step},{},{}\n",
      start.to_rfc3339_opts(SecondsFormat::Micros, true),
      end.to_rfc3339_opts(SecondsFormat::Micros, true)
    ));
    file.write_all(row.as_bytes()).map_err(PlanError::Write)
  }
}

/// Compact a role's plan history into a single synthetic initial plan.
///
/// Removes every existing plan directory and creates plan `0001` with no
/// steps and a thumbprint of the given manifest for every host of the most
/// recent plan's host set. Errors if the role has no plans.
pub fn truncate(store: &PlanStore, role: &str, manifest: &Manifest) -> Result<Plan, PlanError> {
  let numbers = store.numbers(role)?;
  let Some(&last) = numbers.last() else {
    return Err(PlanError::NoPlans(role.to_string()));
  };
  let hosts: Vec<String> = Plan::load(store, role, last)?.hosts().to_vec();

  for number in numbers {
    fs::remove_dir_all(store.plan_dir(role, number)).map_err(PlanError::Write)?;
  }

  let plan = Plan::get_or_create_next(store, role, hosts)?;
  for host in plan.hosts().to_vec() {
    plan.record_thumbprint(&host, manifest)?;
  }
  info!(role, plan = %plan.name(), "truncated plan history");
  Ok(plan)
}
