//! The step model: one atomic action targeted at one host.
//!
//! Steps carry fully-resolved command strings plus structured metadata (host,
//! user, execution method, optional key credential). The on-disk form is one
//! line per step:
//!
//! ```text
//! [deploy@web1] sudo: apt-get install -y nginx
//! ```
//!
//! Actually running a step is delegated to a [`StepRunner`]; the ledger and
//! driver never care what a command does, only whether it succeeded.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Command;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How a step's command is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMethod {
  /// Run on the target host as the acting user.
  Run,
  /// Run on the target host as the superuser.
  Sudo,
  /// Run on the local machine.
  Local,
  /// Transfer a file to the target host (`command` is `<local-src> <remote-dest>`).
  Put,
}

impl RunMethod {
  pub fn as_str(&self) -> &'static str {
    match self {
      RunMethod::Run => "run",
      RunMethod::Sudo => "sudo",
      RunMethod::Local => "local",
      RunMethod::Put => "put",
    }
  }
}

impl fmt::Display for RunMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for RunMethod {
  type Err = StepParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "run" => Ok(RunMethod::Run),
      "sudo" => Ok(RunMethod::Sudo),
      "local" => Ok(RunMethod::Local),
      "put" => Ok(RunMethod::Put),
      other => Err(StepParseError::UnknownMethod(other.to_string())),
    }
  }
}

/// A step line that could not be parsed.
#[derive(Debug, Error, PartialEq)]
pub enum StepParseError {
  #[error("unknown run method: {0}")]
  UnknownMethod(String),

  #[error("malformed step line: {0}")]
  Malformed(String),
}

/// One atomic action within a plan.
///
/// Immutable once created; executing a step produces a side effect but never
/// mutates the step itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
  /// Target host.
  pub host: String,
  /// Acting user.
  pub user: String,
  /// Execution method.
  pub method: RunMethod,
  /// Fully-resolved command string (no deferred interpolation).
  pub command: String,
  /// Optional key credential for remote methods. Not part of the on-disk
  /// line format; the runner supplies credentials when a resumed plan is
  /// executed.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub key: Option<PathBuf>,
}

impl Step {
  pub fn new(host: impl Into<String>, user: impl Into<String>, method: RunMethod, command: impl Into<String>) -> Self {
    Self {
      host: host.into(),
      user: user.into(),
      method,
      command: command.into(),
      key: None,
    }
  }

  pub fn with_key(mut self, key: impl Into<PathBuf>) -> Self {
    self.key = Some(key.into());
    self
  }

  /// Render the step as its on-disk line form.
  pub fn render(&self) -> String {
    format!("[{}@{}] {}: {}", self.user, self.host, self.method, self.command)
  }

  /// Parse a step from its on-disk line form.
  pub fn parse(line: &str) -> Result<Self, StepParseError> {
    let malformed = || StepParseError::Malformed(line.to_string());

    let rest = line.strip_prefix('[').ok_or_else(malformed)?;
    let (target, rest) = rest.split_once(']').ok_or_else(malformed)?;
    let (user, host) = target.split_once('@').ok_or_else(malformed)?;
    let (method, command) = rest.trim_start().split_once(": ").ok_or_else(malformed)?;
    if user.is_empty() || host.is_empty() {
      return Err(malformed());
    }

    Ok(Step::new(host, user, method.parse::<RunMethod>()?, command))
  }
}

impl fmt::Display for Step {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.render())
  }
}

/// A step failed to execute.
#[derive(Debug, Error)]
pub enum StepError {
  /// The command ran and exited non-zero.
  #[error("step failed with exit code {code:?}: {step}")]
  Failed { step: String, code: Option<i32> },

  /// A `put` step whose command is not `<src> <dest>`.
  #[error("malformed put step: {0}")]
  MalformedPut(String),

  /// The command could not be spawned at all.
  #[error("io error: {0}")]
  Io(#[from] io::Error),
}

/// Executes steps. The ledger calls this once per step, in order.
///
/// Implementations own connection/timeout policy; the ledger only sees
/// success or failure.
pub trait StepRunner {
  fn run_step(&self, step: &Step) -> Result<(), StepError>;
}

/// Default runner: local commands via `sh -c`, remote commands via `ssh`,
/// file transfers via `scp`.
#[derive(Debug, Default)]
pub struct ShellRunner {
  /// Identity file passed to ssh/scp when a step carries no key of its own.
  pub identity: Option<PathBuf>,
}

impl ShellRunner {
  pub fn new() -> Self {
    Self::default()
  }

  fn key_args(&self, step: &Step) -> Vec<String> {
    let key = step.key.as_ref().or(self.identity.as_ref());
    match key {
      Some(key) => vec!["-i".to_string(), key.display().to_string()],
      None => Vec::new(),
    }
  }

  fn check(step: &Step, mut command: Command) -> Result<(), StepError> {
    let status = command.status()?;
    if status.success() {
      Ok(())
    } else {
      Err(StepError::Failed {
        step: step.render(),
        code: status.code(),
      })
    }
  }
}

impl StepRunner for ShellRunner {
  fn run_step(&self, step: &Step) -> Result<(), StepError> {
    let target = format!("{}@{}", step.user, step.host);
    match step.method {
      RunMethod::Local => {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&step.command);
        Self::check(step, cmd)
      }
      RunMethod::Run => {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"]);
        cmd.args(self.key_args(step));
        cmd.arg(&target).arg(&step.command);
        Self::check(step, cmd)
      }
      RunMethod::Sudo => {
        let mut cmd = Command::new("ssh");
        cmd.args(["-o", "BatchMode=yes"]);
        cmd.args(self.key_args(step));
        cmd.arg(&target).arg("sudo").arg("--").arg("sh").arg("-c").arg(&step.command);
        Self::check(step, cmd)
      }
      RunMethod::Put => {
        let (src, dest) = step
          .command
          .split_once(' ')
          .ok_or_else(|| StepError::MalformedPut(step.command.clone()))?;
        let mut cmd = Command::new("scp");
        cmd.args(["-o", "BatchMode=yes"]);
        cmd.args(self.key_args(step));
        cmd.arg(src).arg(format!("{target}:{dest}"));
        Self::check(step, cmd)
      }
    }
  }
}
