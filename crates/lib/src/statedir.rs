//! State directory layout and atomic file writes.
//!
//! All persistent records (manifests, plan ledgers) live under a single base
//! directory:
//!
//! ```text
//! {state_dir}/roles/<role>/
//! ├── manifests/          # timestamped manifest snapshots
//! └── plans/<NNNN>/       # one directory per plan
//! ```
//!
//! The default location is the platform data directory (e.g.
//! `~/.local/share/convoy`), overridable via `CONVOY_STATE_DIR`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Application name, used for the default data directory.
pub const APP_NAME: &str = "convoy";

/// Environment variable overriding the state directory location.
pub const STATE_DIR_ENV: &str = "CONVOY_STATE_DIR";

/// Base directory for all persisted deployment state.
#[derive(Debug, Clone)]
pub struct StateDir {
  base: PathBuf,
}

impl StateDir {
  /// Create a state dir rooted at the given path.
  pub fn at(base: impl Into<PathBuf>) -> Self {
    Self { base: base.into() }
  }

  /// Resolve the default state directory.
  ///
  /// `CONVOY_STATE_DIR` takes precedence; otherwise the platform data
  /// directory is used, falling back to `.convoy` in the working directory
  /// when no home directory can be determined.
  pub fn default_dir() -> Self {
    if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
      return Self::at(dir);
    }
    let base = dirs::data_dir()
      .map(|d| d.join(APP_NAME))
      .unwrap_or_else(|| PathBuf::from(format!(".{APP_NAME}")));
    Self::at(base)
  }

  /// The base path of this state dir.
  pub fn base(&self) -> &Path {
    &self.base
  }

  /// Directory holding all state for one role.
  pub fn role_dir(&self, role: &str) -> PathBuf {
    self.base.join("roles").join(role)
  }

  /// Directory holding persisted manifests for one role.
  pub fn manifests_dir(&self, role: &str) -> PathBuf {
    self.role_dir(role).join("manifests")
  }

  /// Directory holding plan ledgers for one role.
  pub fn plans_dir(&self, role: &str) -> PathBuf {
    self.role_dir(role).join("plans")
  }
}

/// Write a file atomically (write to a temp file, then rename).
///
/// A concurrently-inspecting reader sees either the old contents or the new
/// contents, never a truncated file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
  let mut temp = path.as_os_str().to_owned();
  temp.push(".tmp");
  let temp = PathBuf::from(temp);

  fs::write(&temp, contents)?;
  fs::rename(&temp, path)?;
  Ok(())
}
