//! Per-role hierarchical settings.
//!
//! Each role has a YAML settings file `<role>.yml` in the settings directory.
//! A top-level `includes` key names other roles whose settings are merged in
//! first (depth-first), with the including role's own keys winning. This is a
//! plain overlay merge; recorders and actions read the resulting flat map.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;

use serde_yaml::Value;
use thiserror::Error;

/// Key naming the roles merged into this one.
const INCLUDES_KEY: &str = "includes";

/// Errors from loading role settings.
#[derive(Debug, Error)]
pub enum SettingsError {
  /// The role's settings file does not exist.
  #[error("no settings file for role {0}")]
  NotFound(String),

  /// I/O error reading a settings file.
  #[error("io error: {0}")]
  Io(#[from] io::Error),

  /// YAML parse failure.
  #[error("parse error in settings for role {role}: {source}")]
  Parse {
    role: String,
    source: serde_yaml::Error,
  },

  /// The settings file's top level is not a mapping.
  #[error("settings for role {0} must be a mapping")]
  InvalidRoot(String),

  /// The `includes` key is not a sequence of role names.
  #[error("includes for role {0} must be a list of role names")]
  InvalidIncludes(String),

  /// Two roles include each other, directly or transitively.
  #[error("include cycle involving role {0}")]
  IncludeCycle(String),
}

/// Flat key/value settings for one role, after include resolution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
  values: BTreeMap<String, Value>,
}

impl Settings {
  /// An empty settings map.
  pub fn new() -> Self {
    Self::default()
  }

  /// Look up a raw value.
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.values.get(key)
  }

  /// Look up a string value.
  pub fn get_str(&self, key: &str) -> Option<&str> {
    self.values.get(key).and_then(Value::as_str)
  }

  /// Look up a list of strings. Non-string elements are skipped.
  pub fn get_str_list(&self, key: &str) -> Vec<String> {
    self
      .values
      .get(key)
      .and_then(Value::as_sequence)
      .map(|seq| seq.iter().filter_map(Value::as_str).map(str::to_string).collect())
      .unwrap_or_default()
  }

  /// Insert or replace a value.
  pub fn set(&mut self, key: impl Into<String>, value: Value) {
    self.values.insert(key.into(), value);
  }

  /// Overlay another settings map on top of this one. Keys in `other` win.
  pub fn overlay(&mut self, other: Settings) {
    self.values.extend(other.values);
  }

  /// Iterate over all keys and values.
  pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.values.iter()
  }

  pub fn is_empty(&self) -> bool {
    self.values.is_empty()
  }
}

/// Load settings for a role, resolving `includes` recursively.
pub fn load_role(dir: &Path, role: &str) -> Result<Settings, SettingsError> {
  let mut loading = BTreeSet::new();
  load_role_inner(dir, role, &mut loading)
}

fn load_role_inner(dir: &Path, role: &str, loading: &mut BTreeSet<String>) -> Result<Settings, SettingsError> {
  if !loading.insert(role.to_string()) {
    return Err(SettingsError::IncludeCycle(role.to_string()));
  }

  let path = dir.join(format!("{role}.yml"));
  let content = match std::fs::read_to_string(&path) {
    Ok(content) => content,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(SettingsError::NotFound(role.to_string())),
    Err(e) => return Err(SettingsError::Io(e)),
  };

  let value: Value = serde_yaml::from_str(&content).map_err(|source| SettingsError::Parse {
    role: role.to_string(),
    source,
  })?;
  let mapping = match value {
    Value::Mapping(m) => m,
    Value::Null => serde_yaml::Mapping::new(),
    _ => return Err(SettingsError::InvalidRoot(role.to_string())),
  };

  let mut own = Settings::new();
  let mut includes = Vec::new();
  for (key, value) in mapping {
    let Value::String(key) = key else {
      return Err(SettingsError::InvalidRoot(role.to_string()));
    };
    if key == INCLUDES_KEY {
      let seq = value
        .as_sequence()
        .ok_or_else(|| SettingsError::InvalidIncludes(role.to_string()))?;
      for include in seq {
        let name = include
          .as_str()
          .ok_or_else(|| SettingsError::InvalidIncludes(role.to_string()))?;
        includes.push(name.to_string());
      }
    } else {
      own.set(key, value);
    }
  }

  // Included roles merge first; the including role's own keys win.
  let mut merged = Settings::new();
  for include in includes {
    merged.overlay(load_role_inner(dir, &include, loading)?);
  }
  merged.overlay(own);

  loading.remove(role);
  Ok(merged)
}
