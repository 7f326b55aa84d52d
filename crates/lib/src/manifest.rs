//! The manifest engine.
//!
//! A [`Manifest`] maps uppercased component names to opaque, serializable
//! snapshots of each component's applied state. No schema is imposed on the
//! snapshot values; each component defines its own.
//!
//! Persisted manifests are immutable: a new manifest is always written as a
//! new record. The newest record for a role is the "last manifest" that
//! future diffs compare against.
//!
//! # Storage Layout
//!
//! ```text
//! {state_dir}/roles/<role>/manifests/
//! └── <timestamp>-<host>.json     # one record per successful deployment
//! ```
//!
//! Filenames sort lexicographically in creation order, so the most recent
//! record is discoverable without an index pointer.

use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::registry::{ComponentName, RecordContext, Registry};
use crate::statedir::{StateDir, write_atomic};

/// Key of the structured marker recorded when a component's recorder failed.
pub const ERROR_MARKER_KEY: &str = "recorder_error";

/// Errors from manifest persistence.
#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("failed to create manifests directory: {0}")]
  CreateDir(io::Error),

  #[error("failed to read manifest: {0}")]
  Read(io::Error),

  #[error("failed to write manifest: {0}")]
  Write(io::Error),

  #[error("failed to parse manifest: {0}")]
  Parse(serde_json::Error),

  #[error("failed to serialize manifest: {0}")]
  Serialize(serde_json::Error),
}

/// A snapshot of applied component state at a point in time.
///
/// Entries preserve insertion order; the diff engine iterates them in that
/// order and callers needing a sorted view must sort explicitly. On disk this
/// serializes as a single mapping with the creation timestamp as a top-level
/// `manifest_creation_timestamp` key next to the component entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
  #[serde(rename = "manifest_creation_timestamp")]
  created_at: DateTime<Utc>,

  #[serde(flatten)]
  entries: IndexMap<String, Value>,
}

impl Default for Manifest {
  fn default() -> Self {
    Self::new()
  }
}

impl Manifest {
  /// An empty manifest stamped now.
  pub fn new() -> Self {
    Self {
      created_at: Utc::now(),
      entries: IndexMap::new(),
    }
  }

  pub fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }

  /// Insert a component's snapshot value. The key is the component's
  /// normalized (uppercase) name.
  pub fn insert(&mut self, name: &ComponentName, value: Value) {
    self.entries.insert(name.as_str().to_string(), value);
  }

  pub fn get(&self, name: &ComponentName) -> Option<&Value> {
    self.entries.get(name.as_str())
  }

  pub fn contains(&self, name: &ComponentName) -> bool {
    self.entries.contains_key(name.as_str())
  }

  /// Component entries in insertion order.
  pub fn entries(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.entries.iter()
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// The structured marker value recorded when a recorder fails.
  pub fn error_marker(message: impl Into<String>) -> Value {
    serde_json::json!({ ERROR_MARKER_KEY: message.into() })
  }

  /// Whether a manifest entry is a recorder-failure marker.
  pub fn entry_is_error(value: &Value) -> bool {
    value.as_object().is_some_and(|m| m.contains_key(ERROR_MARKER_KEY))
  }
}

/// Snapshot the current state of every registered component.
///
/// A failing recorder must not take the aggregation down: its entry becomes an
/// [error marker](Manifest::error_marker) and the remaining components still
/// record, so downstream diffing keeps working for them.
pub fn record_current_manifest(registry: &Registry, ctx: &RecordContext<'_>) -> Manifest {
  let mut manifest = Manifest::new();
  for component in registry.iter() {
    let value = match component.recorder().record(ctx) {
      Ok(value) => value,
      Err(e) => {
        warn!(component = %component.name(), error = %e, "manifest recorder failed");
        Manifest::error_marker(e.to_string())
      }
    };
    manifest.insert(component.name(), value);
  }
  manifest
}

/// Persists manifests per role and host under a [`StateDir`].
#[derive(Debug, Clone)]
pub struct ManifestStore {
  state: StateDir,
}

impl ManifestStore {
  pub fn new(state: StateDir) -> Self {
    Self { state }
  }

  /// Write a manifest record for a role and host. Returns the record path.
  ///
  /// Writes are atomic (temp file + rename); existing records are never
  /// touched.
  pub fn persist(&self, manifest: &Manifest, role: &str, host: &str) -> Result<PathBuf, ManifestError> {
    let dir = self.state.manifests_dir(role);
    fs::create_dir_all(&dir).map_err(ManifestError::CreateDir)?;

    let stamp = manifest.created_at.format("%Y%m%dT%H%M%S%6f");
    let path = dir.join(format!("{stamp}-{host}.json"));
    let content = serde_json::to_string_pretty(manifest).map_err(ManifestError::Serialize)?;
    write_atomic(&path, content.as_bytes()).map_err(ManifestError::Write)?;

    Ok(path)
  }

  /// Load the most recently persisted manifest for a role.
  ///
  /// Returns an empty manifest if none has ever been persisted.
  pub fn last_manifest(&self, role: &str) -> Result<Manifest, ManifestError> {
    let dir = self.state.manifests_dir(role);
    let entries = match fs::read_dir(&dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Manifest::new()),
      Err(e) => return Err(ManifestError::Read(e)),
    };

    let mut newest: Option<PathBuf> = None;
    for entry in entries {
      let path = entry.map_err(ManifestError::Read)?.path();
      if path.extension().is_none_or(|ext| ext != "json") {
        continue;
      }
      if newest.as_ref().is_none_or(|best| path.file_name() > best.file_name()) {
        newest = Some(path);
      }
    }

    let Some(path) = newest else {
      return Ok(Manifest::new());
    };
    let content = fs::read_to_string(&path).map_err(ManifestError::Read)?;
    serde_json::from_str(&content).map_err(ManifestError::Parse)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::registry::test_support::{FailingRecorder, FixedRecorder, component};
  use crate::registry::Component;
  use crate::settings::Settings;
  use serde_json::json;
  use std::sync::Arc;
  use tempfile::TempDir;

  fn record_ctx(settings: &Settings) -> RecordContext<'_> {
    RecordContext {
      role: "prod",
      settings,
    }
  }

  #[test]
  fn keys_are_uppercased() {
    let mut manifest = Manifest::new();
    manifest.insert(&"web-server".into(), json!("abc"));

    let keys: Vec<&String> = manifest.entries().map(|(k, _)| k).collect();
    assert_eq!(keys, vec!["WEB-SERVER"]);
    assert_eq!(manifest.get(&"Web-Server".into()), Some(&json!("abc")));
  }

  #[test]
  fn entries_preserve_insertion_order() {
    let mut manifest = Manifest::new();
    manifest.insert(&"zeta".into(), json!(1));
    manifest.insert(&"alpha".into(), json!(2));
    manifest.insert(&"mid".into(), json!(3));

    let keys: Vec<&str> = manifest.entries().map(|(k, _)| k.as_str()).collect();
    assert_eq!(keys, vec!["ZETA", "ALPHA", "MID"]);
  }

  #[test]
  fn record_aggregates_all_components() {
    let registry = Registry::builder()
      .component(component("web", json!({"vhosts": ["a", "b"]})))
      .component(component("db", json!("migration-0042")))
      .build()
      .unwrap();
    let settings = Settings::new();

    let manifest = record_current_manifest(&registry, &record_ctx(&settings));
    assert_eq!(manifest.len(), 2);
    assert_eq!(manifest.get(&"web".into()), Some(&json!({"vhosts": ["a", "b"]})));
    assert_eq!(manifest.get(&"db".into()), Some(&json!("migration-0042")));
  }

  #[test]
  fn failing_recorder_does_not_stop_aggregation() {
    let broken = Component::named("broken", Arc::new(FailingRecorder)).build();
    let registry = Registry::builder()
      .component(component("web", json!(1)))
      .component(broken)
      .component(component("db", json!(2)))
      .build()
      .unwrap();
    let settings = Settings::new();

    let manifest = record_current_manifest(&registry, &record_ctx(&settings));

    // All components have entries; the broken one carries an error marker.
    assert_eq!(manifest.len(), 3);
    assert_eq!(manifest.get(&"web".into()), Some(&json!(1)));
    assert_eq!(manifest.get(&"db".into()), Some(&json!(2)));
    let marker = manifest.get(&"broken".into()).unwrap();
    assert!(Manifest::entry_is_error(marker));
    assert!(!Manifest::entry_is_error(&json!(1)));
  }

  #[test]
  fn persist_and_last_manifest_round_trip() {
    let temp = TempDir::new().unwrap();
    let store = ManifestStore::new(StateDir::at(temp.path()));

    let mut manifest = Manifest::new();
    manifest.insert(&"pkg".into(), json!(["nginx", "curl"]));
    store.persist(&manifest, "prod", "web1").unwrap();

    let loaded = store.last_manifest("prod").unwrap();
    assert_eq!(loaded, manifest);
  }

  #[test]
  fn last_manifest_empty_when_none_persisted() {
    let temp = TempDir::new().unwrap();
    let store = ManifestStore::new(StateDir::at(temp.path()));

    let manifest = store.last_manifest("fresh").unwrap();
    assert!(manifest.is_empty());
  }

  #[test]
  fn last_manifest_picks_newest_record() {
    let temp = TempDir::new().unwrap();
    let store = ManifestStore::new(StateDir::at(temp.path()));

    let mut older = Manifest::new();
    older.insert(&"pkg".into(), json!("old"));
    let mut newer = Manifest::new();
    newer.created_at = older.created_at + chrono::Duration::seconds(5);
    newer.insert(&"pkg".into(), json!("new"));

    store.persist(&newer, "prod", "web1").unwrap();
    store.persist(&older, "prod", "web1").unwrap();

    let loaded = store.last_manifest("prod").unwrap();
    assert_eq!(loaded.get(&"pkg".into()), Some(&json!("new")));
  }

  #[test]
  fn records_for_different_roles_are_disjoint() {
    let temp = TempDir::new().unwrap();
    let store = ManifestStore::new(StateDir::at(temp.path()));

    let mut prod = Manifest::new();
    prod.insert(&"pkg".into(), json!("prod-pkgs"));
    store.persist(&prod, "prod", "web1").unwrap();

    assert!(store.last_manifest("dev").unwrap().is_empty());
    assert_eq!(store.last_manifest("prod").unwrap(), prod);
  }

  #[test]
  fn on_disk_form_has_timestamp_key() {
    let temp = TempDir::new().unwrap();
    let store = ManifestStore::new(StateDir::at(temp.path()));

    let mut manifest = Manifest::new();
    manifest.insert(&"db".into(), json!("migration-7"));
    let path = store.persist(&manifest, "prod", "db1").unwrap();

    let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
    let map = raw.as_object().unwrap();
    assert!(map.contains_key("manifest_creation_timestamp"));
    assert_eq!(map.get("DB"), Some(&json!("migration-7")));
  }

  #[test]
  fn timestamp_renders_iso8601() {
    let manifest = Manifest::new();
    let rendered = manifest.created_at().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    assert!(rendered.ends_with('Z'));
  }
}
