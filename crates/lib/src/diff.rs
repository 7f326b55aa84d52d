//! Diff computation between manifests.
//!
//! Compares the last persisted manifest against the freshly recorded one,
//! per component, yielding the before/after values of every component whose
//! snapshot differs. Downstream this drives the changed set handed to the
//! plan builder.

use serde_json::Value;

use crate::manifest::Manifest;
use crate::registry::ComponentName;

/// One component whose snapshot differs between two manifests.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentChange {
  pub component: ComponentName,
  /// The last-applied value, `None` when the component is new.
  pub last: Option<Value>,
  pub current: Value,
}

impl ComponentChange {
  /// Whether this component has never been applied before.
  pub fn is_new(&self) -> bool {
    self.last.is_none()
  }
}

/// Compare two manifests component by component.
///
/// Iterates the entries of `current` in insertion order (callers needing a
/// sorted view sort explicitly) and yields a change for every component whose
/// value differs from `last` under deep structural equality. A component with
/// no entry in `last` is always considered changed. Components present only
/// in `last` are skipped here; see [`diff_removed`].
pub fn diff(last: &Manifest, current: &Manifest) -> Vec<ComponentChange> {
  let mut changes = Vec::new();
  for (key, value) in current.entries() {
    let name = ComponentName::new(key);
    let previous = last.get(&name);
    if previous != Some(value) {
      changes.push(ComponentChange {
        component: name,
        last: previous.cloned(),
        current: value.clone(),
      });
    }
  }
  changes
}

/// Components present in `last` but absent from `current`, in `last`'s entry
/// order.
///
/// A component disappearing entirely usually means a service was
/// decommissioned and its module unregistered. The core reports it but
/// synthesizes no cleanup actions; teardown needs a registered component.
pub fn diff_removed(last: &Manifest, current: &Manifest) -> Vec<ComponentName> {
  last
    .entries()
    .map(|(key, _)| ComponentName::new(key))
    .filter(|name| !current.contains(name))
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn manifest(entries: &[(&str, Value)]) -> Manifest {
    let mut m = Manifest::new();
    for (name, value) in entries {
      m.insert(&ComponentName::new(name), value.clone());
    }
    m
  }

  #[test]
  fn identical_manifests_have_no_diff() {
    let m = manifest(&[
      ("pkg", json!(["nginx", "curl"])),
      ("db", json!({"migration": "0042"})),
    ]);
    assert!(diff(&m, &m).is_empty());
  }

  #[test]
  fn first_time_component_is_changed() {
    let last = Manifest::new();
    let current = manifest(&[("pkg", json!(["nginx"]))]);

    let changes = diff(&last, &current);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].component, "pkg".into());
    assert!(changes[0].is_new());
    assert_eq!(changes[0].current, json!(["nginx"]));
  }

  #[test]
  fn changed_value_yields_before_and_after() {
    let last = manifest(&[("web", json!("hash-aaa"))]);
    let current = manifest(&[("web", json!("hash-bbb"))]);

    let changes = diff(&last, &current);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].last, Some(json!("hash-aaa")));
    assert_eq!(changes[0].current, json!("hash-bbb"));
  }

  #[test]
  fn unchanged_components_are_skipped() {
    let last = manifest(&[("web", json!(1)), ("db", json!(2))]);
    let current = manifest(&[("web", json!(1)), ("db", json!(3))]);

    let changes = diff(&last, &current);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].component, "db".into());
  }

  #[test]
  fn deep_structural_equality() {
    let last = manifest(&[("web", json!({"vhosts": [{"name": "a", "port": 80}]}))]);
    let same = manifest(&[("web", json!({"vhosts": [{"name": "a", "port": 80}]}))]);
    let deeper = manifest(&[("web", json!({"vhosts": [{"name": "a", "port": 8080}]}))]);

    assert!(diff(&last, &same).is_empty());
    assert_eq!(diff(&last, &deeper).len(), 1);
  }

  #[test]
  fn order_follows_current_insertion_order() {
    let last = Manifest::new();
    let current = manifest(&[("zeta", json!(1)), ("alpha", json!(2)), ("mid", json!(3))]);

    let changes = diff(&last, &current);
    let names: Vec<&str> = changes.iter().map(|c| c.component.as_str()).collect();
    assert_eq!(names, vec!["ZETA", "ALPHA", "MID"]);
  }

  #[test]
  fn component_only_in_last_is_not_a_change() {
    let last = manifest(&[("web", json!(1)), ("retired", json!(2))]);
    let current = manifest(&[("web", json!(1))]);

    assert!(diff(&last, &current).is_empty());
    assert_eq!(diff_removed(&last, &current), vec![ComponentName::new("retired")]);
  }

  #[test]
  fn diff_removed_empty_when_nothing_removed() {
    let last = manifest(&[("web", json!(1))]);
    let current = manifest(&[("web", json!(2)), ("db", json!(3))]);
    assert!(diff_removed(&last, &current).is_empty());
  }
}
