//! Dependency-ordered plan building.
//!
//! Given the set of changed components, resolves their declared
//! `deploy_before` precedence constraints into a deterministic execution
//! order. Only edges between components that are both in the changed set
//! matter; the rest of the registry's graph is irrelevant for one deployment.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;

use crate::registry::{ComponentName, Registry};

/// Errors from resolving the deployment order.
#[derive(Debug, Error, PartialEq)]
pub enum OrderError {
  /// The precedence constraints between the listed components form a cycle.
  /// Fatal configuration error; no edge is ever silently dropped.
  #[error("dependency cycle between components: {}", .0.iter().map(ComponentName::as_str).collect::<Vec<_>>().join(", "))]
  Cycle(Vec<ComponentName>),

  /// A changed component has no registration.
  #[error("changed component is not registered: {0}")]
  UnknownComponent(ComponentName),
}

/// Resolve the execution order for a set of changed components.
///
/// `A.deploy_before = [B]` means A must execute before B, so the graph gains
/// an edge A -> B whenever both are changed. The order is a topological sort
/// (Kahn's algorithm); when several components are simultaneously ready, ties
/// break by component name ascending, keeping output deterministic across
/// runs.
pub fn deploy_order(registry: &Registry, changed: &BTreeSet<ComponentName>) -> Result<Vec<ComponentName>, OrderError> {
  let mut graph: DiGraph<ComponentName, ()> = DiGraph::new();
  let mut nodes: BTreeMap<ComponentName, NodeIndex> = BTreeMap::new();

  for name in changed {
    if registry.get(name).is_none() {
      return Err(OrderError::UnknownComponent(name.clone()));
    }
    let idx = graph.add_node(name.clone());
    nodes.insert(name.clone(), idx);
  }

  for name in changed {
    let component = registry.get(name).expect("validated above");
    let &from = &nodes[name];
    for successor in component.deploy_before() {
      // Constraints against unchanged components don't order this run.
      if let Some(&to) = nodes.get(successor) {
        graph.add_edge(from, to, ());
      }
    }
  }

  // Kahn's algorithm with a name-ordered ready set for deterministic ties.
  let mut in_degree: BTreeMap<ComponentName, usize> = BTreeMap::new();
  for (name, &idx) in &nodes {
    let degree = graph.neighbors_directed(idx, petgraph::Direction::Incoming).count();
    in_degree.insert(name.clone(), degree);
  }

  let mut ready: BTreeSet<ComponentName> = in_degree
    .iter()
    .filter(|&(_, &degree)| degree == 0)
    .map(|(name, _)| name.clone())
    .collect();

  let mut order = Vec::with_capacity(nodes.len());
  while let Some(name) = ready.pop_first() {
    let idx = nodes[&name];
    for successor_idx in graph.neighbors_directed(idx, petgraph::Direction::Outgoing) {
      let successor = &graph[successor_idx];
      let degree = in_degree.get_mut(successor).expect("all nodes have degrees");
      *degree -= 1;
      if *degree == 0 {
        ready.insert(successor.clone());
      }
    }
    order.push(name);
  }

  if order.len() < nodes.len() {
    let cycle: Vec<ComponentName> = changed.iter().filter(|name| !order.contains(name)).cloned().collect();
    return Err(OrderError::Cycle(cycle));
  }

  Ok(order)
}
