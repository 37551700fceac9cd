//! Topological ordering of manifest services.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::error::EngineError;

/// Kahn's algorithm over the directed graph `dep -> dependent`. Ties among
/// ready nodes break by insertion order (the order `depends_on` was given
/// in the map), which keeps test output deterministic.
///
/// Returns the dangling-reference or cycle error as a `validation`
/// [`EngineError`] — both are fatal before any remote call.
pub fn resolve_start_order(
  depends_on: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<String>, EngineError> {
  for (name, deps) in depends_on {
    for dep in deps {
      if !depends_on.contains_key(dep) {
        return Err(EngineError::validation(anyhow::anyhow!(
          "service \"{name}\" depends on undeclared service \"{dep}\""
        )));
      }
    }
  }

  // in_degree[x] = number of services x itself depends on that haven't
  // been emitted yet. `dependents[d]` = services that declare `depends_on:
  // [d]`, i.e. the edges `d -> dependent`.
  let mut in_degree: BTreeMap<&str, usize> = depends_on
    .keys()
    .map(|name| (name.as_str(), 0usize))
    .collect();
  let mut dependents: BTreeMap<&str, Vec<&str>> =
    depends_on.keys().map(|name| (name.as_str(), Vec::new())).collect();

  for (name, deps) in depends_on {
    *in_degree.get_mut(name.as_str()).unwrap() += deps.len();
    for dep in deps {
      dependents.get_mut(dep.as_str()).unwrap().push(name.as_str());
    }
  }

  // Insertion order for deterministic tie-breaks; `BTreeMap` iteration is
  // alphabetical, so keep the original key order separately.
  let insertion_order: Vec<&str> =
    depends_on.keys().map(String::as_str).collect();

  let mut queue: VecDeque<&str> = insertion_order
    .iter()
    .copied()
    .filter(|name| in_degree[name] == 0)
    .collect();

  let mut order = Vec::with_capacity(depends_on.len());
  while let Some(name) = queue.pop_front() {
    order.push(name.to_string());
    for dependent in &dependents[name] {
      let degree = in_degree.get_mut(dependent).unwrap();
      *degree -= 1;
      if *degree == 0 {
        queue.push_back(dependent);
      }
    }
  }

  if order.len() != depends_on.len() {
    let cycle = find_cycle(depends_on);
    return Err(EngineError::validation(anyhow::anyhow!(
      "circular dependency detected: {}",
      cycle.join(" -> ")
    )));
  }

  Ok(order)
}

pub fn reverse_order(order: &[String]) -> Vec<String> {
  order.iter().rev().cloned().collect()
}

/// DFS-based cycle path extraction for a user-facing message, run only
/// after Kahn's algorithm has already confirmed a cycle exists.
fn find_cycle(depends_on: &BTreeMap<String, Vec<String>>) -> Vec<String> {
  #[derive(Clone, Copy, PartialEq)]
  enum Mark {
    Visiting,
    Done,
  }

  let mut marks: BTreeMap<&str, Mark> = BTreeMap::new();
  let mut stack: Vec<&str> = Vec::new();

  fn visit<'a>(
    node: &'a str,
    depends_on: &'a BTreeMap<String, Vec<String>>,
    marks: &mut BTreeMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
  ) -> Option<Vec<String>> {
    if let Some(pos) = stack.iter().position(|n| *n == node) {
      return Some(
        stack[pos..]
          .iter()
          .map(|s| s.to_string())
          .chain(std::iter::once(node.to_string()))
          .collect(),
      );
    }
    if marks.get(node) == Some(&Mark::Done) {
      return None;
    }
    marks.insert(node, Mark::Visiting);
    stack.push(node);
    if let Some(deps) = depends_on.get(node) {
      for dep in deps {
        if let Some(cycle) = visit(dep, depends_on, marks, stack) {
          return Some(cycle);
        }
      }
    }
    stack.pop();
    marks.insert(node, Mark::Done);
    None
  }

  for name in depends_on.keys() {
    if let Some(cycle) = visit(name, depends_on, &mut marks, &mut stack) {
      return cycle;
    }
  }
  // Unreachable in practice: resolve_start_order only calls this once it
  // has already proven a cycle exists via the in-degree count mismatch.
  depends_on.keys().cloned().collect::<BTreeSet<_>>().into_iter().collect()
}
