// src/dag/resolver.rs

//! Dependency resolver: graph validation and readiness analysis.
//!
//! - [`build`] validates a set of [`TaskSpec`]s (duplicates, dangling and
//!   self dependencies, cycles) and produces an immutable [`TaskGraph`].
//! - [`ready_nodes`] answers which nodes may be dispatched now.
//! - [`cascade_targets`] walks the reverse-edge index to find every
//!   transitive dependent of a permanently failed node.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graphmap::DiGraphMap;
use tracing::debug;

use crate::dag::graph::{Edges, TaskGraph};
use crate::dag::task_info::{TaskNode, TaskSpec};
use crate::errors::GraphValidationError;
use crate::types::{NodeId, NodeStatus};

/// Validate `specs` and build a [`TaskGraph`].
///
/// Fails with [`GraphValidationError::Cycle`] naming every node that sits
/// on a cycle. Validation errors are fatal; callers must not retry.
pub fn build(
    specs: Vec<TaskSpec>,
    synthesis: Option<NodeId>,
) -> Result<TaskGraph, GraphValidationError> {
    if specs.is_empty() {
        return Err(GraphValidationError::Empty);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for spec in &specs {
        if !seen.insert(spec.id.as_str()) {
            return Err(GraphValidationError::DuplicateNode(spec.id.clone()));
        }
    }

    for spec in &specs {
        for dep in &spec.after {
            if dep == &spec.id {
                return Err(GraphValidationError::SelfDependency(spec.id.clone()));
            }
            if !seen.contains(dep.as_str()) {
                return Err(GraphValidationError::DanglingDependency {
                    node: spec.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    if let Some(ref s) = synthesis {
        if !seen.contains(s.as_str()) {
            return Err(GraphValidationError::UnknownSynthesisNode(s.clone()));
        }
    }

    let topo_order = topological_order(&specs)?;

    let mut edges: HashMap<NodeId, Edges> = specs
        .iter()
        .map(|s| {
            let mut deps: Vec<NodeId> = Vec::with_capacity(s.after.len());
            for dep in &s.after {
                if !deps.contains(dep) {
                    deps.push(dep.clone());
                }
            }
            (
                s.id.clone(),
                Edges {
                    deps,
                    dependents: Vec::new(),
                },
            )
        })
        .collect();

    for spec in &specs {
        for dep in &spec.after {
            if let Some(e) = edges.get_mut(dep) {
                if !e.dependents.contains(&spec.id) {
                    e.dependents.push(spec.id.clone());
                }
            }
        }
    }

    debug!(nodes = specs.len(), ?topo_order, "task graph validated");

    let nodes = specs.into_iter().map(TaskNode::new).collect();
    Ok(TaskGraph::from_parts(nodes, edges, topo_order, synthesis))
}

/// Topologically sort the specs, or report the nodes that form cycles.
fn topological_order(specs: &[TaskSpec]) -> Result<Vec<NodeId>, GraphValidationError> {
    // Edge direction: dep -> task.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for spec in specs {
        graph.add_node(spec.id.as_str());
    }
    for spec in specs {
        for dep in &spec.after {
            graph.add_edge(dep.as_str(), spec.id.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(order) => Ok(order.into_iter().map(str::to_string).collect()),
        Err(_) => {
            let mut nodes: Vec<NodeId> = tarjan_scc(&graph)
                .into_iter()
                .filter(|scc| scc.len() > 1)
                .flatten()
                .map(str::to_string)
                .collect();
            nodes.sort();
            Err(GraphValidationError::Cycle { nodes })
        }
    }
}

/// Nodes that may be dispatched now.
///
/// A node is ready iff it is still `Pending`/`Blocked` and every
/// dependency is `Completed` *and* present in `committed` (the set of
/// nodes whose results have been committed to shared state). Reading the
/// committed set rather than only in-memory status keeps the check valid
/// after a resume.
pub fn ready_nodes(graph: &TaskGraph, committed: &HashSet<NodeId>) -> BTreeSet<NodeId> {
    graph
        .nodes()
        .filter(|n| matches!(n.status, NodeStatus::Pending | NodeStatus::Blocked))
        .filter(|n| deps_committed(graph, n.id(), committed))
        .map(|n| n.id().to_string())
        .collect()
}

/// Whether every dependency of `id` has completed and been committed.
pub fn deps_committed(graph: &TaskGraph, id: &str, committed: &HashSet<NodeId>) -> bool {
    graph.dependencies_of(id).iter().all(|dep| {
        graph.status_of(dep) == Some(NodeStatus::Completed) && committed.contains(dep)
    })
}

/// First dependency of `id` that ended `Failed` or `Cancelled`, if any.
///
/// For a cancelled dependency the originating failure is returned, so a
/// cascade always points at the node that actually failed.
pub fn failed_dependency(graph: &TaskGraph, id: &str) -> Option<NodeId> {
    graph.dependencies_of(id).iter().find_map(|dep| {
        let node = graph.node(dep)?;
        match node.status {
            NodeStatus::Failed => Some(dep.clone()),
            NodeStatus::Cancelled => Some(node.cancelled_by.clone().unwrap_or_else(|| dep.clone())),
            _ => None,
        }
    })
}

/// Every transitive dependent of `failed` that is not yet terminal.
///
/// Dependencies are conjunctive (a node needs *all* of them), so no
/// dependent of a failed node has an alternative satisfied path.
pub fn cascade_targets(graph: &TaskGraph, failed: &str) -> Vec<NodeId> {
    let mut stack: Vec<NodeId> = graph.dependents_of(failed).to_vec();
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut targets = Vec::new();

    while let Some(id) = stack.pop() {
        if !visited.insert(id.clone()) {
            continue;
        }
        let Some(node) = graph.node(&id) else {
            continue;
        };
        if node.status.is_terminal() {
            continue;
        }
        targets.push(id.clone());
        stack.extend(graph.dependents_of(&id).iter().cloned());
    }

    // Report in topological order for stable logs and steps.
    let order: HashMap<&str, usize> = graph
        .topo_order()
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();
    targets.sort_by_key(|id| order.get(id.as_str()).copied().unwrap_or(usize::MAX));
    targets
}
