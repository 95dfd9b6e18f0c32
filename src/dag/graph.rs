// src/dag/graph.rs

use std::collections::HashMap;

use crate::dag::task_info::TaskNode;
use crate::types::{NodeId, NodeStatus};

/// Adjacency for one node: immediate dependencies and dependents.
#[derive(Debug, Clone, Default)]
pub(crate) struct Edges {
    pub(crate) deps: Vec<NodeId>,
    pub(crate) dependents: Vec<NodeId>,
}

/// Validated task graph owned by a single run.
///
/// Construct it through [`crate::dag::resolver::build`], which guarantees
/// that every dependency exists and that the graph is acyclic. Edges are
/// fixed at construction; only node status fields change afterwards.
#[derive(Debug, Clone)]
pub struct TaskGraph {
    nodes: Vec<TaskNode>,
    position: HashMap<NodeId, usize>,
    edges: HashMap<NodeId, Edges>,
    topo_order: Vec<NodeId>,
    synthesis: Option<NodeId>,
}

impl TaskGraph {
    pub(crate) fn from_parts(
        nodes: Vec<TaskNode>,
        edges: HashMap<NodeId, Edges>,
        topo_order: Vec<NodeId>,
        synthesis: Option<NodeId>,
    ) -> Self {
        let position = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id().to_string(), i))
            .collect();

        Self {
            nodes,
            position,
            edges,
            topo_order,
            synthesis,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskNode> {
        self.nodes.iter()
    }

    pub fn node(&self, id: &str) -> Option<&TaskNode> {
        self.position.get(id).map(|&i| &self.nodes[i])
    }

    pub fn node_mut(&mut self, id: &str) -> Option<&mut TaskNode> {
        match self.position.get(id) {
            Some(&i) => self.nodes.get_mut(i),
            None => None,
        }
    }

    pub fn status_of(&self, id: &str) -> Option<NodeStatus> {
        self.node(id).map(|n| n.status)
    }

    /// Node ids in a topological order (dependencies first).
    pub fn topo_order(&self) -> &[NodeId] {
        &self.topo_order
    }

    /// The designated synthesis node, if any.
    pub fn synthesis_node(&self) -> Option<&str> {
        self.synthesis.as_deref()
    }

    /// Immediate dependencies of a node.
    pub fn dependencies_of(&self, id: &str) -> &[NodeId] {
        self.edges
            .get(id)
            .map(|e| e.deps.as_slice())
            .unwrap_or(&[])
    }

    /// Immediate dependents of a node (reverse-edge index).
    pub fn dependents_of(&self, id: &str) -> &[NodeId] {
        self.edges
            .get(id)
            .map(|e| e.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Nodes whose failure makes the run fail.
    ///
    /// The synthesis node is always required. When no node is flagged
    /// `required` and there is no synthesis node, every node is required.
    pub fn required_nodes(&self) -> Vec<&str> {
        let flagged: Vec<&str> = self
            .nodes
            .iter()
            .filter(|n| n.spec().required || Some(n.id()) == self.synthesis_node())
            .map(|n| n.id())
            .collect();

        if flagged.is_empty() {
            self.nodes.iter().map(|n| n.id()).collect()
        } else {
            flagged
        }
    }
}
