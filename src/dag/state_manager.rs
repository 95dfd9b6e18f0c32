// src/dag/state_manager.rs

//! Status transitions for the nodes of one run.

use std::collections::HashSet;

use chrono::Utc;
use tracing::{debug, info};

use crate::dag::graph::TaskGraph;
use crate::dag::resolver::{cascade_targets, deps_committed, failed_dependency};
use crate::dag::scheduler_step::ScheduledTask;
use crate::types::{NodeId, NodeStatus};

/// Applies status transitions to a [`TaskGraph`].
pub struct StateManager<'a> {
    graph: &'a mut TaskGraph,
}

impl<'a> StateManager<'a> {
    pub fn new(graph: &'a mut TaskGraph) -> Self {
        Self { graph }
    }

    /// Re-evaluate every `Pending`/`Blocked` node.
    ///
    /// - a node with a failed or cancelled dependency is cancelled, pointing
    ///   at the originating failure
    /// - a node whose dependencies are all committed becomes `Ready`
    /// - anything else is `Blocked`
    ///
    /// Walks in topological order so a cancellation propagates through the
    /// whole downstream cone in one pass. Returns `(newly_ready, newly_cancelled)`.
    pub fn refresh_readiness(&mut self, committed: &HashSet<NodeId>) -> (Vec<NodeId>, Vec<NodeId>) {
        let mut ready = Vec::new();
        let mut cancelled = Vec::new();

        let order: Vec<NodeId> = self.graph.topo_order().to_vec();
        for id in order {
            let status = match self.graph.status_of(&id) {
                Some(s) => s,
                None => continue,
            };
            if !matches!(status, NodeStatus::Pending | NodeStatus::Blocked) {
                continue;
            }

            let origin = failed_dependency(self.graph, &id);
            let satisfied = deps_committed(self.graph, &id, committed);

            let Some(node) = self.graph.node_mut(&id) else {
                continue;
            };

            if let Some(origin) = origin {
                debug!(node = %id, origin = %origin, "dependency failed; cancelling node");
                node.cancelled_by = Some(origin);
                node.finish(NodeStatus::Cancelled);
                cancelled.push(id);
            } else if satisfied {
                debug!(node = %id, "dependencies committed; marking Ready");
                node.status = NodeStatus::Ready;
                node.ready_at = Some(Utc::now());
                ready.push(id);
            } else if status == NodeStatus::Pending {
                node.status = NodeStatus::Blocked;
            }
        }

        (ready, cancelled)
    }

    /// Cancel every transitive dependent of `failed`.
    pub fn cascade_cancel(&mut self, failed: &str) -> Vec<NodeId> {
        let targets = cascade_targets(self.graph, failed);

        for id in &targets {
            if let Some(node) = self.graph.node_mut(id) {
                node.cancelled_by = Some(failed.to_string());
                node.finish(NodeStatus::Cancelled);
            }
        }

        if !targets.is_empty() {
            info!(
                origin = %failed,
                cancelled = ?targets,
                "cascading cancellation to dependents of failed node"
            );
        }

        targets
    }

    /// Cancel every node that has not been dispatched yet.
    pub fn cancel_unstarted(&mut self) -> Vec<NodeId> {
        let order: Vec<NodeId> = self.graph.topo_order().to_vec();
        let mut cancelled = Vec::new();

        for id in order {
            if let Some(node) = self.graph.node_mut(&id) {
                if matches!(
                    node.status,
                    NodeStatus::Pending | NodeStatus::Blocked | NodeStatus::Ready
                ) {
                    node.finish(NodeStatus::Cancelled);
                    cancelled.push(id);
                }
            }
        }

        cancelled
    }

    /// Take up to `limit` `Ready` nodes (topological order), mark them
    /// `Running` and return them as [`ScheduledTask`]s.
    pub fn collect_dispatchable(&mut self, thread_id: &str, limit: usize) -> Vec<ScheduledTask> {
        let candidates: Vec<NodeId> = self
            .graph
            .topo_order()
            .iter()
            .filter(|id| self.graph.status_of(id) == Some(NodeStatus::Ready))
            .take(limit)
            .cloned()
            .collect();

        let mut scheduled = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(node) = self.graph.node_mut(&id) {
                node.status = NodeStatus::Running;
                if node.started_at.is_none() {
                    node.started_at = Some(Utc::now());
                }
                debug!(node = %id, prior_attempts = node.attempts, "marking Running");
                scheduled.push(ScheduledTask {
                    thread_id: thread_id.to_string(),
                    spec: node.spec().clone(),
                    prior_attempts: node.attempts,
                });
            }
        }

        scheduled
    }

    /// Whether no node is Pending, Blocked, Ready or Running.
    pub fn all_terminal(&self) -> bool {
        self.graph.nodes().all(|n| n.status.is_terminal())
    }
}
