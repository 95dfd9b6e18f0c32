// src/dag/scheduler.rs

use std::collections::HashSet;

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::dag::graph::TaskGraph;
use crate::dag::scheduler_step::{ScheduledTask, SchedulerStep};
use crate::dag::state_manager::StateManager;
use crate::dag::task_info::TaskNode;
use crate::errors::{FailureKind, NodeFailure};
use crate::types::{NodeId, NodeStatus, RunPhase, ThreadId};

/// Scheduler holds the immutable graph plus the mutable per-run state.
///
/// It is purely synchronous and performs no IO. It is responsible for:
/// - the run-level phase machine (Initializing → Running → terminal)
/// - deciding which nodes are ready, given the committed set from the
///   shared state store
/// - marking nodes completed/failed and cascading cancellation
/// - run-level cancellation (Draining)
///
/// The async tick loop in [`crate::engine::Runtime`] drives it.
#[derive(Debug)]
pub struct Scheduler {
    thread_id: ThreadId,
    graph: TaskGraph,
    phase: RunPhase,
}

impl Scheduler {
    pub fn new(thread_id: impl Into<ThreadId>, graph: TaskGraph) -> Self {
        Self {
            thread_id: thread_id.into(),
            graph,
            phase: RunPhase::Initializing,
        }
    }

    /// Rebuild a scheduler from a checkpointed status vector.
    ///
    /// Nodes that were `Running` when the checkpoint was taken are reset to
    /// `Ready` and will be dispatched again. Completed nodes keep their
    /// status and result and are never re-executed.
    pub fn restore(
        thread_id: impl Into<ThreadId>,
        mut graph: TaskGraph,
        nodes: &[TaskNode],
        phase: RunPhase,
    ) -> Self {
        for saved in nodes {
            let Some(node) = graph.node_mut(saved.id()) else {
                warn!(node = %saved.id(), "checkpointed node missing from graph; ignoring");
                continue;
            };

            *node = saved.clone();
            if node.status == NodeStatus::Running {
                debug!(node = %saved.id(), "node was running at checkpoint; resetting to Ready");
                node.status = NodeStatus::Ready;
            }
        }

        let phase = match phase {
            // The cancellation was already acknowledged; finish it.
            RunPhase::Draining => {
                StateManager::new(&mut graph).cancel_unstarted();
                RunPhase::Cancelled
            }
            p if p.is_terminal() && p != RunPhase::FailedPendingRetry => p,
            // Interrupted or halted runs start over from the restored state.
            _ => RunPhase::Initializing,
        };

        Self {
            thread_id: thread_id.into(),
            graph,
            phase,
        }
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn graph(&self) -> &TaskGraph {
        &self.graph
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Snapshot of every node, in declaration order.
    pub fn status_vector(&self) -> Vec<TaskNode> {
        self.graph.nodes().cloned().collect()
    }

    /// Number of nodes currently handed to the executor.
    pub fn in_flight(&self) -> usize {
        self.graph
            .nodes()
            .filter(|n| n.status == NodeStatus::Running)
            .count()
    }

    /// Fraction of nodes that reached a terminal status.
    pub fn progress(&self) -> f64 {
        if self.graph.is_empty() {
            return 1.0;
        }
        let done = self.graph.nodes().filter(|n| n.status.is_terminal()).count();
        done as f64 / self.graph.len() as f64
    }

    /// Leave `Initializing`. Idempotent.
    pub fn start(&mut self) {
        if self.phase == RunPhase::Initializing {
            info!(thread = %self.thread_id, nodes = self.graph.len(), "run started");
            self.phase = RunPhase::Running;
        }
    }

    /// Recompute readiness (including cascades) from the committed set.
    pub fn step_refresh(&mut self, committed: &HashSet<NodeId>) -> SchedulerStep {
        let mut manager = StateManager::new(&mut self.graph);
        let (newly_ready, newly_cancelled) = manager.refresh_readiness(committed);
        let run_settled = manager.all_terminal();

        SchedulerStep {
            newly_ready,
            newly_cancelled,
            run_settled,
            ..SchedulerStep::default()
        }
    }

    /// Hand out up to `limit` ready nodes. Nothing is dispatched unless the
    /// run is in the `Running` phase.
    pub fn dispatch(&mut self, limit: usize) -> Vec<ScheduledTask> {
        if self.phase != RunPhase::Running || limit == 0 {
            return Vec::new();
        }
        let mut manager = StateManager::new(&mut self.graph);
        manager.collect_dispatchable(&self.thread_id, limit)
    }

    /// Remember which advice was forwarded to a node's worker.
    pub fn record_advice(&mut self, node: &str, advice_ids: Vec<String>) {
        if let Some(info) = self.graph.node_mut(node) {
            info.advice_ids = advice_ids;
        }
    }

    /// Record a failed attempt that is going to be retried.
    pub fn record_attempt(&mut self, node: &str, attempts: u32, failure: NodeFailure) {
        match self.graph.node_mut(node) {
            Some(info) => {
                debug!(node = %node, attempts, error = %failure, "attempt failed; retry pending");
                info.attempts = attempts;
                info.last_error = Some(failure);
            }
            None => warn!(node = %node, "attempt report for unknown node; ignoring"),
        }
    }

    /// Mark a node completed after its result has been committed.
    pub fn step_completion(&mut self, node: &str, result: Value, attempts: u32) -> SchedulerStep {
        let mut step = SchedulerStep::default();

        match self.graph.node_mut(node) {
            Some(info) if info.status == NodeStatus::Running => {
                info.result = Some(result);
                info.attempts = attempts;
                info.finish(NodeStatus::Completed);
                debug!(node = %node, attempts, "node completed");
                step.newly_completed.push(node.to_string());
            }
            Some(info) => {
                warn!(node = %node, status = %info.status, "completion for node that is not running; ignoring");
            }
            None => warn!(node = %node, "completion for unknown node; ignoring"),
        }

        step.run_settled = StateManager::new(&mut self.graph).all_terminal();
        step
    }

    /// Permanently fail a node and cancel its transitive dependents.
    pub fn step_failure(&mut self, node: &str, failure: NodeFailure, attempts: u32) -> SchedulerStep {
        let mut step = SchedulerStep::default();

        match self.graph.node_mut(node) {
            Some(info) if !info.status.is_terminal() => {
                warn!(
                    node = %node,
                    attempts,
                    error = %failure,
                    "node failed permanently"
                );
                info.attempts = attempts;
                info.last_error = Some(failure);
                info.finish(NodeStatus::Failed);
                step.newly_failed.push(node.to_string());

                let mut manager = StateManager::new(&mut self.graph);
                step.newly_cancelled = manager.cascade_cancel(node);
            }
            Some(_) => debug!(node = %node, "failure for terminal node; ignoring"),
            None => warn!(node = %node, "failure for unknown node; ignoring"),
        }

        step.run_settled = StateManager::new(&mut self.graph).all_terminal();
        step
    }

    /// Run-level cancellation: enter `Draining` and cancel every node that
    /// has not been dispatched. Running nodes are settled one by one via
    /// [`Scheduler::step_abandoned`] as the executor reports back.
    pub fn step_cancel(&mut self) -> SchedulerStep {
        if self.phase.is_terminal() || self.phase == RunPhase::Draining {
            return SchedulerStep {
                run_settled: StateManager::new(&mut self.graph).all_terminal(),
                ..SchedulerStep::default()
            };
        }

        info!(thread = %self.thread_id, in_flight = self.in_flight(), "cancellation requested; draining");
        self.phase = RunPhase::Draining;

        let mut manager = StateManager::new(&mut self.graph);
        let newly_cancelled = manager.cancel_unstarted();
        let run_settled = manager.all_terminal();

        SchedulerStep {
            newly_cancelled,
            run_settled,
            ..SchedulerStep::default()
        }
    }

    /// Settle an in-flight node whose result is being discarded.
    pub fn step_abandoned(&mut self, node: &str, attempts: u32) -> SchedulerStep {
        let mut step = SchedulerStep::default();

        if let Some(info) = self.graph.node_mut(node) {
            if info.status == NodeStatus::Running {
                info.attempts = attempts;
                info.last_error = Some(NodeFailure::new(
                    FailureKind::Cancelled,
                    "run cancelled while node was in flight",
                ));
                info.finish(NodeStatus::Cancelled);
                step.newly_cancelled.push(node.to_string());
            }
        }

        step.run_settled = StateManager::new(&mut self.graph).all_terminal();
        step
    }

    /// Cancel whatever is left when no progress is possible any more.
    pub fn step_stalled(&mut self) -> SchedulerStep {
        let mut manager = StateManager::new(&mut self.graph);
        let newly_cancelled = manager.cancel_unstarted();
        if !newly_cancelled.is_empty() {
            warn!(
                thread = %self.thread_id,
                stalled = ?newly_cancelled,
                "no node can make progress; cancelling the remainder"
            );
        }
        SchedulerStep {
            newly_cancelled,
            run_settled: manager.all_terminal(),
            ..SchedulerStep::default()
        }
    }

    /// Halt after a persistence failure. The run can be resumed later.
    pub fn halt(&mut self) {
        warn!(thread = %self.thread_id, "run halted; pending retry from last checkpoint");
        self.phase = RunPhase::FailedPendingRetry;
    }

    /// If every node is terminal, move the run to its terminal phase and
    /// return it.
    pub fn maybe_finish(&mut self) -> Option<RunPhase> {
        if self.phase.is_terminal() {
            return Some(self.phase);
        }
        if !StateManager::new(&mut self.graph).all_terminal() {
            return None;
        }

        let phase = if self.phase == RunPhase::Draining {
            RunPhase::Cancelled
        } else if self.graph.required_nodes().iter().all(|id| {
            self.graph.status_of(id) == Some(NodeStatus::Completed)
        }) {
            RunPhase::Completed
        } else {
            RunPhase::Failed
        };

        info!(thread = %self.thread_id, %phase, "run finished");
        self.phase = phase;
        Some(phase)
    }
}
