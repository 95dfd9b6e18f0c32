// src/dag/scheduler_step.rs

//! Step-by-step result types for the scheduler.

use crate::dag::task_info::TaskSpec;
use crate::types::{NodeId, ThreadId};

/// Structured result of a single scheduler "step".
///
/// Tests use it to drive the graph by hand and assert on what changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStep {
    /// Nodes whose dependencies became satisfied in this step.
    pub newly_ready: Vec<NodeId>,
    pub newly_completed: Vec<NodeId>,
    /// Nodes that were permanently failed in this step.
    pub newly_failed: Vec<NodeId>,
    /// Nodes cancelled in this step, either by cascade or by a run-level
    /// cancellation.
    pub newly_cancelled: Vec<NodeId>,
    /// Whether every node is now terminal.
    pub run_settled: bool,
}

impl SchedulerStep {
    pub fn merge(&mut self, other: SchedulerStep) {
        self.newly_ready.extend(other.newly_ready);
        self.newly_completed.extend(other.newly_completed);
        self.newly_failed.extend(other.newly_failed);
        self.newly_cancelled.extend(other.newly_cancelled);
        self.run_settled = other.run_settled;
    }

    /// Whether the step changed any node status.
    pub fn changed(&self) -> bool {
        !(self.newly_ready.is_empty()
            && self.newly_completed.is_empty()
            && self.newly_failed.is_empty()
            && self.newly_cancelled.is_empty())
    }
}

/// A node the scheduler wants the executor pool to run now.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub thread_id: ThreadId,
    pub spec: TaskSpec,
    /// Worker calls already made for this node (non-zero after a resume).
    pub prior_attempts: u32,
}
