// src/dag/task_info.rs

//! Static task descriptions and per-run node state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::NodeFailure;
use crate::types::{NodeId, NodeStatus, WorkerId};

/// Static description of one unit of work.
///
/// This is what callers (or the config file) hand to the dependency
/// resolver. It never changes once a graph has been built from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: NodeId,
    /// Capability tag selecting the worker that executes this node.
    pub worker: WorkerId,
    pub description: String,
    /// Direct dependencies: nodes that must complete before this one runs.
    #[serde(default)]
    pub after: Vec<NodeId>,
    /// Per-node timeout; falls back to the engine default when `None`.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Per-node attempt budget; falls back to the retry policy when `None`.
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Whether the run fails if this node does not complete.
    #[serde(default)]
    pub required: bool,
}

impl TaskSpec {
    pub fn new(
        id: impl Into<NodeId>,
        worker: impl Into<WorkerId>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            worker: worker.into(),
            description: description.into(),
            after: Vec::new(),
            timeout: None,
            max_attempts: None,
            required: false,
        }
    }

    pub fn after(mut self, dep: impl Into<NodeId>) -> Self {
        self.after.push(dep.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }
}

/// A node of a task graph: its immutable spec plus mutable run state.
///
/// Only the status/result/bookkeeping fields change during a run. The
/// spec (and therefore the node's edges) is private and read-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskNode {
    spec: TaskSpec,
    pub status: NodeStatus,
    /// Result payload of the successful attempt.
    pub result: Option<Value>,
    /// Number of worker calls made so far.
    pub attempts: u32,
    pub last_error: Option<NodeFailure>,
    /// For cascade cancellations: the failed node that caused it.
    pub cancelled_by: Option<NodeId>,
    /// Ids of the knowledge advice forwarded to the worker.
    pub advice_ids: Vec<String>,
    pub ready_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskNode {
    pub fn new(spec: TaskSpec) -> Self {
        Self {
            spec,
            status: NodeStatus::Pending,
            result: None,
            attempts: 0,
            last_error: None,
            cancelled_by: None,
            advice_ids: Vec::new(),
            ready_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn worker(&self) -> &str {
        &self.spec.worker
    }

    pub fn spec(&self) -> &TaskSpec {
        &self.spec
    }

    /// Move to a terminal status, stamping the completion time.
    pub(crate) fn finish(&mut self, status: NodeStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }
}
