// src/checkpoint/record.rs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dag::{resolver, TaskGraph, TaskNode, TaskSpec};
use crate::errors::GraphValidationError;
use crate::state::SharedState;
use crate::types::{NodeId, RunPhase, ThreadId};

/// Immutable snapshot of one run.
///
/// Holds everything needed to rebuild the scheduler without replaying
/// earlier ticks: the full node status vector (which embeds each node's
/// spec, so the graph can be re-validated), the full shared state and the
/// run phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: ThreadId,
    /// Strictly increasing per thread.
    pub sequence: u64,
    /// Shared-state sequence counter at snapshot time.
    pub state_sequence: u64,
    pub phase: RunPhase,
    pub description: String,
    #[serde(default)]
    pub context: Value,
    #[serde(default)]
    pub synthesis: Option<NodeId>,
    pub nodes: Vec<TaskNode>,
    pub state: SharedState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Task specs in declaration order.
    pub fn specs(&self) -> Vec<TaskSpec> {
        self.nodes.iter().map(|n| n.spec().clone()).collect()
    }

    /// Re-validate the checkpointed graph structure.
    pub fn graph(&self) -> Result<TaskGraph, GraphValidationError> {
        resolver::build(self.specs(), self.synthesis.clone())
    }
}
