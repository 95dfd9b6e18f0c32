// src/engine/report.rs

//! What the control surface shows about a run.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::checkpoint::Checkpoint;
use crate::dag::{Scheduler, TaskNode};
use crate::errors::NodeFailure;
use crate::state::{SharedState, MESSAGES_LIST};
use crate::synth::Synthesis;
use crate::types::{NodeId, NodeStatus, RunPhase, ThreadId, WorkerId};

/// Number of trailing log messages included in a report.
const REPORT_MESSAGES: usize = 10;

/// Per-node line of a status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub worker: WorkerId,
    pub status: NodeStatus,
    pub attempts: u32,
    pub last_error: Option<NodeFailure>,
    pub cancelled_by: Option<NodeId>,
    pub advice_ids: Vec<String>,
}

impl From<&TaskNode> for NodeSummary {
    fn from(node: &TaskNode) -> Self {
        Self {
            id: node.id().to_string(),
            worker: node.worker().to_string(),
            status: node.status,
            attempts: node.attempts,
            last_error: node.last_error.clone(),
            cancelled_by: node.cancelled_by.clone(),
            advice_ids: node.advice_ids.clone(),
        }
    }
}

/// Live status of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub thread_id: ThreadId,
    pub phase: RunPhase,
    pub nodes: Vec<NodeSummary>,
    /// Fraction of nodes in a terminal status.
    pub progress: f64,
}

impl RunStatus {
    pub fn from_scheduler(scheduler: &Scheduler) -> Self {
        Self {
            thread_id: scheduler.thread_id().to_string(),
            phase: scheduler.phase(),
            nodes: scheduler.graph().nodes().map(NodeSummary::from).collect(),
            progress: scheduler.progress(),
        }
    }

    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        let total = checkpoint.nodes.len();
        let done = checkpoint
            .nodes
            .iter()
            .filter(|n| n.status.is_terminal())
            .count();
        Self {
            thread_id: checkpoint.thread_id.clone(),
            phase: checkpoint.phase,
            nodes: checkpoint.nodes.iter().map(NodeSummary::from).collect(),
            progress: if total == 0 {
                1.0
            } else {
                done as f64 / total as f64
            },
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeSummary> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// Final account of a run.
///
/// Partial results of completed nodes stay available in `state` even when
/// the run failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub thread_id: ThreadId,
    pub phase: RunPhase,
    pub nodes: Vec<NodeSummary>,
    pub synthesis: Synthesis,
    pub counters: BTreeMap<String, i64>,
    pub messages: Vec<String>,
    pub state: SharedState,
}

impl RunReport {
    pub fn new(status: RunStatus, state: SharedState, synthesis: Synthesis) -> Self {
        let messages = state.list_strings(MESSAGES_LIST);
        let skip = messages.len().saturating_sub(REPORT_MESSAGES);
        Self {
            thread_id: status.thread_id,
            phase: status.phase,
            nodes: status.nodes,
            synthesis,
            counters: state.counters().clone(),
            messages: messages.into_iter().skip(skip).collect(),
            state,
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeSummary> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn status_of(&self, id: &str) -> Option<NodeStatus> {
        self.node(id).map(|n| n.status)
    }

    /// Nodes that ended `Failed` or `Cancelled`.
    pub fn unsuccessful(&self) -> impl Iterator<Item = &NodeSummary> {
        self.nodes
            .iter()
            .filter(|n| matches!(n.status, NodeStatus::Failed | NodeStatus::Cancelled))
    }

    /// Human-readable summary.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "run {} finished: {}", self.thread_id, self.phase);
        let _ = writeln!(out);

        let _ = writeln!(out, "nodes ({}):", self.nodes.len());
        for node in &self.nodes {
            let _ = write!(
                out,
                "  - {:<20} {:<10} {:<10} attempts={}",
                node.id, node.worker, node.status, node.attempts
            );
            if let Some(origin) = &node.cancelled_by {
                let _ = write!(out, " cancelled_by={origin}");
            }
            if let Some(err) = &node.last_error {
                let _ = write!(out, " error=\"{err}\"");
            }
            let _ = writeln!(out);
        }

        let refs: Vec<&str> = self.synthesis.merged["external_refs"]
            .as_array()
            .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        if !refs.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "external refs:");
            for r in refs {
                let _ = writeln!(out, "  - {r}");
            }
        }

        if !self.counters.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "counters:");
            for (name, value) in &self.counters {
                let _ = writeln!(out, "  {name} = {value}");
            }
        }

        if !self.synthesis.conflicts.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "conflicts ({}):", self.synthesis.conflicts.len());
            for conflict in &self.synthesis.conflicts {
                let _ = writeln!(out, "  {} -> {}", conflict.key, conflict.resolved);
                for (worker, value) in &conflict.values_by_worker {
                    let _ = writeln!(out, "      {worker}: {value}");
                }
            }
        }

        if !self.messages.is_empty() {
            let _ = writeln!(out);
            let _ = writeln!(out, "recent messages:");
            for msg in &self.messages {
                let _ = writeln!(out, "  {msg}");
            }
        }

        out
    }
}
