// src/types.rs

//! Shared vocabulary types used across the engine.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identifier of a node in a task graph.
pub type NodeId = String;

/// Capability tag of a worker (e.g. `"architect"`, `"backend"`).
pub type WorkerId = String;

/// Identifier of one orchestration run.
pub type ThreadId = String;

/// Lifecycle status of a single node.
///
/// `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Not yet evaluated by the readiness pass.
    Pending,
    /// Waiting on at least one dependency that has not completed.
    Blocked,
    /// All dependencies committed; waiting for a free executor slot.
    Ready,
    /// Handed to the executor pool.
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            NodeStatus::Completed | NodeStatus::Failed | NodeStatus::Cancelled
        )
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Blocked => "blocked",
            NodeStatus::Ready => "ready",
            NodeStatus::Running => "running",
            NodeStatus::Completed => "completed",
            NodeStatus::Failed => "failed",
            NodeStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Phase of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    /// Graph validated, nothing dispatched yet.
    Initializing,
    Running,
    /// Cancellation requested; waiting for in-flight work to settle.
    Draining,
    Completed,
    /// At least one required node ended Failed or Cancelled.
    Failed,
    Cancelled,
    /// A checkpoint write failed; the run halted and can be resumed from
    /// the last good checkpoint.
    FailedPendingRetry,
}

impl RunPhase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunPhase::Completed
                | RunPhase::Failed
                | RunPhase::Cancelled
                | RunPhase::FailedPendingRetry
        )
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunPhase::Initializing => "initializing",
            RunPhase::Running => "running",
            RunPhase::Draining => "draining",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
            RunPhase::Cancelled => "cancelled",
            RunPhase::FailedPendingRetry => "failed (pending retry)",
        };
        f.write_str(s)
    }
}

/// Parse a duration string such as `"250ms"`, `"3s"`, `"2m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' is missing a unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{num_part}': {e}"))?;

    match unit_part.trim().to_lowercase().as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(value.saturating_mul(3600))),
        other => Err(format!(
            "unsupported duration unit '{other}'; expected ms, s, m, or h"
        )),
    }
}
