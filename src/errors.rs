// src/errors.rs

//! Crate-wide error types.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{NodeId, ThreadId, WorkerId};

/// Structural problems found while building a task graph.
///
/// Always fatal and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphValidationError {
    #[error("task graph has no nodes")]
    Empty,

    #[error("duplicate node id '{0}'")]
    DuplicateNode(NodeId),

    #[error("node '{node}' depends on unknown node '{dependency}'")]
    DanglingDependency { node: NodeId, dependency: NodeId },

    #[error("node '{0}' cannot depend on itself")]
    SelfDependency(NodeId),

    #[error("cycle detected in task graph involving nodes {}", .nodes.join(", "))]
    Cycle { nodes: Vec<NodeId> },

    #[error("node '{node}' requires worker '{worker}' but none is registered")]
    UnknownWorker { node: NodeId, worker: WorkerId },

    #[error("synthesis node '{0}' is not part of the graph")]
    UnknownSynthesisNode(NodeId),
}

/// Errors raised by the shared state store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("version conflict on '{key}': expected {expected}, found {actual}")]
    VersionConflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("state contention on '{key}': gave up after {attempts} compare-and-set attempts")]
    Contention { key: String, attempts: u32 },

    #[error("invalid state key '{0}': expected '<namespace>/<field>'")]
    InvalidKey(String),
}

/// Checkpoint persistence failures.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("checkpoint storage error: {0:#}")]
    Io(anyhow::Error),

    #[error("checkpoint codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("checkpoint for thread '{thread}' is corrupt: {reason}")]
    Corrupt { thread: ThreadId, reason: String },

    #[error("checkpoint sequence for thread '{thread}' went backwards ({last} -> {attempted})")]
    NonMonotonic {
        thread: ThreadId,
        last: u64,
        attempted: u64,
    },
}

/// Why a node attempt (or the node as a whole) failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker call returned an error.
    Execution,
    /// The worker call did not finish within its timeout.
    Timeout,
    /// Committing the node's writes kept losing compare-and-set races.
    StateContention,
    /// The run was cancelled while the node was in flight.
    Cancelled,
}

impl FailureKind {
    /// Whether another attempt may be made after this failure.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Execution | FailureKind::Timeout)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Execution => "execution error",
            FailureKind::Timeout => "timeout",
            FailureKind::StateContention => "state contention",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Node-level failure recorded on a node.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct NodeFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl NodeFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Error returned by a worker call.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("{0}")]
    Failed(String),

    #[error("worker observed cancellation")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WorkerError {
    pub fn failed(message: impl Into<String>) -> Self {
        WorkerError::Failed(message.into())
    }
}

#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Graph validation error: {0}")]
    Graph(#[from] GraphValidationError),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Thread not found: {0}")]
    ThreadNotFound(ThreadId),

    #[error("Thread '{0}' is already running")]
    AlreadyRunning(ThreadId),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, ConductorError>;
