// src/exec/worker.rs

//! Pluggable worker abstraction.
//!
//! The executor pool talks to a [`Worker`] looked up by capability tag in a
//! [`WorkerRegistry`]. Production code registers [`super::CommandWorker`]s;
//! tests register scripted fakes that never spawn processes.
//!
//! Worker calls must be safe to repeat: a node that was running when a
//! checkpoint was taken is executed again on resume.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::dag::TaskGraph;
use crate::errors::{GraphValidationError, WorkerError};
use crate::knowledge::ForwardedAdvice;
use crate::state::{StateKey, StateView, StateWrite};
use crate::types::{NodeId, ThreadId, WorkerId};

pub type WorkerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<WorkerOutput, WorkerError>> + Send + 'a>>;

/// Everything a worker gets to see for one attempt.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub thread_id: ThreadId,
    pub node_id: NodeId,
    pub worker: WorkerId,
    pub description: String,
    /// Initial context the run was started with.
    pub context: Value,
    /// Shared state as committed when the node was dispatched.
    pub state: StateView,
    pub advice: Vec<ForwardedAdvice>,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// What a successful worker call produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerOutput {
    /// Result payload, committed under the node id.
    #[serde(default)]
    pub output: Value,
    /// Versioned scalar writes.
    #[serde(default)]
    pub writes: Vec<StateWrite>,
    /// Externally produced references (tickets, pull requests, ...).
    #[serde(default)]
    pub external_refs: Vec<String>,
    /// Deltas for additive counters.
    #[serde(default)]
    pub counters: BTreeMap<String, i64>,
    #[serde(default)]
    pub messages: Vec<String>,
}

impl WorkerOutput {
    pub fn new(output: Value) -> Self {
        Self {
            output,
            ..Self::default()
        }
    }

    pub fn write(mut self, key: StateKey, value: Value) -> Self {
        self.writes.push(StateWrite::new(key, value));
        self
    }

    pub fn external_ref(mut self, reference: impl Into<String>) -> Self {
        self.external_refs.push(reference.into());
        self
    }

    pub fn counter(mut self, name: impl Into<String>, delta: i64) -> Self {
        *self.counters.entry(name.into()).or_insert(0) += delta;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.messages.push(message.into());
        self
    }
}

/// A capability that can execute nodes.
///
/// `cancel` is advisory: it fires when the run is cancelled or the attempt
/// timed out. Whatever the worker returns afterwards is discarded.
pub trait Worker: Send + Sync {
    fn execute(&self, request: WorkerRequest, cancel: CancellationToken) -> WorkerFuture<'_>;
}

/// Workers keyed by capability tag.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<WorkerId, Arc<dyn Worker>>,
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tag: impl Into<WorkerId>, worker: Arc<dyn Worker>) {
        self.workers.insert(tag.into(), worker);
    }

    pub fn with(mut self, tag: impl Into<WorkerId>, worker: Arc<dyn Worker>) -> Self {
        self.register(tag, worker);
        self
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn Worker>> {
        self.workers.get(tag).cloned()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.workers.contains_key(tag)
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.workers.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Every node of `graph` must name a registered capability.
    pub fn check_graph(&self, graph: &TaskGraph) -> Result<(), GraphValidationError> {
        for id in graph.topo_order() {
            let Some(node) = graph.node(id) else { continue };
            if !self.contains(node.worker()) {
                return Err(GraphValidationError::UnknownWorker {
                    node: id.clone(),
                    worker: node.worker().to_string(),
                });
            }
        }
        Ok(())
    }
}
