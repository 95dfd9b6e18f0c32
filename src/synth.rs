// src/synth.rs

//! Synthesizer: merges the outputs of a finished run.
//!
//! Only writes made by nodes that ended `Completed` take part. A state key
//! written by more than one worker with differing values becomes a
//! [`Conflict`]; the merged value is the coordinator's when it is one of
//! the writers, otherwise the value committed last.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::dag::TaskGraph;
use crate::state::{SharedState, StateKey, WriteRecord, EXTERNAL_REFS_LIST};
use crate::types::{NodeId, NodeStatus, WorkerId};

/// Which worker has override authority, and in what order results are
/// presented.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisPolicy {
    #[serde(default)]
    pub coordinator: Option<WorkerId>,
    #[serde(default)]
    pub priority: Vec<WorkerId>,
}

impl SynthesisPolicy {
    pub fn with_coordinator(coordinator: impl Into<WorkerId>) -> Self {
        Self {
            coordinator: Some(coordinator.into()),
            priority: Vec::new(),
        }
    }

    /// Coordinator first, then the priority list, then everyone else.
    fn rank(&self, worker: &str) -> usize {
        if self.coordinator.as_deref() == Some(worker) {
            return 0;
        }
        self.priority
            .iter()
            .position(|w| w == worker)
            .map_or(usize::MAX, |p| p + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Coordinator,
    LatestCommit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub key: StateKey,
    /// Last value each worker committed to `key`.
    pub values_by_worker: BTreeMap<WorkerId, Value>,
    pub resolved: Value,
    pub resolution: Resolution,
}

/// One completed node's result, in presentation order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub node: NodeId,
    pub worker: WorkerId,
    pub output: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    /// `{ "state": {...}, "results": [...], "final": ..., "external_refs": [...], "counters": {...} }`
    pub merged: Value,
    pub conflicts: Vec<Conflict>,
}

pub fn synthesize(state: &SharedState, graph: &TaskGraph, policy: &SynthesisPolicy) -> Synthesis {
    let completed = |node: &str| graph.status_of(node) == Some(NodeStatus::Completed);

    let mut merged_state = Map::new();
    let mut conflicts = Vec::new();

    for (key, versioned) in state.scalars() {
        let surviving: Vec<&WriteRecord> = versioned
            .history
            .iter()
            .filter(|r| completed(&r.writer.node))
            .collect();
        let Some(latest) = surviving.iter().max_by_key(|r| r.seq) else {
            continue;
        };

        let mut by_worker: BTreeMap<WorkerId, (u64, Value)> = BTreeMap::new();
        for record in &surviving {
            let slot = by_worker
                .entry(record.writer.worker.clone())
                .or_insert((0, Value::Null));
            if record.seq >= slot.0 {
                *slot = (record.seq, record.value.clone());
            }
        }

        let coordinator_value = policy
            .coordinator
            .as_ref()
            .and_then(|c| by_worker.get(c))
            .map(|(_, v)| v.clone());
        let (resolved, resolution) = match coordinator_value {
            Some(v) => (v, Resolution::Coordinator),
            None => (latest.value.clone(), Resolution::LatestCommit),
        };

        let mut distinct: Vec<&Value> = Vec::new();
        for (_, v) in by_worker.values() {
            if !distinct.contains(&v) {
                distinct.push(v);
            }
        }
        if distinct.len() > 1 {
            debug!(key = %key, writers = by_worker.len(), ?resolution, "conflicting writes");
            conflicts.push(Conflict {
                key: key.clone(),
                values_by_worker: by_worker.into_iter().map(|(w, (_, v))| (w, v)).collect(),
                resolved: resolved.clone(),
                resolution,
            });
        }

        merged_state.insert(key.to_string(), resolved);
    }

    let mut results: Vec<(usize, u64, NodeOutput)> = state
        .results()
        .iter()
        .filter(|(node, _)| completed(node))
        .map(|(node, r)| {
            (
                policy.rank(&r.worker),
                r.seq,
                NodeOutput {
                    node: node.clone(),
                    worker: r.worker.clone(),
                    output: r.output.clone(),
                },
            )
        })
        .collect();
    results.sort_by_key(|(rank, seq, _)| (*rank, *seq));
    let results: Vec<NodeOutput> = results.into_iter().map(|(_, _, o)| o).collect();

    let final_output = graph
        .synthesis_node()
        .filter(|id| completed(id))
        .and_then(|id| state.results().get(id))
        .map(|r| r.output.clone())
        .unwrap_or(Value::Null);

    let external_refs: Vec<Value> = refs_of_completed(state, &completed);

    let merged = serde_json::json!({
        "state": Value::Object(merged_state),
        "results": results,
        "final": final_output,
        "external_refs": external_refs,
        "counters": state.counters(),
    });

    Synthesis { merged, conflicts }
}

fn refs_of_completed(state: &SharedState, completed: &dyn Fn(&str) -> bool) -> Vec<Value> {
    let mut seen: HashSet<String> = HashSet::new();
    state
        .list_values(EXTERNAL_REFS_LIST)
        .into_iter()
        .filter(|v| v.get("node").and_then(Value::as_str).is_some_and(|n| completed(n)))
        .filter_map(|v| v.get("ref").and_then(Value::as_str))
        .filter(|r| seen.insert(r.to_string()))
        .map(|r| Value::String(r.to_string()))
        .collect()
}
