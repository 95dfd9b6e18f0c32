// src/state/shared.rs

//! Plain-data shared state of one run.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::StateError;
use crate::state::key::StateKey;
use crate::state::COMPLETED_LIST;
use crate::types::{NodeId, WorkerId};

/// Who is performing a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Writer {
    pub worker: WorkerId,
    pub node: NodeId,
}

impl Writer {
    pub fn new(worker: impl Into<WorkerId>, node: impl Into<NodeId>) -> Self {
        Self {
            worker: worker.into(),
            node: node.into(),
        }
    }
}

/// One committed write to a scalar key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRecord {
    pub writer: Writer,
    pub value: Value,
    /// Global sequence number of the commit.
    pub seq: u64,
}

/// Current value of a scalar key plus every write that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedValue {
    pub value: Value,
    /// Number of committed writes to this key (0 = never written).
    pub version: u64,
    pub history: Vec<WriteRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListEntry {
    pub value: Value,
    pub seq: u64,
}

/// Result payload committed by a completed node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub worker: WorkerId,
    pub output: Value,
    pub seq: u64,
}

/// Versioned key/value state, append-only lists, additive counters and
/// per-node results.
///
/// - scalars: last-committed-wins guarded by an expected-version check
/// - lists and counters: commutative, never version-checked
///
/// Every successful write bumps the global `sequence`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SharedState {
    sequence: u64,
    scalars: BTreeMap<StateKey, VersionedValue>,
    lists: BTreeMap<String, Vec<ListEntry>>,
    counters: BTreeMap<String, i64>,
    results: BTreeMap<NodeId, NodeResult>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Global sequence counter (number of successful writes).
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn get(&self, key: &StateKey) -> Option<(&Value, u64)> {
        self.scalars.get(key).map(|v| (&v.value, v.version))
    }

    /// Current version of `key`; 0 when it was never written.
    pub fn version(&self, key: &StateKey) -> u64 {
        self.scalars.get(key).map(|v| v.version).unwrap_or(0)
    }

    /// Write `value` if the key is still at `expected` version.
    ///
    /// Returns the new version.
    pub fn compare_and_set(
        &mut self,
        key: &StateKey,
        expected: u64,
        value: Value,
        writer: &Writer,
    ) -> Result<u64, StateError> {
        let actual = self.version(key);
        if actual != expected {
            return Err(StateError::VersionConflict {
                key: key.to_string(),
                expected,
                actual,
            });
        }

        let seq = self.bump();
        let record = WriteRecord {
            writer: writer.clone(),
            value: value.clone(),
            seq,
        };

        let entry = self
            .scalars
            .entry(key.clone())
            .or_insert_with(|| VersionedValue {
                value: Value::Null,
                version: 0,
                history: Vec::new(),
            });
        entry.value = value;
        entry.version += 1;
        entry.history.push(record);

        Ok(entry.version)
    }

    /// Append to a list field. Always succeeds; order is commit order.
    pub fn append(&mut self, list: &str, value: Value) -> u64 {
        let seq = self.bump();
        self.lists
            .entry(list.to_string())
            .or_default()
            .push(ListEntry { value, seq });
        seq
    }

    /// Add `delta` to a counter and return the new total.
    pub fn increment(&mut self, counter: &str, delta: i64) -> i64 {
        self.bump();
        let total = self.counters.entry(counter.to_string()).or_insert(0);
        *total = total.saturating_add(delta);
        *total
    }

    pub fn record_result(&mut self, node: &str, worker: &str, output: Value) -> u64 {
        let seq = self.bump();
        self.results.insert(
            node.to_string(),
            NodeResult {
                worker: worker.to_string(),
                output,
                seq,
            },
        );
        seq
    }

    pub fn list(&self, list: &str) -> &[ListEntry] {
        self.lists.get(list).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Values of a list, in commit order.
    pub fn list_values(&self, list: &str) -> Vec<&Value> {
        self.list(list).iter().map(|e| &e.value).collect()
    }

    /// String entries of a list (non-string entries are skipped).
    pub fn list_strings(&self, list: &str) -> Vec<String> {
        self.list(list)
            .iter()
            .filter_map(|e| e.value.as_str().map(str::to_string))
            .collect()
    }

    pub fn counter(&self, counter: &str) -> i64 {
        self.counters.get(counter).copied().unwrap_or(0)
    }

    pub fn counters(&self) -> &BTreeMap<String, i64> {
        &self.counters
    }

    pub fn scalars(&self) -> &BTreeMap<StateKey, VersionedValue> {
        &self.scalars
    }

    pub fn results(&self) -> &BTreeMap<NodeId, NodeResult> {
        &self.results
    }

    /// Nodes whose completion has been committed.
    pub fn completed_nodes(&self) -> HashSet<NodeId> {
        self.list_strings(COMPLETED_LIST).into_iter().collect()
    }

    fn bump(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }
}
