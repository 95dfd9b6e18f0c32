// src/state/store.rs

//! Concurrent handle over the shared state of one run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::StateError;
use crate::state::key::StateKey;
use crate::state::shared::{SharedState, Writer};
use crate::state::{COMPLETED_LIST, EXTERNAL_REFS_LIST, FAILED_LIST, MESSAGES_LIST};
use crate::types::{NodeId, WorkerId};

/// Default number of compare-and-set attempts before giving up.
pub const DEFAULT_CAS_ATTEMPTS: u32 = 5;

/// A scalar write requested by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateWrite {
    pub key: StateKey,
    pub value: Value,
    /// Version the writer based its value on. When `None`, the version in
    /// the view handed to the worker is used.
    #[serde(default)]
    pub expected_version: Option<u64>,
}

impl StateWrite {
    pub fn new(key: StateKey, value: Value) -> Self {
        Self {
            key,
            value,
            expected_version: None,
        }
    }
}

/// Everything a completed node contributes to shared state.
#[derive(Debug, Clone, Default)]
pub struct NodeCommit {
    pub node: NodeId,
    pub worker: WorkerId,
    pub output: Value,
    pub writes: Vec<StateWrite>,
    pub external_refs: Vec<String>,
    pub counters: BTreeMap<String, i64>,
    pub messages: Vec<String>,
}

/// Read-only snapshot handed to workers.
#[derive(Debug, Clone, Default)]
pub struct StateView {
    inner: Arc<SharedState>,
}

impl StateView {
    pub fn new(state: SharedState) -> Self {
        Self {
            inner: Arc::new(state),
        }
    }

    pub fn get(&self, key: &StateKey) -> Option<&Value> {
        self.inner.get(key).map(|(v, _)| v)
    }

    pub fn version(&self, key: &StateKey) -> u64 {
        self.inner.version(key)
    }

    pub fn sequence(&self) -> u64 {
        self.inner.sequence()
    }

    pub fn state(&self) -> &SharedState {
        &self.inner
    }
}

/// Cloneable, thread-safe store around a [`SharedState`].
///
/// Single-key operations hold the lock for one map update. Writers to
/// the same key race through [`StateStore::commit_with_retry`].
/// [`StateStore::commit_node`] holds it for the whole node commit.
#[derive(Debug, Clone)]
pub struct StateStore {
    inner: Arc<Mutex<SharedState>>,
    max_cas_attempts: u32,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self::from_state(SharedState::new())
    }

    pub fn from_state(state: SharedState) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
            max_cas_attempts: DEFAULT_CAS_ATTEMPTS,
        }
    }

    pub fn with_max_cas_attempts(mut self, attempts: u32) -> Self {
        self.max_cas_attempts = attempts.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &StateKey) -> Option<(Value, u64)> {
        self.lock().get(key).map(|(v, ver)| (v.clone(), ver))
    }

    pub fn compare_and_set(
        &self,
        key: &StateKey,
        expected: u64,
        value: Value,
        writer: &Writer,
    ) -> Result<u64, StateError> {
        self.lock().compare_and_set(key, expected, value, writer)
    }

    pub fn append(&self, list: &str, value: Value) -> u64 {
        self.lock().append(list, value)
    }

    pub fn increment(&self, counter: &str, delta: i64) -> i64 {
        self.lock().increment(counter, delta)
    }

    pub fn sequence(&self) -> u64 {
        self.lock().sequence()
    }

    /// Deep copy of the current state.
    pub fn snapshot(&self) -> SharedState {
        self.lock().clone()
    }

    pub fn view(&self) -> StateView {
        StateView::new(self.snapshot())
    }

    pub fn completed_nodes(&self) -> HashSet<NodeId> {
        self.lock().completed_nodes()
    }

    /// Compare-and-set with bounded retries.
    ///
    /// On a version conflict the write is retried against the refreshed
    /// version. After `max_cas_attempts` lost races the write is abandoned
    /// with [`StateError::Contention`].
    pub fn commit_with_retry(
        &self,
        key: &StateKey,
        expected: u64,
        value: Value,
        writer: &Writer,
    ) -> Result<u64, StateError> {
        let mut expected = expected;

        for attempt in 1..=self.max_cas_attempts {
            match self.compare_and_set(key, expected, value.clone(), writer) {
                Ok(version) => return Ok(version),
                Err(StateError::VersionConflict { actual, .. }) => {
                    debug!(
                        key = %key,
                        node = %writer.node,
                        attempt,
                        expected,
                        actual,
                        "version advanced; retrying with refreshed version"
                    );
                    expected = actual;
                }
                Err(other) => return Err(other),
            }
        }

        warn!(key = %key, node = %writer.node, "giving up on contended key");
        Err(StateError::Contention {
            key: key.to_string(),
            attempts: self.max_cas_attempts,
        })
    }

    /// Commit a completed node's contribution as one unit.
    ///
    /// The lock is held for the whole commit. Every scalar write is checked
    /// against its expected version before any of them is applied, so a
    /// [`StateError::Contention`] leaves the store untouched. Counters,
    /// references, messages and the result payload follow the writes. The
    /// node id is appended to the `completed` list last: a dependent only
    /// becomes ready once that entry exists.
    pub fn commit_node(&self, commit: NodeCommit, view: &StateView) -> Result<u64, StateError> {
        let writer = Writer::new(&commit.worker, &commit.node);
        let mut state = self.lock();

        // Versions each key will have once the earlier writes of this
        // commit land.
        let mut pending: HashMap<&StateKey, u64> = HashMap::new();
        let mut planned = Vec::with_capacity(commit.writes.len());
        for write in &commit.writes {
            let expected = write
                .expected_version
                .unwrap_or_else(|| view.version(&write.key));
            let actual = pending
                .get(&write.key)
                .copied()
                .unwrap_or_else(|| state.version(&write.key));
            let base = self.settle_version(&write.key, expected, actual, &writer)?;
            pending.insert(&write.key, base + 1);
            planned.push(base);
        }

        for (write, base) in commit.writes.iter().zip(planned) {
            state.compare_and_set(&write.key, base, write.value.clone(), &writer)?;
        }

        for (counter, delta) in &commit.counters {
            state.increment(counter, *delta);
        }

        for reference in commit.external_refs {
            state.append(
                EXTERNAL_REFS_LIST,
                json!({ "node": commit.node, "worker": commit.worker, "ref": reference }),
            );
        }

        for message in commit.messages {
            state.append(MESSAGES_LIST, Value::String(message));
        }
        state.append(
            MESSAGES_LIST,
            Value::String(format!("{} ({}) completed", commit.node, commit.worker)),
        );

        state.record_result(&commit.node, &commit.worker, commit.output);
        Ok(state.append(COMPLETED_LIST, Value::String(commit.node)))
    }

    /// Version a write inside a locked commit should be based on.
    ///
    /// A stale `expected` counts as one lost race and is refreshed to
    /// `actual`; nothing can move while the lock is held, so the refreshed
    /// version always holds. Fails with [`StateError::Contention`] when the
    /// retry budget has no room for that refresh.
    fn settle_version(
        &self,
        key: &StateKey,
        expected: u64,
        actual: u64,
        writer: &Writer,
    ) -> Result<u64, StateError> {
        if expected == actual {
            return Ok(actual);
        }
        if self.max_cas_attempts > 1 {
            debug!(
                key = %key,
                node = %writer.node,
                expected,
                actual,
                "version advanced since dispatch; using refreshed version"
            );
            return Ok(actual);
        }

        warn!(key = %key, node = %writer.node, "giving up on contended key");
        Err(StateError::Contention {
            key: key.to_string(),
            attempts: self.max_cas_attempts,
        })
    }

    /// Record a permanent failure in the bookkeeping lists.
    pub fn record_failure(&self, node: &str, worker: &str, error: &str) -> u64 {
        self.append(
            MESSAGES_LIST,
            Value::String(format!("{node} ({worker}) failed: {error}")),
        );
        self.append(FAILED_LIST, Value::String(node.to_string()))
    }
}
