//! A worker that follows a per-node script instead of doing real work.
//!
//! Each node gets a list of [`Step`]s, one per attempt. Attempts beyond
//! the script succeed with the node's configured output. Every call is
//! recorded with its start and end instant so tests can reason about
//! overlap and ordering.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use conductor::errors::WorkerError;
use conductor::exec::{Worker, WorkerFuture, WorkerOutput, WorkerRegistry, WorkerRequest};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub enum Step {
    Succeed(WorkerOutput),
    Fail(String),
    /// Only returns once cancelled (so a timeout fires first).
    Hang,
    /// Sleep, then succeed. Returns early when cancelled.
    Delay(Duration, WorkerOutput),
    /// Sleep without looking at the cancel signal, then succeed.
    Stubborn(Duration, WorkerOutput),
}

impl Step {
    pub fn fail(message: &str) -> Self {
        Step::Fail(message.to_string())
    }
}

/// One recorded worker call.
#[derive(Debug, Clone)]
pub struct Call {
    pub node: String,
    pub attempt: u32,
    pub started: Instant,
    /// `None` while the call is still in progress.
    pub finished: Option<Instant>,
    pub request: WorkerRequest,
}

#[derive(Debug, Default)]
struct Inner {
    scripts: HashMap<String, Vec<Step>>,
    outputs: HashMap<String, WorkerOutput>,
    default_delay: Option<Duration>,
    calls: Vec<Call>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedWorker {
    inner: Arc<Mutex<Inner>>,
}

/// Stamps `finished` when the call ends, including when the call future is
/// dropped by a timeout or an abandoned drain.
struct Window<'a> {
    worker: &'a ScriptedWorker,
    index: usize,
}

impl Drop for Window<'_> {
    fn drop(&mut self) {
        if let Some(call) = self.worker.lock().calls.get_mut(self.index) {
            call.finished.get_or_insert_with(Instant::now);
        }
    }
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with this worker under `tag`. Clones share the call log.
    pub fn registry(&self, tag: &str) -> WorkerRegistry {
        WorkerRegistry::new().with(tag, Arc::new(self.clone()))
    }

    /// Steps for successive attempts of `node`.
    pub fn script(self, node: &str, steps: Vec<Step>) -> Self {
        self.lock().scripts.insert(node.to_string(), steps);
        self
    }

    /// Output used when `node` succeeds outside its script.
    pub fn output(self, node: &str, output: WorkerOutput) -> Self {
        self.lock().outputs.insert(node.to_string(), output);
        self
    }

    /// Make unscripted calls take `delay` before succeeding.
    pub fn default_delay(self, delay: Duration) -> Self {
        self.lock().default_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, node: &str) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.node == node)
            .cloned()
            .collect()
    }

    pub fn call_count(&self, node: &str) -> usize {
        self.lock().calls.iter().filter(|c| c.node == node).count()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_window(&self, request: &WorkerRequest) -> (Window<'_>, Step) {
        let mut inner = self.lock();
        let node = request.node_id.clone();
        let scripted = inner
            .scripts
            .get(&node)
            .and_then(|steps| steps.get(request.attempt.saturating_sub(1) as usize))
            .cloned();
        let step = scripted.unwrap_or_else(|| {
            let output = inner
                .outputs
                .get(&node)
                .cloned()
                .unwrap_or_else(|| WorkerOutput::new(json!({ "node": node })));
            match inner.default_delay {
                Some(delay) => Step::Delay(delay, output),
                None => Step::Succeed(output),
            }
        });

        inner.calls.push(Call {
            node,
            attempt: request.attempt,
            started: Instant::now(),
            finished: None,
            request: request.clone(),
        });
        let index = inner.calls.len() - 1;
        drop(inner);

        (
            Window {
                worker: self,
                index,
            },
            step,
        )
    }

    async fn run(
        &self,
        request: WorkerRequest,
        cancel: CancellationToken,
    ) -> Result<WorkerOutput, WorkerError> {
        let (_window, step) = self.open_window(&request);
        match step {
            Step::Succeed(output) => Ok(output),
            Step::Fail(message) => Err(WorkerError::Failed(message)),
            Step::Hang => {
                cancel.cancelled().await;
                Err(WorkerError::Cancelled)
            }
            Step::Delay(delay, output) => tokio::select! {
                _ = cancel.cancelled() => Err(WorkerError::Cancelled),
                _ = tokio::time::sleep(delay) => Ok(output),
            },
            Step::Stubborn(delay, output) => {
                tokio::time::sleep(delay).await;
                Ok(output)
            }
        }
    }
}

impl Worker for ScriptedWorker {
    fn execute(&self, request: WorkerRequest, cancel: CancellationToken) -> WorkerFuture<'_> {
        Box::pin(self.run(request, cancel))
    }
}
