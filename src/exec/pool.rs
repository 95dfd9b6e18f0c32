// src/exec/pool.rs

//! Bounded executor pool.
//!
//! Each submission runs the attempt loop for one node: acquire a slot,
//! call the worker under a timeout, and on failure back off and try again
//! until the attempt budget is spent. The slot is released while backing
//! off so other ready nodes can use it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dag::ScheduledTask;
use crate::errors::{FailureKind, NodeFailure, WorkerError};
use crate::exec::retry::RetryPolicy;
use crate::exec::worker::{WorkerOutput, WorkerRegistry, WorkerRequest};
use crate::types::{NodeId, WorkerId};

pub const DEFAULT_CONCURRENCY: usize = 2;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolOptions {
    pub concurrency: usize,
    /// Per-attempt timeout for nodes without their own.
    pub timeout: Duration,
    /// How long a cancelled worker call may keep running before it is
    /// dropped.
    pub drain_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: DEFAULT_TIMEOUT,
            drain_grace: DEFAULT_DRAIN_GRACE,
            retry: RetryPolicy::default(),
        }
    }
}

/// A failed attempt that will be retried.
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptEvent {
    pub node: NodeId,
    pub attempt: u32,
    pub failure: NodeFailure,
    pub retry_in: Duration,
}

/// Per-run signals handed to every submission of that run.
#[derive(Debug, Clone)]
pub struct RunControl {
    pub cancel: CancellationToken,
    pub attempts: mpsc::UnboundedSender<AttemptEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    Succeeded(WorkerOutput),
    /// Attempt budget exhausted, or a non-retryable failure.
    Failed(NodeFailure),
    /// The run was cancelled; any late result has been dropped.
    Cancelled,
}

/// Final word on one submission.
#[derive(Debug, Clone, PartialEq)]
pub struct Execution {
    pub node: NodeId,
    pub worker: WorkerId,
    /// Total worker calls made for this node, including earlier runs.
    pub attempts: u32,
    pub outcome: ExecOutcome,
}

pub type ExecutionFuture = Pin<Box<dyn Future<Output = Execution> + Send + 'static>>;

#[derive(Debug, Clone)]
pub struct ExecutorPool {
    registry: Arc<WorkerRegistry>,
    slots: Arc<Semaphore>,
    options: PoolOptions,
}

impl ExecutorPool {
    pub fn new(registry: Arc<WorkerRegistry>, options: PoolOptions) -> Self {
        let concurrency = options.concurrency.max(1);
        Self {
            registry,
            slots: Arc::new(Semaphore::new(concurrency)),
            options: PoolOptions {
                concurrency,
                ..options
            },
        }
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn concurrency(&self) -> usize {
        self.options.concurrency
    }

    /// Build the future that executes `task`. The caller decides where to
    /// run it (normally a `JoinSet` owned by the runtime).
    pub fn submit(
        &self,
        task: ScheduledTask,
        request: WorkerRequest,
        control: RunControl,
    ) -> ExecutionFuture {
        let pool = self.clone();
        Box::pin(async move { pool.run_attempts(task, request, control).await })
    }

    async fn run_attempts(
        self,
        task: ScheduledTask,
        mut request: WorkerRequest,
        control: RunControl,
    ) -> Execution {
        let node = task.spec.id.clone();
        let worker_tag = task.spec.worker.clone();
        let finish = |attempts: u32, outcome: ExecOutcome| Execution {
            node: node.clone(),
            worker: worker_tag.clone(),
            attempts,
            outcome,
        };

        let Some(worker) = self.registry.get(&worker_tag) else {
            let failure = NodeFailure::new(
                FailureKind::Execution,
                format!("no worker registered for capability '{worker_tag}'"),
            );
            return finish(task.prior_attempts, ExecOutcome::Failed(failure));
        };

        let timeout = task.spec.timeout.unwrap_or(self.options.timeout);
        // A resumed node always gets at least one more call.
        let budget = self
            .options
            .retry
            .attempts_for(&task.spec)
            .max(task.prior_attempts + 1);
        let cancel = control.cancel.clone();
        let mut attempt = task.prior_attempts;

        loop {
            attempt += 1;

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return finish(attempt - 1, ExecOutcome::Cancelled),
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return finish(attempt - 1, ExecOutcome::Cancelled),
                },
            };

            debug!(node = %node, worker = %worker_tag, attempt, budget, "calling worker");
            request.attempt = attempt;
            let attempt_token = cancel.child_token();
            let call = tokio::time::timeout(
                timeout,
                worker.execute(request.clone(), attempt_token.clone()),
            );
            tokio::pin!(call);

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // Let the worker see the signal and wind down.
                    if tokio::time::timeout(self.options.drain_grace, &mut call).await.is_err() {
                        warn!(node = %node, "worker ignored cancellation within grace period; abandoning call");
                    }
                    None
                }
                res = &mut call => Some(res),
            };
            drop(permit);

            let failure = match result {
                None => {
                    info!(node = %node, attempt, "attempt cancelled; result discarded");
                    return finish(attempt, ExecOutcome::Cancelled);
                }
                Some(Ok(Ok(output))) => {
                    debug!(node = %node, attempt, "worker call succeeded");
                    return finish(attempt, ExecOutcome::Succeeded(output));
                }
                Some(Ok(Err(WorkerError::Cancelled))) if cancel.is_cancelled() => {
                    return finish(attempt, ExecOutcome::Cancelled);
                }
                Some(Ok(Err(err))) => NodeFailure::new(FailureKind::Execution, err.to_string()),
                Some(Err(_elapsed)) => {
                    attempt_token.cancel();
                    NodeFailure::new(
                        FailureKind::Timeout,
                        format!("worker call exceeded {timeout:?}"),
                    )
                }
            };

            if attempt >= budget || !failure.kind.is_retryable() {
                warn!(node = %node, attempt, error = %failure, "attempt budget exhausted");
                return finish(attempt, ExecOutcome::Failed(failure));
            }

            let delay = self.options.retry.delay_after(attempt);
            info!(
                node = %node,
                attempt,
                retry_in = ?delay,
                error = %failure,
                "attempt failed; backing off"
            );
            // The runtime may already be gone; the final Execution still counts.
            let _ = control.attempts.send(AttemptEvent {
                node: node.clone(),
                attempt,
                failure,
                retry_in: delay,
            });

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return finish(attempt, ExecOutcome::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
