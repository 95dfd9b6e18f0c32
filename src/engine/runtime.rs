// src/engine/runtime.rs

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::dag::{ScheduledTask, Scheduler};
use crate::engine::report::{RunReport, RunStatus};
use crate::errors::{FailureKind, NodeFailure, PersistenceError};
use crate::exec::{AttemptEvent, ExecOutcome, Execution, ExecutorPool, RunControl, WorkerRequest};
use crate::knowledge::{AdvicePolicy, AdviceQuery, KnowledgeAdvisor};
use crate::state::{NodeCommit, StateStore, StateView};
use crate::synth::{synthesize, SynthesisPolicy};
use crate::types::{NodeId, RunPhase};

/// Everything a run needs besides its scheduler and state.
#[derive(Clone)]
pub struct RunDeps {
    pub pool: ExecutorPool,
    pub advisor: Arc<dyn KnowledgeAdvisor>,
    pub advice: AdvicePolicy,
    pub synthesis: SynthesisPolicy,
    pub checkpoints: Arc<CheckpointManager>,
}

impl fmt::Debug for RunDeps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunDeps")
            .field("pool", &self.pool)
            .field("advice", &self.advice)
            .field("synthesis", &self.synthesis)
            .finish_non_exhaustive()
    }
}

/// Async tick loop of one run.
///
/// The [`Scheduler`] decides; this shell does the IO: it hands ready
/// nodes to the executor pool, commits their results to the state store
/// and writes a checkpoint after every commit. Nothing new is dispatched
/// until that checkpoint is durable.
pub struct Runtime {
    scheduler: Scheduler,
    store: StateStore,
    deps: RunDeps,
    description: String,
    context: Value,
    next_sequence: u64,
    cancel: CancellationToken,
    status_tx: watch::Sender<RunStatus>,
    /// State view each in-flight node was dispatched with.
    views: HashMap<NodeId, StateView>,
    inflight: JoinSet<Execution>,
    inflight_ids: HashMap<Id, NodeId>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("scheduler", &self.scheduler)
            .field("next_sequence", &self.next_sequence)
            .finish_non_exhaustive()
    }
}

impl Runtime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: Scheduler,
        store: StateStore,
        deps: RunDeps,
        description: String,
        context: Value,
        next_sequence: u64,
        cancel: CancellationToken,
        status_tx: watch::Sender<RunStatus>,
    ) -> Self {
        Self {
            scheduler,
            store,
            deps,
            description,
            context,
            next_sequence,
            cancel,
            status_tx,
            views: HashMap::new(),
            inflight: JoinSet::new(),
            inflight_ids: HashMap::new(),
        }
    }

    /// Drive the run to a terminal phase and report on it.
    pub async fn run(mut self) -> RunReport {
        let thread = self.scheduler.thread_id().to_string();
        info!(thread = %thread, phase = %self.scheduler.phase(), "runtime started");

        if !self.scheduler.phase().is_terminal() {
            self.scheduler.start();
            // The initial snapshot makes the run resumable before anything
            // has been dispatched.
            if self.checkpoint().await.is_ok() {
                self.tick_loop().await;
            }
        }

        self.drain().await;
        self.publish();

        let report = self.report();
        info!(thread = %thread, phase = %report.phase, "runtime exiting");
        report
    }

    async fn tick_loop(&mut self) {
        let (attempt_tx, mut attempt_rx) = mpsc::unbounded_channel::<AttemptEvent>();
        let control = RunControl {
            cancel: self.cancel.clone(),
            attempts: attempt_tx,
        };
        let mut cancel_seen = false;

        loop {
            let committed = self.store.completed_nodes();
            let refreshed = self.scheduler.step_refresh(&committed);
            if refreshed.changed() {
                debug!(
                    ready = ?refreshed.newly_ready,
                    cancelled = ?refreshed.newly_cancelled,
                    "readiness refreshed"
                );
            }

            let limit = self
                .deps
                .pool
                .concurrency()
                .saturating_sub(self.inflight.len());
            for task in self.scheduler.dispatch(limit) {
                self.spawn(task, &control);
            }
            self.publish();

            if let Some(phase) = self.scheduler.maybe_finish() {
                if phase != RunPhase::FailedPendingRetry {
                    // Terminal phase must be durable too; a failure here
                    // downgrades the run to FailedPendingRetry.
                    let _ = self.checkpoint().await;
                }
                return;
            }

            if self.inflight.is_empty() {
                let step = self.scheduler.step_stalled();
                if !step.changed() {
                    error!(thread = %self.scheduler.thread_id(), "run cannot make progress");
                    self.scheduler.halt();
                }
                continue;
            }

            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    let step = self.scheduler.step_cancel();
                    info!(cancelled = ?step.newly_cancelled, in_flight = self.inflight.len(), "draining");
                    if self.checkpoint().await.is_err() {
                        return;
                    }
                }

                Some(event) = attempt_rx.recv() => {
                    self.scheduler.record_attempt(&event.node, event.attempt, event.failure);
                }

                Some(joined) = self.inflight.join_next_with_id() => {
                    let execution = match joined {
                        Ok((id, execution)) => {
                            self.inflight_ids.remove(&id);
                            execution
                        }
                        Err(err) => {
                            let Some(node) = self.inflight_ids.remove(&err.id()) else {
                                error!(error = %err, "unknown executor task ended abnormally");
                                continue;
                            };
                            error!(node = %node, error = %err, "executor task ended abnormally");
                            let attempts = self.recorded_attempts(&node);
                            Execution {
                                worker: String::new(),
                                node,
                                attempts,
                                outcome: ExecOutcome::Failed(NodeFailure::new(
                                    FailureKind::Execution,
                                    format!("worker task aborted: {err}"),
                                )),
                            }
                        }
                    };
                    if self.apply(execution).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    fn spawn(&mut self, task: ScheduledTask, control: &RunControl) {
        let node = task.spec.id.clone();
        let view = self.store.view();

        let advice = self.deps.advisor.query(&AdviceQuery {
            node: node.clone(),
            worker: task.spec.worker.clone(),
            description: task.spec.description.clone(),
        });
        let advice = self.deps.advice.apply(advice);
        self.scheduler.record_advice(
            &node,
            advice.iter().map(|a| a.advice.pattern_id.clone()).collect(),
        );

        let request = WorkerRequest {
            thread_id: task.thread_id.clone(),
            node_id: node.clone(),
            worker: task.spec.worker.clone(),
            description: task.spec.description.clone(),
            context: self.context.clone(),
            state: view.clone(),
            advice,
            attempt: task.prior_attempts + 1,
        };

        info!(
            node = %node,
            worker = %task.spec.worker,
            state_seq = view.sequence(),
            "dispatching node"
        );
        let handle = self
            .inflight
            .spawn(self.deps.pool.submit(task, request, control.clone()));
        self.inflight_ids.insert(handle.id(), node.clone());
        self.views.insert(node, view);
    }

    /// Fold one finished execution into the scheduler and state store.
    ///
    /// Returns an error only when the follow-up checkpoint failed and the
    /// run has been halted.
    async fn apply(&mut self, execution: Execution) -> Result<(), PersistenceError> {
        let Execution {
            node,
            worker,
            attempts,
            outcome,
        } = execution;
        let view = self.views.remove(&node).unwrap_or_default();

        if self.scheduler.phase() != RunPhase::Running {
            if matches!(outcome, ExecOutcome::Succeeded(_)) {
                info!(node = %node, "late result after cancellation discarded");
            }
            self.scheduler.step_abandoned(&node, attempts);
            return Ok(());
        }

        match outcome {
            ExecOutcome::Succeeded(output) => {
                let result = output.output.clone();
                let commit = NodeCommit {
                    node: node.clone(),
                    worker: worker.clone(),
                    output: output.output,
                    writes: output.writes,
                    external_refs: output.external_refs,
                    counters: output.counters,
                    messages: output.messages,
                };
                match self.store.commit_node(commit, &view) {
                    Ok(seq) => {
                        debug!(node = %node, seq, "result committed");
                        self.scheduler.step_completion(&node, result, attempts);
                    }
                    Err(err) => {
                        let failure = NodeFailure::new(FailureKind::StateContention, err.to_string());
                        self.store.record_failure(&node, &worker, &failure.to_string());
                        self.scheduler.step_failure(&node, failure, attempts);
                    }
                }
            }
            ExecOutcome::Failed(failure) => {
                self.store.record_failure(&node, &worker, &failure.to_string());
                self.scheduler.step_failure(&node, failure, attempts);
            }
            ExecOutcome::Cancelled => {
                self.scheduler.step_abandoned(&node, attempts);
                return Ok(());
            }
        }

        self.checkpoint().await
    }

    /// Write a checkpoint of the current state. On failure the run halts.
    ///
    /// The write runs on the blocking pool; the loop does not dispatch
    /// again until it has returned.
    async fn checkpoint(&mut self) -> Result<(), PersistenceError> {
        let state = self.store.snapshot();
        let checkpoint = Checkpoint {
            thread_id: self.scheduler.thread_id().to_string(),
            sequence: self.next_sequence,
            state_sequence: state.sequence(),
            phase: self.scheduler.phase(),
            description: self.description.clone(),
            context: self.context.clone(),
            synthesis: self.scheduler.graph().synthesis_node().map(str::to_string),
            nodes: self.scheduler.status_vector(),
            state,
            created_at: Utc::now(),
        };

        let thread = checkpoint.thread_id.clone();
        let seq = checkpoint.sequence;
        let manager = Arc::clone(&self.deps.checkpoints);
        let saved = tokio::task::spawn_blocking(move || manager.save(&checkpoint))
            .await
            .unwrap_or_else(|err| {
                Err(PersistenceError::Io(anyhow::anyhow!(
                    "checkpoint writer did not finish: {err}"
                )))
            });

        match saved {
            Ok(()) => {
                self.next_sequence += 1;
                Ok(())
            }
            Err(err) => {
                error!(
                    thread = %thread,
                    seq,
                    error = %err,
                    "checkpoint write failed; halting run"
                );
                self.scheduler.halt();
                self.cancel.cancel();
                Err(err)
            }
        }
    }

    /// Wait for in-flight executions after the loop ended. Their results
    /// are never committed.
    async fn drain(&mut self) {
        if self.inflight.is_empty() {
            return;
        }
        self.cancel.cancel();
        info!(in_flight = self.inflight.len(), "waiting for in-flight workers");

        while let Some(joined) = self.inflight.join_next_with_id().await {
            let (id, attempts) = match joined {
                Ok((id, execution)) => (id, Some(execution.attempts)),
                Err(err) => (err.id(), None),
            };
            if let Some(node) = self.inflight_ids.remove(&id) {
                debug!(node = %node, "in-flight result discarded");
                // An aborted task reports nothing; keep what was recorded.
                let attempts = attempts.unwrap_or_else(|| self.recorded_attempts(&node));
                self.scheduler.step_abandoned(&node, attempts);
            }
        }
    }

    fn recorded_attempts(&self, node: &str) -> u32 {
        self.scheduler.graph().node(node).map_or(0, |n| n.attempts)
    }

    fn publish(&self) {
        self.status_tx
            .send_replace(RunStatus::from_scheduler(&self.scheduler));
    }

    fn report(&self) -> RunReport {
        let state = self.store.snapshot();
        let synthesis = synthesize(&state, self.scheduler.graph(), &self.deps.synthesis);
        RunReport::new(RunStatus::from_scheduler(&self.scheduler), state, synthesis)
    }
}
