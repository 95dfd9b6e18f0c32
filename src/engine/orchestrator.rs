// src/engine/orchestrator.rs

//! Control surface: start, inspect, cancel, resume and await runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointManager;
use crate::dag::{resolver, Scheduler, TaskSpec};
use crate::engine::report::{RunReport, RunStatus};
use crate::engine::runtime::{RunDeps, Runtime};
use crate::errors::{ConductorError, Result};
use crate::exec::{ExecutorPool, PoolOptions, WorkerRegistry};
use crate::knowledge::{AdvicePolicy, KnowledgeAdvisor, NoAdvice};
use crate::state::StateStore;
use crate::synth::{synthesize, SynthesisPolicy};
use crate::types::{NodeId, RunPhase, ThreadId};

/// A new run: what to do and the graph of work that does it.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub description: String,
    pub context: Value,
    pub tasks: Vec<TaskSpec>,
    /// Node whose output is the run's final answer.
    pub synthesis: Option<NodeId>,
}

impl RunRequest {
    pub fn new(description: impl Into<String>, tasks: Vec<TaskSpec>) -> Self {
        Self {
            description: description.into(),
            context: Value::Null,
            tasks,
            synthesis: None,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }

    pub fn synthesis(mut self, node: impl Into<NodeId>) -> Self {
        self.synthesis = Some(node.into());
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorOptions {
    pub pool: PoolOptions,
    pub advice: AdvicePolicy,
    pub synthesis: SynthesisPolicy,
}

struct LiveRun {
    cancel: CancellationToken,
    status: watch::Receiver<RunStatus>,
    report: watch::Receiver<Option<Arc<RunReport>>>,
}

impl LiveRun {
    fn finished(&self) -> bool {
        self.report.borrow().is_some()
    }
}

pub struct Orchestrator {
    deps: RunDeps,
    runs: Mutex<HashMap<ThreadId, LiveRun>>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("deps", &self.deps)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        registry: WorkerRegistry,
        checkpoints: CheckpointManager,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            deps: RunDeps {
                pool: ExecutorPool::new(Arc::new(registry), options.pool),
                advisor: Arc::new(NoAdvice),
                advice: options.advice,
                synthesis: options.synthesis,
                checkpoints: Arc::new(checkpoints),
            },
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn KnowledgeAdvisor>) -> Self {
        self.deps.advisor = advisor;
        self
    }

    pub fn checkpoints(&self) -> &CheckpointManager {
        &self.deps.checkpoints
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<ThreadId, LiveRun>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate the graph and start a new run. Returns its thread id.
    ///
    /// Graph validation errors are returned here, before anything runs.
    pub fn start(&self, request: RunRequest) -> Result<ThreadId> {
        let graph = resolver::build(request.tasks, request.synthesis)?;
        self.deps.pool.registry().check_graph(&graph)?;

        let thread_id = Uuid::new_v4().to_string();
        info!(thread = %thread_id, nodes = graph.len(), description = %request.description, "starting run");

        let scheduler = Scheduler::new(thread_id.clone(), graph);
        let mut runs = self.runs();
        self.launch(
            &mut runs,
            scheduler,
            StateStore::new(),
            request.description,
            request.context,
            1,
        );
        Ok(thread_id)
    }

    /// Continue a thread from its latest checkpoint.
    ///
    /// Completed nodes are not executed again; nodes that were running when
    /// the checkpoint was taken are.
    pub fn resume(&self, thread: &str) -> Result<ThreadId> {
        // Held until the new run is registered, so two resumes of one
        // thread cannot both get past the check.
        let mut runs = self.runs();
        if runs.get(thread).is_some_and(|run| !run.finished()) {
            return Err(ConductorError::AlreadyRunning(thread.to_string()));
        }

        let checkpoint = self
            .deps
            .checkpoints
            .load_latest(thread)?
            .ok_or_else(|| ConductorError::ThreadNotFound(thread.to_string()))?;

        let graph = checkpoint.graph()?;
        self.deps.pool.registry().check_graph(&graph)?;

        info!(
            thread = %thread,
            seq = checkpoint.sequence,
            phase = %checkpoint.phase,
            "resuming run from checkpoint"
        );

        let scheduler = Scheduler::restore(thread, graph, &checkpoint.nodes, checkpoint.phase);
        self.launch(
            &mut runs,
            scheduler,
            StateStore::from_state(checkpoint.state),
            checkpoint.description,
            checkpoint.context,
            checkpoint.sequence + 1,
        );
        Ok(thread.to_string())
    }

    fn launch(
        &self,
        runs: &mut HashMap<ThreadId, LiveRun>,
        scheduler: Scheduler,
        store: StateStore,
        description: String,
        context: Value,
        next_sequence: u64,
    ) {
        let thread_id = scheduler.thread_id().to_string();
        let cancel = CancellationToken::new();
        let (status_tx, status_rx) = watch::channel(RunStatus::from_scheduler(&scheduler));
        let (report_tx, report_rx) = watch::channel(None);

        let runtime = Runtime::new(
            scheduler,
            store,
            self.deps.clone(),
            description,
            context,
            next_sequence,
            cancel.clone(),
            status_tx,
        );

        tokio::spawn(async move {
            let report = runtime.run().await;
            report_tx.send_replace(Some(Arc::new(report)));
        });

        runs.insert(
            thread_id,
            LiveRun {
                cancel,
                status: status_rx,
                report: report_rx,
            },
        );
    }

    /// Per-node status and progress. Falls back to the latest checkpoint
    /// for threads this orchestrator is not running.
    pub fn status(&self, thread: &str) -> Result<RunStatus> {
        if let Some(run) = self.runs().get(thread) {
            return Ok(run.status.borrow().clone());
        }

        match self.deps.checkpoints.load_latest(thread)? {
            Some(checkpoint) => Ok(RunStatus::from_checkpoint(&checkpoint)),
            None => Err(ConductorError::ThreadNotFound(thread.to_string())),
        }
    }

    /// Request cancellation. In-flight workers are signalled; the run
    /// drains and ends `Cancelled`. Acknowledged even if the run already
    /// finished.
    pub fn cancel(&self, thread: &str) -> Result<()> {
        let known = match self.runs().get(thread) {
            Some(run) if !run.finished() => {
                info!(thread = %thread, "cancel requested");
                run.cancel.cancel();
                return Ok(());
            }
            Some(_) => true,
            None => false,
        };

        if !known && self.deps.checkpoints.load_latest(thread)?.is_none() {
            return Err(ConductorError::ThreadNotFound(thread.to_string()));
        }
        warn!(thread = %thread, "cancel requested for a finished run; ignoring");
        Ok(())
    }

    /// Wait until the run reaches a terminal phase.
    ///
    /// Once the report has been handed out the run is forgotten; later
    /// calls rebuild the report from the latest checkpoint.
    pub async fn wait(&self, thread: &str) -> Result<RunReport> {
        let Some(mut rx) = self.runs().get(thread).map(|run| run.report.clone()) else {
            return self.report_from_checkpoint(thread);
        };

        let report = {
            let done = rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| anyhow::anyhow!("run '{thread}' ended without a report"))?;
            match done.as_ref() {
                Some(report) => Arc::clone(report),
                None => return Err(ConductorError::ThreadNotFound(thread.to_string())),
            }
        };

        let mut runs = self.runs();
        // A resume may have registered a newer run in the meantime.
        if runs.get(thread).is_some_and(|run| {
            run.report.borrow().as_ref().is_some_and(|r| Arc::ptr_eq(r, &report))
        }) {
            runs.remove(thread);
            debug!(thread = %thread, "finished run released");
        }
        Ok(RunReport::clone(&report))
    }

    /// Report of a thread this orchestrator is not running. A checkpoint
    /// that is not terminal belongs to an interrupted run, which needs a
    /// resume to finish.
    fn report_from_checkpoint(&self, thread: &str) -> Result<RunReport> {
        let checkpoint = self
            .deps
            .checkpoints
            .load_latest(thread)?
            .ok_or_else(|| ConductorError::ThreadNotFound(thread.to_string()))?;

        let mut graph = checkpoint.graph()?;
        for saved in &checkpoint.nodes {
            if let Some(node) = graph.node_mut(saved.id()) {
                *node = saved.clone();
            }
        }

        let mut status = RunStatus::from_checkpoint(&checkpoint);
        if !status.phase.is_terminal() {
            status.phase = RunPhase::FailedPendingRetry;
        }
        let synthesis = synthesize(&checkpoint.state, &graph, &self.deps.synthesis);
        Ok(RunReport::new(status, checkpoint.state, synthesis))
    }

    /// Threads with checkpoints in the store.
    pub fn threads(&self) -> Result<Vec<ThreadId>> {
        Ok(self.deps.checkpoints.threads()?)
    }
}
