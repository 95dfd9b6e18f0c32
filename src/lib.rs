// src/lib.rs

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dag;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod fs;
pub mod knowledge;
pub mod logging;
pub mod state;
pub mod synth;
pub mod types;

use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{debug, info};

use crate::checkpoint::{CheckpointManager, FileCheckpointStore};
use crate::cli::{CliArgs, Command};
use crate::config::loader::load_and_validate;
use crate::config::model::ConfigFile;
use crate::dag::resolver;
use crate::engine::{Orchestrator, RunReport, RunStatus};
use crate::types::{RunPhase, ThreadId};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - command workers, advisor and file checkpoint store
/// - the orchestrator
/// - Ctrl-C handling (cancels the run)
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)
        .with_context(|| format!("loading config {}", args.config))?;

    match args.command {
        Command::Run {
            description,
            context,
            dry_run,
        } => {
            if dry_run {
                print_dry_run(&cfg)?;
                return Ok(());
            }
            let context = match context {
                Some(raw) => serde_json::from_str::<serde_json::Value>(&raw)
                    .context("parsing --context as JSON")?,
                None => serde_json::Value::Null,
            };

            let orchestrator = Arc::new(build_orchestrator(&cfg));
            let thread = orchestrator.start(cfg.run_request(description).with_context(context))?;
            println!("thread: {thread}");
            finish(orchestrator, thread).await
        }
        Command::Resume { thread } => {
            let orchestrator = Arc::new(build_orchestrator(&cfg));
            let thread = orchestrator.resume(&thread)?;
            finish(orchestrator, thread).await
        }
        Command::Status { thread } => {
            let orchestrator = build_orchestrator(&cfg);
            match thread {
                Some(thread) => print_status(&orchestrator.status(&thread)?),
                None => {
                    for thread in orchestrator.threads()? {
                        let status = orchestrator.status(&thread)?;
                        println!(
                            "{thread}  {:<22} {:>5.1}%",
                            status.phase.to_string(),
                            status.progress * 100.0
                        );
                    }
                }
            }
            Ok(())
        }
    }
}

fn build_orchestrator(cfg: &ConfigFile) -> Orchestrator {
    let store = FileCheckpointStore::new(&cfg.engine.checkpoint_dir);
    let checkpoints =
        CheckpointManager::new(Arc::new(store)).with_keep(cfg.engine.keep_checkpoints);
    Orchestrator::new(cfg.registry(), checkpoints, cfg.orchestrator_options())
        .with_advisor(Arc::new(cfg.advisor.clone()))
}

/// Cancel on Ctrl-C, wait for the run and print its report.
async fn finish(orchestrator: Arc<Orchestrator>, thread: ThreadId) -> Result<()> {
    {
        let orchestrator = Arc::clone(&orchestrator);
        let thread = thread.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("failed to listen for Ctrl+C: {e}");
                return;
            }
            info!(thread = %thread, "Ctrl-C received; cancelling run");
            let _ = orchestrator.cancel(&thread);
        });
    }

    let report: RunReport = orchestrator.wait(&thread).await?;
    print!("{}", report.render());

    match report.phase {
        RunPhase::Completed => Ok(()),
        RunPhase::FailedPendingRetry => bail!(
            "run {thread} halted; resume it with `conductor resume {thread}`"
        ),
        phase => Err(anyhow!("run {thread} ended {phase}")),
    }
}

fn print_status(status: &RunStatus) {
    println!("thread:   {}", status.thread_id);
    println!("phase:    {}", status.phase);
    println!("progress: {:.1}%", status.progress * 100.0);
    println!();
    for node in &status.nodes {
        print!(
            "  - {:<20} {:<12} {:<10} attempts={}",
            node.id, node.worker, node.status, node.attempts
        );
        if let Some(origin) = &node.cancelled_by {
            print!(" cancelled_by={origin}");
        }
        if let Some(err) = &node.last_error {
            print!(" error=\"{err}\"");
        }
        println!();
    }
}

/// Print the validated graph in topological order; runs nothing.
fn print_dry_run(cfg: &ConfigFile) -> Result<()> {
    let graph = resolver::build(cfg.tasks.clone(), cfg.synthesis_node.clone())?;
    let pool = &cfg.engine.pool;

    println!("conductor dry-run");
    println!("  engine.concurrency = {}", pool.concurrency);
    println!("  engine.max_attempts = {}", pool.retry.max_attempts);
    println!("  engine.timeout = {:?}", pool.timeout);
    println!(
        "  engine.backoff = {:?} .. {:?}",
        pool.retry.base, pool.retry.cap
    );
    println!("  engine.checkpoint_dir = {}", cfg.engine.checkpoint_dir.display());
    if let Some(coordinator) = &cfg.synthesis.coordinator {
        println!("  synthesis.coordinator = {coordinator}");
    }
    if let Some(node) = graph.synthesis_node() {
        println!("  synthesis.node = {node}");
    }
    println!("  knowledge entries = {}", cfg.advisor.len());
    println!();

    println!("tasks ({}), in topological order:", graph.len());
    for id in graph.topo_order() {
        let Some(node) = graph.node(id) else { continue };
        let spec = node.spec();
        println!("  - {id}");
        println!("      worker: {}", spec.worker);
        if !spec.description.is_empty() {
            println!("      description: {}", spec.description);
        }
        let deps = graph.dependencies_of(id);
        if !deps.is_empty() {
            println!("      after: {:?}", deps);
        }
        if let Some(timeout) = spec.timeout {
            println!("      timeout: {timeout:?}");
        }
        if let Some(attempts) = spec.max_attempts {
            println!("      max_attempts: {attempts}");
        }
        if spec.required {
            println!("      required: true");
        }
    }

    debug!("dry-run complete (no execution)");
    Ok(())
}
