// src/exec/mod.rs

//! Task execution layer.
//!
//! - [`worker`] defines the [`Worker`] trait, its request/output types and
//!   the [`WorkerRegistry`] keyed by capability tag.
//! - [`pool`] runs the per-node attempt loop under a concurrency limit,
//!   with timeouts, backoff and cancellation.
//! - [`retry`] holds the attempt budget and backoff schedule.
//! - [`command`] provides [`CommandWorker`], a worker that runs a shell
//!   command via `tokio::process::Command`.

pub mod command;
pub mod pool;
pub mod retry;
pub mod worker;

pub use command::CommandWorker;
pub use pool::{
    AttemptEvent, ExecOutcome, Execution, ExecutorPool, PoolOptions, RunControl,
};
pub use retry::RetryPolicy;
pub use worker::{Worker, WorkerFuture, WorkerOutput, WorkerRegistry, WorkerRequest};
