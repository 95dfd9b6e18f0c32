// src/engine/mod.rs

//! Orchestration engine.
//!
//! This module ties together:
//! - the pure per-run [`crate::dag::Scheduler`]
//! - the executor pool that calls workers
//! - the shared state store and checkpoint manager
//!
//! The async tick loop of a single run lives in [`runtime`]; the control
//! surface callers use (start / status / cancel / resume / wait) is the
//! [`Orchestrator`] in [`orchestrator`]. [`report`] holds the status and
//! final report types.

pub mod orchestrator;
pub mod report;
pub mod runtime;

pub use orchestrator::{Orchestrator, OrchestratorOptions, RunRequest};
pub use report::{NodeSummary, RunReport, RunStatus};
pub use runtime::{RunDeps, Runtime};
