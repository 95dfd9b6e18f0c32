// src/dag/mod.rs

//! Task graph representation and scheduling.
//!
//! - [`resolver`] validates specs into a [`TaskGraph`] and answers
//!   readiness / cascade questions.
//! - [`graph`] holds the immutable edges plus the node table.
//! - [`task_info`] defines [`TaskSpec`] and the mutable [`TaskNode`].
//! - [`scheduler`] is the per-run state machine.
//! - [`state_manager`] applies node status transitions.
//! - [`scheduler_step`] defines the result type for scheduler steps.

pub mod graph;
pub mod resolver;
pub mod scheduler;
pub mod scheduler_step;
pub mod state_manager;
pub mod task_info;

pub use graph::TaskGraph;
pub use scheduler::Scheduler;
pub use scheduler_step::{ScheduledTask, SchedulerStep};
pub use task_info::{TaskNode, TaskSpec};
