// src/state/mod.rs

//! Shared state store.
//!
//! - [`key`] defines the namespaced [`StateKey`].
//! - [`shared`] holds the plain, serializable [`SharedState`].
//! - [`store`] wraps it in a concurrent [`StateStore`] with bounded
//!   compare-and-set retries and hands out read-only [`StateView`]s.

pub mod key;
pub mod shared;
pub mod store;

/// Node ids whose results have been committed, in commit order.
pub const COMPLETED_LIST: &str = "completed";
/// Node ids that failed permanently.
pub const FAILED_LIST: &str = "failed";
/// Running log of human-readable messages.
pub const MESSAGES_LIST: &str = "messages";
/// References produced by workers (ticket ids, pull request urls, ...).
pub const EXTERNAL_REFS_LIST: &str = "external_refs";

pub use key::StateKey;
pub use shared::{ListEntry, NodeResult, SharedState, VersionedValue, WriteRecord, Writer};
pub use store::{NodeCommit, StateStore, StateView, StateWrite, DEFAULT_CAS_ATTEMPTS};
