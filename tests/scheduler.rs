// tests/scheduler.rs

mod common;
use crate::common::builders::{chain, diamond};

use std::collections::HashSet;

use proptest::prelude::*;
use serde_json::json;

use conductor::dag::{resolver, Scheduler, TaskSpec};
use conductor::errors::{FailureKind, NodeFailure};
use conductor::types::{NodeId, NodeStatus, RunPhase};

fn scheduler(specs: Vec<TaskSpec>) -> Scheduler {
    let mut s = Scheduler::new("t-1", resolver::build(specs, None).unwrap());
    s.start();
    s
}

fn ids(tasks: &[conductor::dag::ScheduledTask]) -> Vec<&str> {
    tasks.iter().map(|t| t.spec.id.as_str()).collect()
}

fn boom() -> NodeFailure {
    NodeFailure::new(FailureKind::Execution, "boom")
}

#[test]
fn nothing_is_dispatched_before_start() {
    let mut s = Scheduler::new("t-1", resolver::build(diamond(), None).unwrap());
    s.step_refresh(&HashSet::new());
    assert!(s.dispatch(4).is_empty());
    assert_eq!(s.phase(), RunPhase::Initializing);
}

#[test]
fn dependents_wait_for_the_committed_set_not_just_status() {
    let mut s = scheduler(diamond());
    let mut committed = HashSet::new();

    let step = s.step_refresh(&committed);
    assert_eq!(step.newly_ready, vec!["A".to_string()]);
    assert_eq!(ids(&s.dispatch(4)), vec!["A"]);

    s.step_completion("A", json!("a"), 1);
    // Completed in memory, but not yet committed to shared state.
    s.step_refresh(&committed);
    assert!(s.dispatch(4).is_empty());

    committed.insert("A".to_string());
    let mut step = s.step_refresh(&committed);
    step.newly_ready.sort();
    assert_eq!(step.newly_ready, vec!["B".to_string(), "C".to_string()]);
    assert_eq!(s.graph().status_of("D"), Some(NodeStatus::Blocked));
}

#[test]
fn dispatch_honours_the_limit() {
    let specs = vec![
        TaskSpec::new("a", "w", ""),
        TaskSpec::new("b", "w", ""),
        TaskSpec::new("c", "w", ""),
    ];
    let mut s = scheduler(specs);
    s.step_refresh(&HashSet::new());

    assert_eq!(s.dispatch(2).len(), 2);
    assert_eq!(s.in_flight(), 2);
    assert_eq!(s.dispatch(2).len(), 1);
    assert!(s.dispatch(2).is_empty());
}

#[test]
fn failure_cascades_to_dependents_with_origin() {
    let mut s = scheduler(diamond());
    let mut committed = HashSet::new();

    s.step_refresh(&committed);
    s.dispatch(4);
    s.step_completion("A", json!(null), 1);
    committed.insert("A".to_string());
    s.step_refresh(&committed);
    s.dispatch(4);

    let step = s.step_failure("C", boom(), 3);
    assert_eq!(step.newly_failed, vec!["C".to_string()]);
    assert_eq!(step.newly_cancelled, vec!["D".to_string()]);

    let d = s.graph().node("D").unwrap();
    assert_eq!(d.status, NodeStatus::Cancelled);
    assert_eq!(d.cancelled_by.as_deref(), Some("C"));
    assert_eq!(s.graph().node("C").unwrap().attempts, 3);

    // B is unaffected and still running.
    assert_eq!(s.graph().status_of("B"), Some(NodeStatus::Running));
    assert_eq!(s.maybe_finish(), None);

    s.step_completion("B", json!(null), 1);
    assert_eq!(s.maybe_finish(), Some(RunPhase::Failed));
}

#[test]
fn cascade_origin_is_the_failed_node_even_transitively() {
    let mut s = scheduler(chain(4));
    s.step_refresh(&HashSet::new());
    s.dispatch(1);
    s.step_failure("n0", boom(), 1);

    for id in ["n1", "n2", "n3"] {
        let node = s.graph().node(id).unwrap();
        assert_eq!(node.status, NodeStatus::Cancelled);
        assert_eq!(node.cancelled_by.as_deref(), Some("n0"));
    }
}

#[test]
fn optional_node_failure_does_not_fail_the_run() {
    let specs = vec![
        TaskSpec::new("main", "w", "").required(true),
        TaskSpec::new("extra", "w", ""),
    ];
    let mut s = scheduler(specs);
    s.step_refresh(&HashSet::new());
    s.dispatch(2);
    s.step_completion("main", json!(1), 1);
    s.step_failure("extra", boom(), 1);

    assert_eq!(s.maybe_finish(), Some(RunPhase::Completed));
}

#[test]
fn cancel_drains_running_nodes_and_ends_cancelled() {
    let mut s = scheduler(diamond());
    s.step_refresh(&HashSet::new());
    s.dispatch(4);

    let mut step = s.step_cancel();
    assert_eq!(s.phase(), RunPhase::Draining);
    step.newly_cancelled.sort();
    assert_eq!(step.newly_cancelled, vec!["B".to_string(), "C".to_string(), "D".to_string()]);
    assert!(!step.run_settled);
    assert!(s.dispatch(4).is_empty());

    // A second request is a no-op.
    assert!(!s.step_cancel().changed());

    let step = s.step_abandoned("A", 1);
    assert_eq!(step.newly_cancelled, vec!["A".to_string()]);
    assert_eq!(
        s.graph().node("A").unwrap().last_error.as_ref().map(|f| f.kind),
        Some(FailureKind::Cancelled)
    );
    assert_eq!(s.maybe_finish(), Some(RunPhase::Cancelled));
}

#[test]
fn restore_resets_running_nodes_and_keeps_completed_ones() {
    let mut s = scheduler(diamond());
    let mut committed = HashSet::new();
    s.step_refresh(&committed);
    s.dispatch(4);
    s.step_completion("A", json!("a"), 2);
    committed.insert("A".to_string());
    s.step_refresh(&committed);
    s.dispatch(1);

    let saved = s.status_vector();
    let graph = resolver::build(diamond(), None).unwrap();
    let mut restored = Scheduler::restore("t-1", graph, &saved, RunPhase::Running);

    assert_eq!(restored.phase(), RunPhase::Initializing);
    let a = restored.graph().node("A").unwrap();
    assert_eq!(a.status, NodeStatus::Completed);
    assert_eq!(a.attempts, 2);
    assert_eq!(a.result, Some(json!("a")));
    assert_eq!(restored.graph().status_of("B"), Some(NodeStatus::Ready));
    assert_eq!(restored.graph().status_of("C"), Some(NodeStatus::Ready));

    restored.start();
    restored.step_refresh(&committed);
    let again = restored.dispatch(4);
    let mut again = ids(&again);
    again.sort();
    assert_eq!(again, vec!["B", "C"]);
}

#[test]
fn restore_of_a_draining_run_finishes_the_cancellation() {
    let mut s = scheduler(diamond());
    s.step_refresh(&HashSet::new());
    s.dispatch(4);
    s.step_cancel();

    let graph = resolver::build(diamond(), None).unwrap();
    let mut restored = Scheduler::restore("t-1", graph, &s.status_vector(), RunPhase::Draining);
    assert_eq!(restored.phase(), RunPhase::Cancelled);
    assert_eq!(restored.maybe_finish(), Some(RunPhase::Cancelled));
}

#[test]
fn progress_counts_terminal_nodes() {
    let mut s = scheduler(chain(4));
    assert_eq!(s.progress(), 0.0);
    s.step_refresh(&HashSet::new());
    s.dispatch(1);
    s.step_completion("n0", json!(null), 1);
    assert_eq!(s.progress(), 0.25);
}

fn dag_strategy(max_nodes: usize) -> impl Strategy<Value = Vec<TaskSpec>> {
    // Node i may only depend on nodes < i, which keeps the graph acyclic.
    (1..=max_nodes).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(any::<usize>(), 0..3), n).prop_map(
            |raw| {
                raw.into_iter()
                    .enumerate()
                    .map(|(i, picks)| {
                        let mut spec = TaskSpec::new(format!("t{i}"), "w", "");
                        if i > 0 {
                            let deps: HashSet<usize> = picks.into_iter().map(|p| p % i).collect();
                            for d in deps {
                                spec = spec.after(format!("t{d}"));
                            }
                        }
                        spec
                    })
                    .collect()
            },
        )
    })
}

proptest! {
    /// Whatever order nodes finish in, a node is only handed out after all
    /// of its dependencies completed and were committed, and every
    /// downstream node of a failure ends cancelled.
    #[test]
    fn dispatch_happens_after_dependencies_commit(
        specs in dag_strategy(10),
        picks in proptest::collection::vec(0..64usize, 1..16),
        limit in 1..4usize,
        failing in proptest::collection::hash_set(0..10usize, 0..3),
    ) {
        let failing: HashSet<NodeId> = failing.into_iter().map(|i| format!("t{i}")).collect();
        let mut s = scheduler(specs.clone());
        let mut committed: HashSet<NodeId> = HashSet::new();
        let mut running: Vec<NodeId> = Vec::new();
        let mut picks = picks.into_iter().cycle();

        let phase = loop {
            s.step_refresh(&committed);
            let free = limit.saturating_sub(running.len());
            for task in s.dispatch(free) {
                for dep in &task.spec.after {
                    prop_assert!(committed.contains(dep), "{} dispatched before {}", task.spec.id, dep);
                }
                running.push(task.spec.id);
            }

            if let Some(phase) = s.maybe_finish() {
                break phase;
            }
            prop_assert!(!running.is_empty(), "scheduler stalled");

            let idx = picks.next().unwrap_or(0) % running.len();
            let node = running.remove(idx);
            if failing.contains(&node) {
                s.step_failure(&node, boom(), 1);
            } else {
                s.step_completion(&node, json!(null), 1);
                committed.insert(node);
            }
        };

        let graph = s.graph();
        for node in graph.nodes() {
            prop_assert!(node.status.is_terminal());
            match node.status {
                NodeStatus::Completed => {
                    for dep in graph.dependencies_of(node.id()) {
                        prop_assert_eq!(graph.status_of(dep), Some(NodeStatus::Completed));
                    }
                }
                NodeStatus::Cancelled => {
                    let origin = node.cancelled_by.clone().unwrap_or_default();
                    prop_assert_eq!(graph.status_of(&origin), Some(NodeStatus::Failed));
                }
                NodeStatus::Failed => prop_assert!(failing.contains(node.id())),
                _ => {}
            }
        }

        let all_completed = graph.nodes().all(|n| n.status == NodeStatus::Completed);
        prop_assert_eq!(phase == RunPhase::Completed, all_completed);
    }
}
