// tests/resolver.rs

mod common;
use crate::common::builders::diamond;

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;

use conductor::dag::{resolver, TaskSpec};
use conductor::errors::GraphValidationError;

fn spec(id: &str) -> TaskSpec {
    TaskSpec::new(id, "w", "")
}

#[test]
fn diamond_builds_with_dependencies_before_dependents() {
    let graph = resolver::build(diamond(), None).unwrap();
    let order = graph.topo_order();
    let pos = |id: &str| order.iter().position(|n| n == id).unwrap();

    assert_eq!(order.len(), 4);
    assert!(pos("A") < pos("B"));
    assert!(pos("A") < pos("C"));
    assert!(pos("B") < pos("D"));
    assert!(pos("C") < pos("D"));

    assert_eq!(graph.dependencies_of("D"), ["B".to_string(), "C".to_string()]);
    let mut dependents = graph.dependents_of("A").to_vec();
    dependents.sort();
    assert_eq!(dependents, vec!["B".to_string(), "C".to_string()]);
}

#[test]
fn empty_graph_is_rejected() {
    assert_eq!(resolver::build(vec![], None).unwrap_err(), GraphValidationError::Empty);
}

#[test]
fn duplicate_ids_are_rejected() {
    let err = resolver::build(vec![spec("A"), spec("A")], None).unwrap_err();
    assert_eq!(err, GraphValidationError::DuplicateNode("A".into()));
}

#[test]
fn dangling_dependency_is_rejected() {
    let err = resolver::build(vec![spec("A").after("ghost")], None).unwrap_err();
    assert_eq!(
        err,
        GraphValidationError::DanglingDependency {
            node: "A".into(),
            dependency: "ghost".into()
        }
    );
}

#[test]
fn self_dependency_is_rejected() {
    let err = resolver::build(vec![spec("A").after("A")], None).unwrap_err();
    assert_eq!(err, GraphValidationError::SelfDependency("A".into()));
}

#[test]
fn cycle_names_every_node_on_it() {
    let specs = vec![
        spec("A").after("C"),
        spec("B").after("A"),
        spec("C").after("B"),
        spec("D"),
    ];
    match resolver::build(specs, None) {
        Err(GraphValidationError::Cycle { nodes }) => {
            let nodes: HashSet<_> = nodes.into_iter().collect();
            let expected: HashSet<_> = ["A", "B", "C"].iter().map(|s| s.to_string()).collect();
            assert_eq!(nodes, expected);
        }
        other => panic!("expected a cycle error, got {other:?}"),
    }
}

#[test]
fn unknown_synthesis_node_is_rejected() {
    let err = resolver::build(diamond(), Some("Z".into())).unwrap_err();
    assert_eq!(err, GraphValidationError::UnknownSynthesisNode("Z".into()));
}

#[test]
fn duplicate_edges_collapse() {
    let graph = resolver::build(vec![spec("A"), spec("B").after("A").after("A")], None).unwrap();
    assert_eq!(graph.dependencies_of("B"), ["A".to_string()]);
    assert_eq!(graph.dependents_of("A"), ["B".to_string()]);
}

#[test]
fn cascade_targets_cover_the_downstream_cone_only() {
    let mut specs = diamond();
    specs.push(spec("E").after("D"));
    specs.push(spec("F").after("A"));
    let graph = resolver::build(specs, None).unwrap();

    let targets = resolver::cascade_targets(&graph, "C");
    assert_eq!(targets, vec!["D".to_string(), "E".to_string()]);
}

/// Does the edge list (node i depends on each j in deps[i]) contain a cycle?
fn has_cycle(deps: &[Vec<usize>]) -> bool {
    // 0 = unvisited, 1 = on stack, 2 = done
    fn visit(n: usize, deps: &[Vec<usize>], state: &mut [u8]) -> bool {
        match state[n] {
            1 => return true,
            2 => return false,
            _ => {}
        }
        state[n] = 1;
        for &d in &deps[n] {
            if visit(d, deps, state) {
                return true;
            }
        }
        state[n] = 2;
        false
    }

    let mut state = vec![0u8; deps.len()];
    (0..deps.len()).any(|n| visit(n, deps, &mut state))
}

fn graph_strategy(max_nodes: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    (1..=max_nodes).prop_flat_map(|n| {
        proptest::collection::vec(proptest::collection::vec(0..n, 0..3), n).prop_map(
            |raw: Vec<Vec<usize>>| {
                raw.into_iter()
                    .enumerate()
                    .map(|(i, deps)| {
                        let mut deps: Vec<usize> = deps.into_iter().filter(|&d| d != i).collect();
                        deps.sort_unstable();
                        deps.dedup();
                        deps
                    })
                    .collect()
            },
        )
    })
}

fn specs_from(deps: &[Vec<usize>]) -> Vec<TaskSpec> {
    deps.iter()
        .enumerate()
        .map(|(i, ds)| {
            ds.iter()
                .fold(spec(&format!("t{i}")), |s, d| s.after(format!("t{d}")))
        })
        .collect()
}

proptest! {
    #[test]
    fn build_rejects_exactly_the_cyclic_graphs(deps in graph_strategy(8)) {
        let result = resolver::build(specs_from(&deps), None);
        if has_cycle(&deps) {
            let is_cycle_error = matches!(result, Err(GraphValidationError::Cycle { .. }));
            prop_assert!(is_cycle_error);
        } else {
            prop_assert!(result.is_ok());
        }
    }

    #[test]
    fn topological_order_respects_every_edge(deps in graph_strategy(8)) {
        prop_assume!(!has_cycle(&deps));
        let graph = resolver::build(specs_from(&deps), None).unwrap();
        let pos: HashMap<&str, usize> = graph
            .topo_order()
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        prop_assert_eq!(pos.len(), deps.len());
        for (i, ds) in deps.iter().enumerate() {
            let node = format!("t{i}");
            for d in ds {
                let dep = format!("t{d}");
                prop_assert!(pos[dep.as_str()] < pos[node.as_str()]);
            }
        }
    }
}
