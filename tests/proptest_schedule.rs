//! Property-based tests using proptest
//!
//! These tests verify the creation order produced for randomly generated
//! dependency graphs, and cycle reporting.

use azprov::error::GraphError;
use azprov::orchestrator::order;
use azprov::resource::{ResourceDescriptor, ResourceKind};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

fn descriptor(id: usize, deps: &[usize]) -> ResourceDescriptor {
    deps.iter().fold(
        ResourceDescriptor::new(format!("r{}", id), ResourceKind::SecurityGroup, format!("r{}", id)),
        |d, dep| d.after(format!("r{}", dep)),
    )
}

/// Generate an acyclic graph: node `i` may only depend on nodes below `i`.
/// Declaration order is shuffled so it does not reveal the topology.
fn arb_dag() -> impl Strategy<Value = Vec<ResourceDescriptor>> {
    (1usize..30)
        .prop_flat_map(|n| {
            (0..n)
                .map(|i| prop::collection::vec(any::<bool>(), i))
                .collect::<Vec<_>>()
        })
        .prop_map(|edges| {
            edges
                .iter()
                .enumerate()
                .map(|(i, picks)| {
                    let deps: Vec<usize> = picks
                        .iter()
                        .enumerate()
                        .filter_map(|(j, picked)| picked.then_some(j))
                        .collect();
                    descriptor(i, &deps)
                })
                .collect::<Vec<_>>()
        })
        .prop_shuffle()
}

/// Generate a graph with a ring `r0 -> r1 -> ... -> r0` plus acyclic extras
fn arb_cyclic() -> impl Strategy<Value = Vec<ResourceDescriptor>> {
    (2usize..8, 0usize..10)
        .prop_map(|(ring, extra)| {
            let mut descriptors: Vec<_> = (0..ring).map(|i| descriptor(i, &[(i + 1) % ring])).collect();
            // Extras depend on the ring but are not part of it
            descriptors.extend((ring..ring + extra).map(|i| descriptor(i, &[i - 1])));
            descriptors
        })
        .prop_shuffle()
}

proptest! {
    /// The order is a permutation of the input
    #[test]
    fn order_is_permutation(descriptors in arb_dag()) {
        let ordered = order(&descriptors).unwrap();
        prop_assert_eq!(ordered.len(), descriptors.len());

        let ids: HashSet<&str> = ordered.iter().map(|d| d.id.as_str()).collect();
        prop_assert_eq!(ids.len(), descriptors.len());
    }

    /// Every resource comes after each of its dependencies
    #[test]
    fn order_respects_dependencies(descriptors in arb_dag()) {
        let ordered = order(&descriptors).unwrap();
        let position: HashMap<&str, usize> = ordered
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.as_str(), i))
            .collect();

        for d in &descriptors {
            for dep in d.dependencies() {
                prop_assert!(
                    position[dep.as_str()] < position[d.id.as_str()],
                    "{} placed before its dependency {}", d.id, dep
                );
            }
        }
    }

    /// Without edges the declaration order is kept
    #[test]
    fn independent_nodes_keep_declaration_order(n in 1usize..40) {
        let descriptors: Vec<_> = (0..n).rev().map(|i| descriptor(i, &[])).collect();
        let ordered = order(&descriptors).unwrap();
        let expected: Vec<&str> = descriptors.iter().map(|d| d.id.as_str()).collect();
        let actual: Vec<&str> = ordered.iter().map(|d| d.id.as_str()).collect();
        prop_assert_eq!(actual, expected);
    }

    /// A cycle is reported as a closed walk along dependency edges
    #[test]
    fn cycles_are_reported(descriptors in arb_cyclic()) {
        let err = order(&descriptors).unwrap_err();
        let GraphError::Cycle { cycle } = err else {
            return Err(TestCaseError::fail("expected a cycle error"));
        };

        prop_assert!(cycle.len() >= 3);
        prop_assert_eq!(cycle.first(), cycle.last());

        let by_id: HashMap<&str, &ResourceDescriptor> =
            descriptors.iter().map(|d| (d.id.as_str(), d)).collect();
        for pair in cycle.windows(2) {
            let from = by_id[pair[0].as_str()];
            prop_assert!(from.dependencies().contains(&pair[1]));
        }
    }
}
