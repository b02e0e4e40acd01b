//! Dependency graph and creation order
//!
//! The graph is rebuilt for every run from the descriptors' dependency sets
//! (explicit ordering, scope, and config references). Nodes are addressed by
//! their position in the input slice.

use crate::error::GraphError;
use crate::resource::ResourceDescriptor;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    ids: Vec<String>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph, rejecting duplicate ids, self-dependencies and
    /// dependencies on ids that are not part of the run.
    pub fn build(descriptors: &[ResourceDescriptor]) -> Result<Self, GraphError> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(descriptors.len());
        for (position, descriptor) in descriptors.iter().enumerate() {
            if index.insert(descriptor.id.as_str(), position).is_some() {
                return Err(GraphError::DuplicateId {
                    id: descriptor.id.clone(),
                });
            }
        }

        let mut dependencies = vec![Vec::new(); descriptors.len()];
        let mut dependents = vec![Vec::new(); descriptors.len()];
        let mut missing = Vec::new();

        for (position, descriptor) in descriptors.iter().enumerate() {
            for dependency in descriptor.dependencies() {
                if dependency == descriptor.id {
                    return Err(GraphError::SelfDependency {
                        id: descriptor.id.clone(),
                    });
                }

                let Some(&target) = index.get(dependency.as_str()) else {
                    missing.push(format!(
                        "{} depends on missing resource {}",
                        descriptor.id, dependency
                    ));
                    continue;
                };

                dependencies[position].push(target);
                dependents[target].push(position);
            }
        }

        if !missing.is_empty() {
            let details = missing.join("\n  - ");
            return Err(GraphError::MissingNodes { details });
        }

        for list in dependents.iter_mut() {
            list.sort_unstable();
        }

        Ok(Self {
            ids: descriptors.iter().map(|d| d.id.clone()).collect(),
            dependencies,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, node: usize) -> &str {
        &self.ids[node]
    }

    /// Direct dependencies of `node`
    pub fn dependencies(&self, node: usize) -> &[usize] {
        &self.dependencies[node]
    }

    /// Direct dependents of `node`
    pub fn dependents(&self, node: usize) -> &[usize] {
        &self.dependents[node]
    }

    /// Kahn's algorithm; among ready nodes the earliest declared goes first.
    pub fn topological_order(&self) -> Result<Vec<usize>, GraphError> {
        let mut indegree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();

        let mut ready: BTreeSet<usize> = indegree
            .iter()
            .enumerate()
            .filter_map(|(node, count)| (*count == 0).then_some(node))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(next) = ready.pop_first() {
            order.push(next);

            for &dependent in &self.dependents[next] {
                indegree[dependent] -= 1;
                if indegree[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() != self.len() {
            return Err(GraphError::Cycle {
                cycle: self.find_cycle(&indegree),
            });
        }

        Ok(order)
    }

    /// Walk dependency edges among the nodes Kahn could not place until a
    /// node repeats. Every such node has a remaining dependency, so the walk
    /// always closes a cycle.
    fn find_cycle(&self, indegree: &[usize]) -> Vec<String> {
        let remaining = |node: usize| indegree[node] > 0;

        let Some(start) = (0..self.len()).find(|&node| remaining(node)) else {
            return Vec::new();
        };

        let mut path = vec![start];
        let mut seen_at: HashMap<usize, usize> = HashMap::from([(start, 0)]);
        let mut current = start;

        loop {
            let Some(&next) = self.dependencies[current].iter().find(|&&dep| remaining(dep)) else {
                // Unreachable for a consistent indegree table; report what was walked
                return path.iter().map(|&node| self.ids[node].clone()).collect();
            };

            if let Some(&position) = seen_at.get(&next) {
                let mut cycle: Vec<String> = path[position..]
                    .iter()
                    .map(|&node| self.ids[node].clone())
                    .collect();
                cycle.push(self.ids[next].clone());
                return cycle;
            }

            seen_at.insert(next, path.len());
            path.push(next);
            current = next;
        }
    }
}

/// Order descriptors so each one comes after everything it depends on.
///
/// # Errors
///
/// Returns an error for duplicate ids, self-dependencies, dependencies on
/// unknown ids, or a dependency cycle.
pub fn order(descriptors: &[ResourceDescriptor]) -> Result<Vec<&ResourceDescriptor>, GraphError> {
    let graph = DependencyGraph::build(descriptors)?;
    let order = graph.topological_order()?;
    Ok(order.into_iter().map(|node| &descriptors[node]).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::template::{standard_topology, TemplateParams};
    use crate::resource::{Reference, ResourceKind};
    use serde_json::json;

    fn node(id: &str, deps: &[&str]) -> ResourceDescriptor {
        deps.iter().fold(
            ResourceDescriptor::new(id, ResourceKind::SecurityGroup, id),
            |d, dep| d.after(*dep),
        )
    }

    fn ids(order: &[&ResourceDescriptor]) -> Vec<String> {
        order.iter().map(|d| d.id.clone()).collect()
    }

    #[test]
    fn test_orders_by_dependency_edges() {
        let descriptors = vec![node("b", &["a"]), node("a", &[])];
        let ordered = order(&descriptors).unwrap();
        assert_eq!(ids(&ordered), vec!["a", "b"]);
    }

    #[test]
    fn test_ties_follow_declaration_order() {
        let descriptors = vec![node("z", &[]), node("m", &[]), node("a", &[])];
        let ordered = order(&descriptors).unwrap();
        assert_eq!(ids(&ordered), vec!["z", "m", "a"]);
    }

    #[test]
    fn test_standard_topology_order() {
        let descriptors = standard_topology(&TemplateParams::default());
        let ordered = ids(&order(&descriptors).unwrap());

        assert_eq!(ordered.first().map(String::as_str), Some("rg1"));
        assert_eq!(ordered.last().map(String::as_str), Some("vm1"));
        let nic = ordered.iter().position(|id| id == "nic1").unwrap();
        for id in ["pip1", "vnet1", "nsg1"] {
            let position = ordered.iter().position(|x| x == id).unwrap();
            assert!(position > 0 && position < nic, "{} out of place in {:?}", id, ordered);
        }
    }

    #[test]
    fn test_references_create_edges() {
        let descriptors = vec![
            ResourceDescriptor::new("nic", ResourceKind::NetworkInterface, "nic")
                .with_config(json!({"subnet": Reference::attribute("vnet", "subnet[0]").to_value()})),
            ResourceDescriptor::new("vnet", ResourceKind::VirtualNetwork, "vnet"),
        ];
        assert_eq!(ids(&order(&descriptors).unwrap()), vec!["vnet", "nic"]);
    }

    #[test]
    fn test_detects_cycle() {
        let descriptors = vec![node("a", &["b"]), node("b", &["c"]), node("c", &["a"]), node("d", &[])];
        let err = order(&descriptors).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                cycle: vec!["a".into(), "b".into(), "c".into(), "a".into()]
            }
        );
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_cycle_excludes_downstream_nodes() {
        // "d" is stuck behind the cycle but is not part of it
        let descriptors = vec![node("d", &["a"]), node("a", &["b"]), node("b", &["a"])];
        let GraphError::Cycle { cycle } = order(&descriptors).unwrap_err() else {
            panic!("expected a cycle");
        };
        assert!(!cycle.contains(&"d".to_string()));
        assert_eq!(cycle.first(), cycle.last());
    }

    #[test]
    fn test_rejects_self_dependency() {
        let err = order(&[node("a", &["a"])]).unwrap_err();
        assert_eq!(err, GraphError::SelfDependency { id: "a".into() });
    }

    #[test]
    fn test_rejects_missing_and_duplicate_nodes() {
        let err = order(&[node("a", &["ghost"])]).unwrap_err();
        assert!(matches!(err, GraphError::MissingNodes { ref details } if details.contains("ghost")));

        let err = order(&[node("a", &[]), node("a", &[])]).unwrap_err();
        assert_eq!(err, GraphError::DuplicateId { id: "a".into() });
    }
}
