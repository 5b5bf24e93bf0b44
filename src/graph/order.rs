//! Level-wise topological ordering.

use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use crate::error::CycleError;

/// A set of resources with no ordering constraints among themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Wave {
    /// Zero-based wave number.
    pub index: usize,
    /// Resource ids in tie-break order.
    pub resources: Vec<String>,
}

/// Groups `nodes` into layers so every node comes strictly after its
/// prerequisites.
///
/// Kahn's algorithm, one layer at a time. Within a layer, nodes keep their
/// position in `nodes`. Prerequisites outside `nodes` are ignored.
///
/// # Errors
///
/// Returns a [`CycleError`] naming the nodes that lie on, or between, cycles.
/// Nodes that merely depend on a cycle are not named.
pub fn layered(
    nodes: &[String],
    prerequisites: &HashMap<String, BTreeSet<String>>,
) -> Result<Vec<Wave>, CycleError> {
    let position: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, id)| (id.as_str(), i))
        .collect();

    let mut in_degree = vec![0usize; nodes.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];

    for (i, id) in nodes.iter().enumerate() {
        let Some(prereqs) = prerequisites.get(id) else {
            continue;
        };
        for prereq in prereqs {
            if let Some(&p) = position.get(prereq.as_str()) {
                in_degree[i] += 1;
                dependents[p].push(i);
            }
        }
    }

    let mut waves = Vec::new();
    let mut placed = vec![false; nodes.len()];
    let mut current: Vec<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();

    while !current.is_empty() {
        let mut next = Vec::new();
        for &i in &current {
            placed[i] = true;
            for &d in &dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    next.push(d);
                }
            }
        }

        waves.push(Wave {
            index: waves.len(),
            resources: current.iter().map(|&i| nodes[i].clone()).collect(),
        });

        next.sort_unstable();
        current = next;
    }

    if placed.iter().all(|&p| p) {
        return Ok(waves);
    }

    Err(CycleError {
        resources: cycle_members(nodes, &placed, &dependents),
    })
}

/// Prunes the unplaced remainder down to nodes on or between cycles.
fn cycle_members(nodes: &[String], placed: &[bool], dependents: &[Vec<usize>]) -> Vec<String> {
    let mut remaining: Vec<bool> = placed.iter().map(|&p| !p).collect();

    // A node with no dependents left in the remainder cannot close a cycle.
    loop {
        let prunable: Vec<usize> = (0..nodes.len())
            .filter(|&i| remaining[i] && !dependents[i].iter().any(|&d| remaining[d]))
            .collect();
        if prunable.is_empty() {
            break;
        }
        for i in prunable {
            remaining[i] = false;
        }
    }

    (0..nodes.len())
        .filter(|&i| remaining[i])
        .map(|i| nodes[i].clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn prereqs(edges: &[(&str, &str)]) -> HashMap<String, BTreeSet<String>> {
        let mut map: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (node, prereq) in edges {
            map.entry((*node).to_string())
                .or_default()
                .insert((*prereq).to_string());
        }
        map
    }

    #[test]
    fn test_layers_keep_input_order() {
        let nodes = ids(&["c", "b", "a"]);
        let waves = layered(&nodes, &prereqs(&[])).unwrap();
        assert_eq!(waves.len(), 1);
        assert_eq!(waves[0].resources, ids(&["c", "b", "a"]));
    }

    #[test]
    fn test_diamond() {
        let nodes = ids(&["a", "b", "c", "d"]);
        let edges = prereqs(&[("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")]);
        let waves = layered(&nodes, &edges).unwrap();
        let layers: Vec<Vec<String>> = waves.into_iter().map(|w| w.resources).collect();
        assert_eq!(layers, vec![ids(&["a"]), ids(&["b", "c"]), ids(&["d"])]);
    }

    #[test]
    fn test_cycle_excludes_downstream_nodes() {
        let nodes = ids(&["a", "b", "c", "d"]);
        // a <-> b, c depends on b, d independent
        let edges = prereqs(&[("a", "b"), ("b", "a"), ("c", "b")]);
        let err = layered(&nodes, &edges).unwrap_err();
        assert_eq!(err.resources, ids(&["a", "b"]));
    }

    #[test]
    fn test_self_loop_is_cycle() {
        let nodes = ids(&["a"]);
        let err = layered(&nodes, &prereqs(&[("a", "a")])).unwrap_err();
        assert_eq!(err.resources, ids(&["a"]));
    }

    #[test]
    fn test_outside_prerequisites_ignored() {
        let nodes = ids(&["b"]);
        let waves = layered(&nodes, &prereqs(&[("b", "a")])).unwrap();
        assert_eq!(waves[0].resources, ids(&["b"]));
    }
}
