//! Dependency graph construction.

use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::debug;

use crate::error::{DeclarationError, Result, StackError};
use crate::model::{Stack, WiringPatch};

use super::order::{layered, Wave};

/// Dependency graph of the present resources of a stack.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Present ids in declaration order.
    order: Vec<String>,
    /// Ids each resource must come after.
    prerequisites: HashMap<String, BTreeSet<String>>,
    /// Ids that must come after each resource.
    dependents: HashMap<String, BTreeSet<String>>,
    /// Cached layering.
    waves: Vec<Wave>,
}

impl DependencyGraph {
    /// Builds the graph from explicit dependencies and property references.
    ///
    /// # Errors
    ///
    /// Returns a declaration error for unknown dependencies or references,
    /// and a cycle error if the relation is not acyclic.
    pub fn build(stack: &Stack) -> Result<Self> {
        let order: Vec<String> = stack.resources().map(|r| r.id.clone()).collect();
        let mut prerequisites: HashMap<String, BTreeSet<String>> = HashMap::new();

        for resource in stack.resources() {
            let entry = prerequisites.entry(resource.id.clone()).or_default();

            for dep in &resource.depends_on {
                if stack.resource(dep).is_none() {
                    return Err(StackError::Declaration(DeclarationError::UnknownDependency {
                        resource: resource.id.clone(),
                        dependency: dep.clone(),
                    }));
                }
                entry.insert(dep.clone());
            }

            for (property, reference) in resource.references() {
                if stack.resource(&reference.resource).is_none() {
                    return Err(StackError::Declaration(DeclarationError::UnknownReference {
                        resource: resource.id.clone(),
                        property: property.to_string(),
                        reference: reference.resource,
                    }));
                }
                entry.insert(reference.resource);
            }
        }

        let mut graph = Self {
            order,
            prerequisites,
            dependents: HashMap::new(),
            waves: Vec::new(),
        };
        graph.relayer()?;

        debug!(
            "Built dependency graph: {} resources in {} waves",
            graph.order.len(),
            graph.waves.len()
        );
        Ok(graph)
    }

    /// Builds the graph and applies wiring patches.
    ///
    /// # Errors
    ///
    /// See [`DependencyGraph::build`] and [`DependencyGraph::apply_patches`].
    pub fn build_with_patches(stack: &Stack, patches: &[WiringPatch]) -> Result<Self> {
        let mut graph = Self::build(stack)?;
        graph.apply_patches(stack, patches)?;
        Ok(graph)
    }

    /// Adds the edges of each patch and re-checks acyclicity.
    ///
    /// Edges touching an absent component are skipped.
    ///
    /// # Errors
    ///
    /// Returns a declaration error if a patch names an undeclared id, and a
    /// cycle error if the patched relation is not acyclic.
    pub fn apply_patches(&mut self, stack: &Stack, patches: &[WiringPatch]) -> Result<()> {
        if patches.is_empty() {
            return Ok(());
        }

        for patch in patches {
            for id in std::iter::once(&patch.resource).chain(&patch.depends_on) {
                if !stack.is_declared(id) {
                    return Err(StackError::Declaration(DeclarationError::UnknownPatchTarget {
                        id: id.clone(),
                    }));
                }
            }

            if stack.is_absent(&patch.resource) {
                debug!("Skipping wiring patch on absent {}", patch.resource);
                continue;
            }

            for dep in &patch.depends_on {
                if stack.is_absent(dep) {
                    debug!("Skipping wiring edge {} -> absent {dep}", patch.resource);
                    continue;
                }
                self.prerequisites
                    .entry(patch.resource.clone())
                    .or_default()
                    .insert(dep.clone());
            }
        }

        self.relayer()
    }

    /// Recomputes the dependents index and the waves.
    fn relayer(&mut self) -> Result<()> {
        let mut dependents: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (id, prereqs) in &self.prerequisites {
            for prereq in prereqs {
                dependents
                    .entry(prereq.clone())
                    .or_default()
                    .insert(id.clone());
            }
        }
        self.dependents = dependents;
        self.waves = layered(&self.order, &self.prerequisites)?;
        Ok(())
    }

    /// Returns the waves in execution order.
    #[must_use]
    pub fn waves(&self) -> &[Wave] {
        &self.waves
    }

    /// Returns the wave index of a resource.
    #[must_use]
    pub fn wave_of(&self, id: &str) -> Option<usize> {
        self.waves
            .iter()
            .find(|w| w.resources.iter().any(|r| r == id))
            .map(|w| w.index)
    }

    /// Returns the direct dependencies of a resource.
    #[must_use]
    pub fn dependencies(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.prerequisites.get(id)
    }

    /// Returns every resource whose dependency chain includes `id`.
    #[must_use]
    pub fn dependents_closure(&self, id: &str) -> BTreeSet<String> {
        closure(id, &self.dependents)
    }

    /// Returns every resource `id` transitively depends on.
    #[must_use]
    pub fn dependency_closure(&self, id: &str) -> BTreeSet<String> {
        closure(id, &self.prerequisites)
    }

    /// Restricts the waves to `target` and its transitive dependencies.
    ///
    /// # Errors
    ///
    /// Returns an error if `target` is not a present resource.
    pub fn scope_to_target(&self, target: &str) -> std::result::Result<Vec<Wave>, DeclarationError> {
        if !self.contains(target) {
            return Err(DeclarationError::UnknownTarget {
                id: target.to_string(),
            });
        }

        let mut scope = self.dependency_closure(target);
        scope.insert(target.to_string());

        let waves = self
            .waves
            .iter()
            .map(|w| w.resources.iter().filter(|r| scope.contains(*r)).cloned().collect::<Vec<_>>())
            .filter(|resources| !resources.is_empty())
            .enumerate()
            .map(|(index, resources)| Wave { index, resources })
            .collect();

        Ok(waves)
    }

    /// Returns true if `id` is a present resource.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.prerequisites.contains_key(id)
    }

    /// Number of resources in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns true if the graph has no resources.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Orders resources for deletion: dependents before their dependencies.
///
/// `records` pairs each id with the ids it depended on when applied.
///
/// # Errors
///
/// Returns a cycle error if the recorded dependencies are cyclic.
pub fn reverse_waves(records: &[(String, BTreeSet<String>)]) -> Result<Vec<Wave>> {
    let nodes: Vec<String> = records.iter().map(|(id, _)| id.clone()).collect();
    let mut prerequisites: HashMap<String, BTreeSet<String>> = HashMap::new();

    // Reversed edges: a dependency must wait for its dependents.
    for (id, depends_on) in records {
        for dep in depends_on {
            prerequisites
                .entry(dep.clone())
                .or_default()
                .insert(id.clone());
        }
    }

    Ok(layered(&nodes, &prerequisites)?)
}

fn closure(start: &str, edges: &HashMap<String, BTreeSet<String>>) -> BTreeSet<String> {
    let mut seen = BTreeSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([start]);

    while let Some(current) = queue.pop_front() {
        let Some(next) = edges.get(current) else {
            continue;
        };
        for id in next {
            if id != start && seen.insert(id.clone()) {
                queue.push_back(id);
            }
        }
    }

    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Properties, ResourceDecl, ResourceKind, StackSettings};
    use serde_json::json;

    fn decl(id: &str, deps: &[&str]) -> ResourceDecl {
        ResourceDecl {
            id: id.to_string(),
            kind: ResourceKind::Custom,
            properties: Properties::new(),
            depends_on: deps.iter().map(ToString::to_string).collect(),
            enabled_if: None,
        }
    }

    fn stack(decls: &[ResourceDecl]) -> Stack {
        Stack::build(&StackSettings::new("web", "dev"), decls).unwrap()
    }

    fn layers(graph: &DependencyGraph) -> Vec<Vec<&str>> {
        graph
            .waves()
            .iter()
            .map(|w| w.resources.iter().map(String::as_str).collect())
            .collect()
    }

    #[test]
    fn test_fan_out_waves() {
        let s = stack(&[decl("a", &[]), decl("b", &["a"]), decl("c", &["a"])]);
        let graph = DependencyGraph::build(&s).unwrap();
        assert_eq!(layers(&graph), vec![vec!["a"], vec!["b", "c"]]);
    }

    #[test]
    fn test_every_resource_after_its_dependencies() {
        let s = stack(&[
            decl("svc", &["taskdef", "tg"]),
            decl("taskdef", &["logs"]),
            decl("logs", &[]),
            decl("tg", &["vpc"]),
            decl("vpc", &[]),
        ]);
        let graph = DependencyGraph::build(&s).unwrap();
        for resource in s.resources() {
            let wave = graph.wave_of(&resource.id).unwrap();
            for dep in &resource.depends_on {
                assert!(graph.wave_of(dep).unwrap() < wave);
            }
        }
        assert_eq!(layers(&graph)[0], vec!["logs", "vpc"]);
    }

    #[test]
    fn test_implicit_edge_from_reference() {
        let mut subnet = decl("subnet", &[]);
        subnet.properties.insert(String::from("vpc_id"), json!("${vpc}"));
        let s = stack(&[subnet, decl("vpc", &[])]);

        let graph = DependencyGraph::build(&s).unwrap();
        assert_eq!(layers(&graph), vec![vec!["vpc"], vec!["subnet"]]);
    }

    #[test]
    fn test_cycle_rejected() {
        let s = stack(&[decl("a", &["b"]), decl("b", &["a"]), decl("c", &[])]);
        let err = DependencyGraph::build(&s).unwrap_err();
        match err {
            StackError::Cycle(cycle) => assert_eq!(cycle.resources, vec!["a", "b"]),
            other => panic!("expected cycle, got {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_cycle() {
        let s = stack(&[decl("a", &["a"])]);
        assert!(matches!(DependencyGraph::build(&s), Err(StackError::Cycle(_))));
    }

    #[test]
    fn test_unknown_dependency() {
        let s = stack(&[decl("a", &["ghost"])]);
        let err = DependencyGraph::build(&s).unwrap_err();
        assert!(matches!(
            err,
            StackError::Declaration(DeclarationError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_unknown_reference() {
        let mut a = decl("a", &[]);
        a.properties.insert(String::from("x"), json!("${ghost.arn}"));
        let err = DependencyGraph::build(&stack(&[a])).unwrap_err();
        assert!(matches!(
            err,
            StackError::Declaration(DeclarationError::UnknownReference { .. })
        ));
    }

    #[test]
    fn test_wiring_patch_adds_edge() {
        let s = stack(&[decl("alb", &[]), decl("ecs", &[])]);
        let patch = WiringPatch {
            resource: String::from("ecs"),
            depends_on: vec![String::from("alb")],
        };
        let graph = DependencyGraph::build_with_patches(&s, &[patch]).unwrap();
        assert_eq!(layers(&graph), vec![vec!["alb"], vec!["ecs"]]);
    }

    #[test]
    fn test_wiring_patch_can_introduce_cycle() {
        let s = stack(&[decl("alb", &[]), decl("ecs", &["alb"])]);
        let patch = WiringPatch {
            resource: String::from("alb"),
            depends_on: vec![String::from("ecs")],
        };
        assert!(matches!(
            DependencyGraph::build_with_patches(&s, &[patch]),
            Err(StackError::Cycle(_))
        ));
    }

    #[test]
    fn test_wiring_patch_on_absent_component_skipped() {
        let mut waf = decl("waf", &[]);
        waf.enabled_if = Some(String::from("enable_waf"));
        let s = stack(&[waf, decl("cdn", &[])]);
        let patch = WiringPatch {
            resource: String::from("cdn"),
            depends_on: vec![String::from("waf")],
        };
        let graph = DependencyGraph::build_with_patches(&s, &[patch]).unwrap();
        assert_eq!(layers(&graph), vec![vec!["cdn"]]);
    }

    #[test]
    fn test_wiring_patch_unknown_id() {
        let s = stack(&[decl("a", &[])]);
        let patch = WiringPatch {
            resource: String::from("ghost"),
            depends_on: vec![String::from("a")],
        };
        assert!(matches!(
            DependencyGraph::build_with_patches(&s, &[patch]),
            Err(StackError::Declaration(DeclarationError::UnknownPatchTarget { .. }))
        ));
    }

    #[test]
    fn test_closures() {
        let s = stack(&[
            decl("vpc", &[]),
            decl("subnet", &["vpc"]),
            decl("alb", &["subnet"]),
            decl("bucket", &[]),
        ]);
        let graph = DependencyGraph::build(&s).unwrap();

        let dependents = graph.dependents_closure("vpc");
        assert_eq!(dependents.len(), 2);
        assert!(dependents.contains("alb"));

        let deps = graph.dependency_closure("alb");
        assert_eq!(deps.len(), 2);
        assert!(deps.contains("vpc"));
        assert!(graph.dependents_closure("bucket").is_empty());
    }

    #[test]
    fn test_scope_to_target() {
        let s = stack(&[
            decl("vpc", &[]),
            decl("subnet", &["vpc"]),
            decl("bucket", &[]),
            decl("alb", &["subnet"]),
        ]);
        let graph = DependencyGraph::build(&s).unwrap();

        let waves = graph.scope_to_target("subnet").unwrap();
        assert_eq!(waves.len(), 2);
        assert_eq!(waves[0].resources, vec!["vpc"]);
        assert_eq!(waves[1].index, 1);
        assert_eq!(waves[1].resources, vec!["subnet"]);

        assert!(matches!(
            graph.scope_to_target("nope"),
            Err(DeclarationError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn test_reverse_waves_delete_dependents_first() {
        let records = vec![
            (String::from("vpc"), BTreeSet::new()),
            (String::from("subnet"), BTreeSet::from([String::from("vpc")])),
            (String::from("alb"), BTreeSet::from([String::from("subnet")])),
        ];
        let waves = reverse_waves(&records).unwrap();
        let order: Vec<&str> = waves
            .iter()
            .flat_map(|w| w.resources.iter().map(String::as_str))
            .collect();
        assert_eq!(order, vec!["alb", "subnet", "vpc"]);
    }
}
