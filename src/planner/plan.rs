//! Execution plan types and construction.
//!
//! A plan is a sequence of waves. Deletes of resources that are no longer
//! declared come first, dependents before their dependencies, and the waves
//! of the dependency graph follow. A removed resource that a declared one
//! still depended on when last applied is deleted after the apply waves
//! instead. Every item inside a wave is independent of the others in that
//! wave.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::config::ConfigHasher;
use crate::error::{DeclarationError, Result, StackError};
use crate::graph::{reverse_waves, DependencyGraph, Wave};
use crate::model::{Resource, ResourceKind, Stack};
use crate::state::StateRecord;

use super::diff::{Action, DiffEngine, PropertyDiff, KIND_PROPERTY};

/// A complete execution plan for one stack.
#[derive(Debug, Clone, Serialize)]
pub struct Plan {
    /// Stack id.
    pub stack: String,
    /// When the plan was created.
    pub created_at: DateTime<Utc>,
    /// Hash of the declaration document the plan was computed from.
    pub document_hash: String,
    /// Resource the plan was scoped to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Waves in execution order.
    pub waves: Vec<PlanWave>,
}

/// Items that may run concurrently.
#[derive(Debug, Clone, Serialize)]
pub struct PlanWave {
    /// Position of the wave in the plan.
    pub index: usize,
    /// Items in stable declaration order.
    pub items: Vec<PlanItem>,
}

/// A single planned action.
#[derive(Debug, Clone, Serialize)]
pub struct PlanItem {
    /// Resource id.
    pub resource_id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Action to take.
    pub action: Action,
    /// Changed properties.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub diff: PropertyDiff,
    /// Items that must succeed before this one may run.
    #[serde(skip_serializing_if = "BTreeSet::is_empty")]
    pub blocked_by: BTreeSet<String>,
    /// Desired resource, references unresolved.
    #[serde(skip)]
    pub desired: Option<Resource>,
    /// Last-applied record.
    #[serde(skip)]
    pub prior: Option<StateRecord>,
    /// Hash of the desired properties.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_hash: Option<String>,
}

/// Item counts by action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    /// Items to create.
    pub create: usize,
    /// Items to update.
    pub update: usize,
    /// Items to delete.
    pub delete: usize,
    /// Items left unchanged.
    pub noop: usize,
}

impl Plan {
    /// Computes the plan for `stack` against the recorded state.
    ///
    /// With a `target`, only the target and its transitive dependencies are
    /// planned. A target that is recorded but no longer declared plans its
    /// delete together with the deletes of removed resources that depended
    /// on it.
    ///
    /// # Errors
    ///
    /// Returns [`DeclarationError::UnknownTarget`] if the target is neither
    /// declared nor recorded, and a cycle error if recorded dependencies of
    /// deleted resources are cyclic.
    pub fn build(
        stack: &Stack,
        graph: &DependencyGraph,
        records: &BTreeMap<String, StateRecord>,
        target: Option<&str>,
        document_hash: &str,
    ) -> Result<Self> {
        let engine = DiffEngine::new();
        let hasher = ConfigHasher::new();

        let (early, late, apply_waves) = match target {
            None => {
                let orphans: BTreeSet<String> = records
                    .keys()
                    .filter(|id| stack.resource(id).is_none())
                    .cloned()
                    .collect();
                let late = Self::still_referenced(stack, records, &orphans);
                let early: BTreeSet<String> = orphans.difference(&late).cloned().collect();
                (early, late, graph.waves().to_vec())
            }
            Some(id) if graph.contains(id) => (
                BTreeSet::new(),
                BTreeSet::new(),
                graph.scope_to_target(id).map_err(StackError::Declaration)?,
            ),
            Some(id) if records.contains_key(id) => {
                (Self::orphan_dependents(stack, records, id), BTreeSet::new(), Vec::new())
            }
            Some(id) => {
                return Err(StackError::Declaration(DeclarationError::UnknownTarget {
                    id: id.to_string(),
                }));
            }
        };

        let planned: BTreeSet<&str> = early
            .iter()
            .chain(&late)
            .map(String::as_str)
            .chain(apply_waves.iter().flat_map(|w| w.resources.iter().map(String::as_str)))
            .collect();

        let mut waves = Vec::new();
        for wave in Self::delete_order(records, &early)? {
            waves.push(Self::delete_items(&engine, records, &planned, &wave));
        }

        // Resources getting new identifiers in this run.
        let mut replaced: BTreeSet<&str> = BTreeSet::new();
        for wave in &apply_waves {
            let items: Vec<PlanItem> = wave
                .resources
                .iter()
                .filter_map(|id| stack.resource(id))
                .filter_map(|resource| {
                    let record = records.get(&resource.id);
                    let mut diff = engine.diff(Some(resource), record)?;

                    if let Some(record) = record {
                        let moved = engine.reference_changes(resource, record, |reference| {
                            if replaced.contains(reference.resource.as_str()) {
                                return None;
                            }
                            records
                                .get(&reference.resource)
                                .and_then(|r| r.identifier(&reference.output))
                                .map(ToString::to_string)
                        });
                        for (name, change) in moved {
                            diff.changes.entry(name).or_insert(change);
                        }
                        if diff.action == Action::Noop && !diff.changes.is_empty() {
                            diff.action = Action::Update;
                        }
                    }

                    Some(PlanItem {
                        resource_id: diff.resource_id,
                        kind: diff.kind,
                        action: diff.action,
                        diff: diff.changes,
                        blocked_by: graph.dependencies(&resource.id).cloned().unwrap_or_default(),
                        desired: Some(resource.clone()),
                        prior: record.cloned(),
                        new_hash: Some(hasher.hash_resource(resource)),
                    })
                })
                .collect();

            replaced.extend(
                items
                    .iter()
                    .filter(|i| {
                        i.action == Action::Create
                            || (i.action == Action::Update && i.diff.contains_key(KIND_PROPERTY))
                    })
                    .filter_map(|i| stack.resource(&i.resource_id))
                    .map(|r| r.id.as_str()),
            );
            waves.push(items);
        }

        for wave in Self::delete_order(records, &late)? {
            waves.push(Self::delete_items(&engine, records, &planned, &wave));
        }

        let waves: Vec<PlanWave> = waves
            .into_iter()
            .filter(|items: &Vec<PlanItem>| !items.is_empty())
            .enumerate()
            .map(|(index, items)| PlanWave { index, items })
            .collect();

        let plan = Self {
            stack: stack.id().to_string(),
            created_at: Utc::now(),
            document_hash: document_hash.to_string(),
            target: target.map(ToString::to_string),
            waves,
        };

        let summary = plan.summary();
        debug!(
            "Planned {}: {} create, {} update, {} delete, {} unchanged in {} waves",
            plan.stack,
            summary.create,
            summary.update,
            summary.delete,
            summary.noop,
            plan.waves.len()
        );

        Ok(plan)
    }

    /// Undeclared records that a declared record still depends on, with
    /// their recorded dependencies. They are deleted after the apply waves.
    fn still_referenced(
        stack: &Stack,
        records: &BTreeMap<String, StateRecord>,
        orphans: &BTreeSet<String>,
    ) -> BTreeSet<String> {
        let mut late: BTreeSet<String> = BTreeSet::new();
        let mut queue: Vec<&String> = records
            .values()
            .filter(|r| stack.resource(&r.resource_id).is_some())
            .flat_map(|r| r.depends_on.iter())
            .filter(|dep| orphans.contains(*dep))
            .collect();

        while let Some(id) = queue.pop() {
            if !late.insert(id.clone()) {
                continue;
            }
            if let Some(record) = records.get(id) {
                queue.extend(record.depends_on.iter().filter(|dep| orphans.contains(*dep)));
            }
        }

        late
    }

    /// `target` plus every undeclared record whose recorded dependencies
    /// lead to it.
    fn orphan_dependents(stack: &Stack, records: &BTreeMap<String, StateRecord>, target: &str) -> BTreeSet<String> {
        let mut doomed = BTreeSet::from([target.to_string()]);
        loop {
            let next: Vec<String> = records
                .values()
                .filter(|r| {
                    stack.resource(&r.resource_id).is_none()
                        && !doomed.contains(&r.resource_id)
                        && r.depends_on.iter().any(|dep| doomed.contains(dep))
                })
                .map(|r| r.resource_id.clone())
                .collect();
            if next.is_empty() {
                return doomed;
            }
            doomed.extend(next);
        }
    }

    /// Orders deletes of `ids`, dependents before their dependencies.
    fn delete_order(records: &BTreeMap<String, StateRecord>, ids: &BTreeSet<String>) -> Result<Vec<Wave>> {
        let subset: Vec<(String, BTreeSet<String>)> = ids
            .iter()
            .filter_map(|id| records.get(id))
            .map(|r| (r.resource_id.clone(), r.depends_on.clone()))
            .collect();
        reverse_waves(&subset)
    }

    fn delete_items(
        engine: &DiffEngine,
        records: &BTreeMap<String, StateRecord>,
        planned: &BTreeSet<&str>,
        wave: &Wave,
    ) -> Vec<PlanItem> {
        let deleting: BTreeSet<&str> = wave.resources.iter().map(String::as_str).collect();
        wave.resources
            .iter()
            .filter_map(|id| records.get(id))
            .filter_map(|record| {
                let diff = engine.diff(None, Some(record))?;
                // Recorded dependents handled in earlier waves.
                let blocked_by = records
                    .values()
                    .filter(|other| {
                        other.depends_on.contains(&record.resource_id)
                            && !deleting.contains(other.resource_id.as_str())
                            && planned.contains(other.resource_id.as_str())
                    })
                    .map(|other| other.resource_id.clone())
                    .collect();
                Some(PlanItem {
                    resource_id: diff.resource_id,
                    kind: diff.kind,
                    action: diff.action,
                    diff: diff.changes,
                    blocked_by,
                    desired: None,
                    prior: Some(record.clone()),
                    new_hash: None,
                })
            })
            .collect()
    }

    /// Iterates over every item in execution order.
    pub fn items(&self) -> impl Iterator<Item = &PlanItem> {
        self.waves.iter().flat_map(|w| w.items.iter())
    }

    /// Gets the item for a resource.
    #[must_use]
    pub fn item(&self, resource_id: &str) -> Option<&PlanItem> {
        self.items().find(|i| i.resource_id == resource_id)
    }

    /// Counts items by action.
    #[must_use]
    pub fn summary(&self) -> PlanSummary {
        self.items().fold(PlanSummary::default(), |mut acc, item| {
            match item.action {
                Action::Create => acc.create += 1,
                Action::Update => acc.update += 1,
                Action::Delete => acc.delete += 1,
                Action::Noop => acc.noop += 1,
            }
            acc
        })
    }

    /// Returns true if applying the plan would change anything.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.items().any(|i| i.action != Action::Noop)
    }

    /// Number of items, unchanged ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items().count()
    }

    /// Returns true if the plan has no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.waves.is_empty()
    }
}

impl PlanSummary {
    /// Number of items that change something.
    #[must_use]
    pub const fn changes(&self) -> usize {
        self.create + self.update + self.delete
    }
}

impl PlanItem {
    /// Returns a human-readable description of the item.
    #[must_use]
    pub fn description(&self) -> String {
        match self.action {
            Action::Create => format!("Create {} '{}'", self.kind, self.resource_id),
            Action::Update => format!(
                "Update {} '{}' ({})",
                self.kind,
                self.resource_id,
                self.diff.keys().cloned().collect::<Vec<_>>().join(", ")
            ),
            Action::Delete => format!("Delete {} '{}'", self.kind, self.resource_id),
            Action::Noop => format!("No change for '{}'", self.resource_id),
        }
    }
}

impl std::fmt::Display for PlanItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

impl std::fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete, {} unchanged",
            self.create, self.update, self.delete, self.noop
        )
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.has_changes() {
            return write!(f, "No changes required");
        }

        writeln!(f, "Plan for {} ({}):", self.stack, self.summary())?;
        for wave in &self.waves {
            writeln!(f, "  Wave {}:", wave.index)?;
            for item in wave.items.iter().filter(|i| i.action != Action::Noop) {
                writeln!(f, "    {item}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceDecl, StackSettings};
    use crate::state::Identifiers;
    use serde_json::json;

    fn decl(id: &str, deps: &[&str]) -> ResourceDecl {
        ResourceDecl {
            id: id.to_string(),
            kind: ResourceKind::Custom,
            properties: crate::model::Properties::from([(String::from("name"), json!(id))]),
            depends_on: deps.iter().map(ToString::to_string).collect(),
            enabled_if: None,
        }
    }

    fn stack(decls: &[ResourceDecl]) -> Stack {
        Stack::build(&StackSettings::new("web", "dev"), decls).unwrap()
    }

    fn records_for(stack: &Stack) -> BTreeMap<String, StateRecord> {
        stack
            .resources()
            .map(|r| {
                (
                    r.id.clone(),
                    StateRecord::applied(r, Identifiers::new(), String::new()),
                )
            })
            .collect()
    }

    fn plan(stack: &Stack, records: &BTreeMap<String, StateRecord>, target: Option<&str>) -> Result<Plan> {
        let graph = DependencyGraph::build(stack)?;
        Plan::build(stack, &graph, records, target, "hash")
    }

    fn actions(plan: &Plan) -> Vec<Vec<(&str, Action)>> {
        plan.waves
            .iter()
            .map(|w| w.items.iter().map(|i| (i.resource_id.as_str(), i.action)).collect())
            .collect()
    }

    #[test]
    fn test_fresh_stack_creates_in_waves() {
        let s = stack(&[decl("a", &[]), decl("b", &["a"]), decl("c", &["a"])]);
        let plan = plan(&s, &BTreeMap::new(), None).unwrap();

        assert_eq!(
            actions(&plan),
            vec![
                vec![("a", Action::Create)],
                vec![("b", Action::Create), ("c", Action::Create)],
            ]
        );
        assert_eq!(plan.item("b").unwrap().blocked_by, BTreeSet::from([String::from("a")]));
        assert!(plan.item("a").unwrap().new_hash.is_some());
    }

    #[test]
    fn test_applied_stack_is_all_noop() {
        let s = stack(&[decl("a", &[]), decl("b", &["a"])]);
        let plan = plan(&s, &records_for(&s), None).unwrap();
        assert!(!plan.has_changes());
        assert_eq!(plan.summary().noop, 2);
        assert_eq!(plan.to_string(), "No changes required");
    }

    #[test]
    fn test_deletes_run_first_dependents_before_dependencies() {
        let old = stack(&[decl("vpc", &[]), decl("subnet", &["vpc"]), decl("bucket", &[])]);
        let records = records_for(&old);
        let s = stack(&[decl("bucket", &[]), decl("cdn", &["bucket"])]);

        let plan = plan(&s, &records, None).unwrap();
        assert_eq!(
            actions(&plan),
            vec![
                vec![("subnet", Action::Delete)],
                vec![("vpc", Action::Delete)],
                vec![("bucket", Action::Noop)],
                vec![("cdn", Action::Create)],
            ]
        );
        assert_eq!(
            plan.item("vpc").unwrap().blocked_by,
            BTreeSet::from([String::from("subnet")])
        );
        assert_eq!(plan.summary().delete, 2);
    }

    #[test]
    fn test_target_scopes_to_dependencies() {
        let s = stack(&[
            decl("vpc", &[]),
            decl("subnet", &["vpc"]),
            decl("bucket", &[]),
            decl("alb", &["subnet"]),
        ]);
        let mut records = BTreeMap::new();
        records.insert(
            String::from("old"),
            StateRecord::applied(&crate::model::Resource::new("old", ResourceKind::Custom), Identifiers::new(), String::new()),
        );

        let plan = plan(&s, &records, Some("subnet")).unwrap();
        assert_eq!(
            actions(&plan),
            vec![vec![("vpc", Action::Create)], vec![("subnet", Action::Create)]]
        );
        assert_eq!(plan.target.as_deref(), Some("subnet"));
    }

    #[test]
    fn test_target_only_in_state_plans_its_delete() {
        let old = stack(&[decl("a", &[]), decl("gone", &[])]);
        let s = stack(&[decl("a", &[])]);

        let plan = plan(&s, &records_for(&old), Some("gone")).unwrap();
        assert_eq!(actions(&plan), vec![vec![("gone", Action::Delete)]]);
    }

    #[test]
    fn test_unknown_target() {
        let s = stack(&[decl("a", &[])]);
        let err = plan(&s, &BTreeMap::new(), Some("ghost")).unwrap_err();
        assert!(matches!(
            err,
            StackError::Declaration(DeclarationError::UnknownTarget { .. })
        ));
    }

    #[test]
    fn test_update_reports_changed_properties() {
        let old = stack(&[decl("a", &[])]);
        let mut changed = decl("a", &[]);
        changed.properties.insert(String::from("size"), json!(2));
        let s = stack(&[changed]);

        let plan = plan(&s, &records_for(&old), None).unwrap();
        let item = plan.item("a").unwrap();
        assert_eq!(item.action, Action::Update);
        assert_eq!(item.diff.keys().collect::<Vec<_>>(), vec!["size"]);
        assert!(item.prior.is_some());
        assert!(plan.to_string().contains("Update custom 'a' (size)"));
    }

    #[test]
    fn test_disabled_component_with_state_is_deleted() {
        let old = stack(&[decl("waf", &[]), decl("cdn", &[])]);
        let mut waf = decl("waf", &[]);
        waf.enabled_if = Some(String::from("enable_waf"));
        let s = stack(&[waf, decl("cdn", &[])]);

        let plan = plan(&s, &records_for(&old), None).unwrap();
        assert_eq!(plan.item("waf").unwrap().action, Action::Delete);
        assert_eq!(plan.item("cdn").unwrap().action, Action::Noop);
    }

    #[test]
    fn test_target_only_in_state_takes_removed_dependents_along() {
        let old = stack(&[decl("vpc", &[]), decl("subnet", &["vpc"]), decl("bucket", &[])]);
        let s = stack(&[decl("bucket", &[])]);

        let plan = plan(&s, &records_for(&old), Some("vpc")).unwrap();
        assert_eq!(
            actions(&plan),
            vec![vec![("subnet", Action::Delete)], vec![("vpc", Action::Delete)]]
        );
        assert_eq!(
            plan.item("vpc").unwrap().blocked_by,
            BTreeSet::from([String::from("subnet")])
        );
    }

    #[test]
    fn test_delete_waits_for_dependents_still_declared() {
        let mut cdn = decl("cdn", &["waf"]);
        cdn.properties.insert(String::from("web_acl"), json!("${waf.arn}"));
        let old = stack(&[decl("waf", &[]), cdn, decl("logs", &[])]);

        let mut waf = decl("waf", &[]);
        waf.enabled_if = Some(String::from("enable_waf"));
        let s = stack(&[waf, decl("cdn", &[])]);

        let plan = plan(&s, &records_for(&old), None).unwrap();
        assert_eq!(
            actions(&plan),
            vec![
                vec![("logs", Action::Delete)],
                vec![("cdn", Action::Update)],
                vec![("waf", Action::Delete)],
            ]
        );
        assert_eq!(
            plan.item("waf").unwrap().blocked_by,
            BTreeSet::from([String::from("cdn")])
        );
    }

    #[test]
    fn test_dependent_of_recreated_resource_is_updated() {
        let mut b = decl("b", &["a"]);
        b.properties.insert(String::from("parent"), json!("${a}"));
        let s = stack(&[decl("a", &[]), b, decl("c", &["a"])]);

        let ids = |id: &str| Identifiers::from([(String::from("id"), id.to_string())]);
        let mut records: BTreeMap<String, StateRecord> = s
            .resources()
            .map(|r| (r.id.clone(), StateRecord::applied(r, ids(&format!("{}-1", r.id)), String::new())))
            .collect();
        if let Some(record) = records.get_mut("b") {
            record.resolved_refs = BTreeMap::from([(String::from("${a.id}"), String::from("a-1"))]);
        }

        let unchanged = plan(&s, &records, None).unwrap();
        assert!(!unchanged.has_changes());

        let mut moved = records.clone();
        if let Some(record) = moved.get_mut("a") {
            record.provider_identifiers = ids("a-2");
        }
        let plan_moved = plan(&s, &moved, None).unwrap();
        let item = plan_moved.item("b").unwrap();
        assert_eq!(item.action, Action::Update);
        assert_eq!(item.diff["parent"].old, Some(json!("a-1")));
        assert_eq!(item.diff["parent"].new, Some(json!("a-2")));
        assert_eq!(plan_moved.item("c").unwrap().action, Action::Noop);

        let mut forgotten = records;
        forgotten.remove("a");
        let plan_forgotten = plan(&s, &forgotten, None).unwrap();
        assert_eq!(
            actions(&plan_forgotten),
            vec![
                vec![("a", Action::Create)],
                vec![("b", Action::Update), ("c", Action::Noop)],
            ]
        );
        assert_eq!(plan_forgotten.item("b").unwrap().diff["parent"].new, Some(json!("${a.id}")));
    }
}
