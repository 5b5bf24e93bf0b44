//! Diff engine for comparing desired properties with last-applied state.
//!
//! Comparison is done on unresolved declarations (references kept as text),
//! after normalization, so that a committed record re-diffed against the
//! same declaration is always a no-op.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::trace;

use crate::model::{property_eq, Properties, Reference, Resource, ResourceKind};
use crate::state::StateRecord;

/// Synthetic property reported when a resource changes kind.
pub const KIND_PROPERTY: &str = "kind";

/// Action required to converge a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// The resource is declared but has no state.
    Create,
    /// At least one compared property differs.
    Update,
    /// The resource has state but is no longer declared.
    Delete,
    /// Nothing to do.
    Noop,
}

/// Old and new value of a changed property.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyChange {
    /// Last-applied value, `None` when added.
    pub old: Option<Value>,
    /// Desired value, `None` when removed.
    pub new: Option<Value>,
}

/// Changed properties by name.
pub type PropertyDiff = BTreeMap<String, PropertyChange>;

/// Difference for a single resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDiff {
    /// Resource id.
    pub resource_id: String,
    /// Desired kind, or recorded kind for deletes.
    pub kind: ResourceKind,
    /// Required action.
    pub action: Action,
    /// Changed properties.
    pub changes: PropertyDiff,
}

/// Engine computing per-resource diffs.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiffEngine;

impl DiffEngine {
    /// Creates a new diff engine.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Compares a declaration with its state record.
    ///
    /// Returns `None` when there is neither.
    #[must_use]
    pub fn diff(&self, desired: Option<&Resource>, record: Option<&StateRecord>) -> Option<ResourceDiff> {
        let diff = match (desired, record) {
            (None, None) => return None,
            (Some(resource), None) => ResourceDiff {
                resource_id: resource.id.clone(),
                kind: resource.kind,
                action: Action::Create,
                changes: resource
                    .properties
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.clone(),
                            PropertyChange {
                                old: None,
                                new: Some(value.clone()),
                            },
                        )
                    })
                    .collect(),
            },
            (None, Some(record)) => ResourceDiff {
                resource_id: record.resource_id.clone(),
                kind: record.kind,
                action: Action::Delete,
                changes: record
                    .applied_properties
                    .iter()
                    .map(|(name, value)| {
                        (
                            name.clone(),
                            PropertyChange {
                                old: Some(value.clone()),
                                new: None,
                            },
                        )
                    })
                    .collect(),
            },
            (Some(resource), Some(record)) => {
                let mut changes =
                    Self::diff_properties(resource.kind, &record.applied_properties, &resource.properties);

                if record.kind != resource.kind {
                    changes.insert(
                        KIND_PROPERTY.to_string(),
                        PropertyChange {
                            old: Some(Value::String(record.kind.to_string())),
                            new: Some(Value::String(resource.kind.to_string())),
                        },
                    );
                }

                let action = if changes.is_empty() {
                    Action::Noop
                } else {
                    Action::Update
                };

                ResourceDiff {
                    resource_id: resource.id.clone(),
                    kind: resource.kind,
                    action,
                    changes,
                }
            }
        };

        trace!("Diff {}: {:?}", diff.resource_id, diff.action);
        Some(diff)
    }

    /// Reports properties whose references now resolve differently than
    /// when `record` was applied.
    ///
    /// `current` gives the value a reference resolves to now, `None` when
    /// it is not known until apply. References without a recorded value
    /// are not compared.
    #[must_use]
    pub fn reference_changes<F>(&self, resource: &Resource, record: &StateRecord, current: F) -> PropertyDiff
    where
        F: Fn(&Reference) -> Option<String>,
    {
        let mut changes = PropertyDiff::new();

        for (name, reference) in resource.references() {
            let Some(applied) = record.resolved_refs.get(&reference.to_string()) else {
                continue;
            };
            let now = current(&reference);
            if now.as_deref() == Some(applied.as_str()) || changes.contains_key(name) {
                continue;
            }
            trace!("{}: {reference} moved from {applied}", resource.id);
            changes.insert(
                name.to_string(),
                PropertyChange {
                    old: Some(Value::String(applied.clone())),
                    new: Some(Value::String(now.unwrap_or_else(|| reference.to_string()))),
                },
            );
        }

        changes
    }

    /// Returns the added, removed and modified properties.
    #[must_use]
    pub fn diff_properties(kind: ResourceKind, old: &Properties, new: &Properties) -> PropertyDiff {
        let names: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

        names
            .into_iter()
            .filter_map(|name| {
                let before = old.get(name);
                let after = new.get(name);
                let unchanged = match (before, after) {
                    (Some(l), Some(r)) => property_eq(kind, name, l, r),
                    _ => false,
                };
                (!unchanged).then(|| {
                    (
                        name.clone(),
                        PropertyChange {
                            old: before.cloned(),
                            new: after.cloned(),
                        },
                    )
                })
            })
            .collect()
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Noop => "noop",
        };
        write!(f, "{s}")
    }
}
