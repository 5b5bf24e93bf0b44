//! The declared resource type.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

use super::kind::ResourceKind;
use super::reference::{self, Reference};
use super::value::Properties;

/// A single declared infrastructure unit.
///
/// Resources are rebuilt from declarations on every run and are not mutated
/// during a planning pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Unique id within the stack.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Desired properties, with references kept as `${...}` text.
    pub properties: Properties,
    /// Explicit dependencies.
    pub depends_on: BTreeSet<String>,
    /// Position in the declaration document.
    #[serde(skip)]
    pub index: usize,
}

impl Resource {
    /// Creates a resource with no properties.
    #[must_use]
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            properties: Properties::new(),
            depends_on: BTreeSet::new(),
            index: 0,
        }
    }

    /// Adds a property.
    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.properties.insert(name.into(), value);
        self
    }

    /// Adds an explicit dependency.
    #[must_use]
    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Sets the declaration position.
    #[must_use]
    pub const fn at_index(mut self, index: usize) -> Self {
        self.index = index;
        self
    }

    /// Returns every `(property, reference)` pair found in the properties.
    #[must_use]
    pub fn references(&self) -> Vec<(&str, Reference)> {
        self.properties
            .iter()
            .flat_map(|(name, value)| {
                reference::extract(value)
                    .into_iter()
                    .map(move |r| (name.as_str(), r))
            })
            .collect()
    }

    /// Ids this resource references through its properties.
    #[must_use]
    pub fn referenced_ids(&self) -> BTreeSet<String> {
        self.references()
            .into_iter()
            .map(|(_, r)| r.resource)
            .collect()
    }
}
