//! Stacks: the ordered set of resources sharing a deployment target.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

use crate::error::DeclarationError;

use super::kind::ResourceKind;
use super::reference;
use super::resource::Resource;
use super::value::Properties;

/// Property under which stack tags are merged.
pub const TAGS_PROPERTY: &str = "tags";

/// Settings passed explicitly into stack construction.
///
/// Tags and feature flags live here instead of in process-wide state, so two
/// planning calls with different settings never observe each other.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackSettings {
    /// Stack name.
    pub name: String,
    /// Environment (e.g., "dev", "production").
    pub environment: String,
    /// Deployment region.
    pub region: Option<String>,
    /// Tags applied to every resource.
    pub tags: BTreeMap<String, String>,
    /// Feature flags for optional components.
    pub flags: BTreeMap<String, bool>,
}

impl StackSettings {
    /// Creates settings for a stack.
    #[must_use]
    pub fn new(name: impl Into<String>, environment: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            environment: environment.into(),
            ..Self::default()
        }
    }

    /// Returns the stack id used as the state key.
    #[must_use]
    pub fn stack_id(&self) -> String {
        format!("{}-{}", self.name, self.environment)
    }

    /// Returns the value of a flag, `false` when undeclared.
    #[must_use]
    pub fn flag(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(false)
    }
}

/// A resource as written in the declaration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDecl {
    /// Unique id within the stack.
    pub id: String,
    /// Resource kind.
    pub kind: ResourceKind,
    /// Desired properties.
    #[serde(default)]
    pub properties: Properties,
    /// Explicit dependencies.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Flag that must be true for the component to exist.
    #[serde(default)]
    pub enabled_if: Option<String>,
}

/// Extra edges added after the graph is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiringPatch {
    /// Resource receiving the dependencies.
    pub resource: String,
    /// Resources it must come after.
    pub depends_on: Vec<String>,
}

/// An optional component: either declared and enabled, or switched off.
#[derive(Debug, Clone, PartialEq)]
pub enum Component {
    /// The component takes part in the run.
    Present(Resource),
    /// The component is switched off by a flag.
    Absent {
        /// Declared id.
        id: String,
        /// Declared kind.
        kind: ResourceKind,
    },
}

impl Component {
    /// Returns the component id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Present(resource) => &resource.id,
            Self::Absent { id, .. } => id,
        }
    }
}

/// The ordered set of resources sharing a deployment target.
#[derive(Debug, Clone)]
pub struct Stack {
    /// Stack id (`<name>-<environment>`).
    id: String,
    /// Settings the stack was built with.
    settings: StackSettings,
    /// Components in declaration order.
    components: Vec<Component>,
    /// Component position by id.
    positions: HashMap<String, usize>,
}

impl Stack {
    /// Builds a stack from declarations.
    ///
    /// Stack tags are merged under each resource's `tags` property (resource
    /// tags win). References to absent components resolve to `null` and
    /// explicit dependencies on them are dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if two declarations share an id.
    pub fn build(settings: &StackSettings, decls: &[ResourceDecl]) -> Result<Self, DeclarationError> {
        let mut positions = HashMap::with_capacity(decls.len());
        for (index, decl) in decls.iter().enumerate() {
            if positions.insert(decl.id.clone(), index).is_some() {
                return Err(DeclarationError::DuplicateId {
                    id: decl.id.clone(),
                });
            }
        }

        let absent: BTreeSet<&str> = decls
            .iter()
            .filter(|d| d.enabled_if.as_deref().is_some_and(|flag| !settings.flag(flag)))
            .map(|d| d.id.as_str())
            .collect();

        let components = decls
            .iter()
            .enumerate()
            .map(|(index, decl)| {
                if absent.contains(decl.id.as_str()) {
                    debug!("Component {} is absent", decl.id);
                    Component::Absent {
                        id: decl.id.clone(),
                        kind: decl.kind,
                    }
                } else {
                    Component::Present(Self::materialize(settings, decl, index, &absent))
                }
            })
            .collect();

        Ok(Self {
            id: settings.stack_id(),
            settings: settings.clone(),
            components,
            positions,
        })
    }

    /// Turns a present declaration into a resource.
    fn materialize(
        settings: &StackSettings,
        decl: &ResourceDecl,
        index: usize,
        absent: &BTreeSet<&str>,
    ) -> Resource {
        let mut lookup = |r: &reference::Reference| {
            absent.contains(r.resource.as_str()).then_some(Value::Null)
        };

        let mut properties: Properties = decl
            .properties
            .iter()
            .map(|(name, value)| (name.clone(), reference::substitute(value, &mut lookup)))
            .collect();

        merge_tags(&mut properties, &settings.tags);

        let depends_on = decl
            .depends_on
            .iter()
            .filter(|dep| {
                let keep = !absent.contains(dep.as_str());
                if !keep {
                    debug!("Dropping dependency of {} on absent {dep}", decl.id);
                }
                keep
            })
            .cloned()
            .collect();

        Resource {
            id: decl.id.clone(),
            kind: decl.kind,
            properties,
            depends_on,
            index,
        }
    }

    /// Returns the stack id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the settings the stack was built with.
    #[must_use]
    pub const fn settings(&self) -> &StackSettings {
        &self.settings
    }

    /// Iterates present resources in declaration order.
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.components.iter().filter_map(|c| match c {
            Component::Present(resource) => Some(resource),
            Component::Absent { .. } => None,
        })
    }

    /// Looks up a present resource.
    #[must_use]
    pub fn resource(&self, id: &str) -> Option<&Resource> {
        match self.positions.get(id).map(|&i| &self.components[i]) {
            Some(Component::Present(resource)) => Some(resource),
            _ => None,
        }
    }

    /// Returns true if `id` is declared but switched off.
    #[must_use]
    pub fn is_absent(&self, id: &str) -> bool {
        matches!(
            self.positions.get(id).map(|&i| &self.components[i]),
            Some(Component::Absent { .. })
        )
    }

    /// Returns true if `id` is declared (present or absent).
    #[must_use]
    pub fn is_declared(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    /// Number of present resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.resources().count()
    }

    /// Returns true if no resource is present.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.resources().next().is_none()
    }
}

/// Merges stack tags under the `tags` property; existing keys win.
fn merge_tags(properties: &mut Properties, tags: &BTreeMap<String, String>) {
    if tags.is_empty() {
        return;
    }

    let entry = properties
        .entry(TAGS_PROPERTY.to_string())
        .or_insert_with(|| Value::Object(serde_json::Map::new()));

    if let Value::Object(map) = entry {
        for (key, value) in tags {
            map.entry(key.clone())
                .or_insert_with(|| Value::String(value.clone()));
        }
    }
}
