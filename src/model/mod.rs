//! Resource model.
//!
//! This module defines what a stack is made of: typed resources, their
//! kinds and comparison rules, references between them, and optional
//! components switched by feature flags.

mod kind;
mod reference;
mod resource;
mod stack;
mod value;

pub use kind::ResourceKind;
pub use reference::{extract as extract_references, substitute as substitute_references, Reference, DEFAULT_OUTPUT};
pub use resource::Resource;
pub use stack::{Component, ResourceDecl, Stack, StackSettings, WiringPatch, TAGS_PROPERTY};
pub use value::{canonical, normalize_properties, normalize_property, property_eq, Properties};
