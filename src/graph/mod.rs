//! Dependency graph builder.
//!
//! Turns a stack into waves: ordered groups of resources where every
//! resource's dependencies lie in strictly earlier waves. Edges come from
//! explicit `depends_on`, from `${...}` references in properties, and from
//! wiring patches applied after the base graph is built.

mod builder;
mod order;

pub use builder::{reverse_waves, DependencyGraph};
pub use order::{layered, Wave};
