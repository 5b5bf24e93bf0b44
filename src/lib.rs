// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Halldyll Stacks
//!
//! A declarative infrastructure dependency resolver and plan/apply engine.
//!
//! ## Overview
//!
//! A YAML document declares the resources of a stack (network, database,
//! load balancer, containers, CDN, ...). Halldyll:
//!
//! - Builds the dependency graph from explicit `depends_on` lists and
//!   `${resource.output}` references
//! - Orders resources into waves that can be applied concurrently
//! - Diffs the declaration against the last-applied state of each resource
//! - Executes the resulting plan against a provider, committing each
//!   resource to state as soon as it is applied
//!
//! ## Architecture
//!
//! 1. **Declarations**: `halldyll.stack.yaml`, materialized into a [`model::Stack`]
//! 2. **Graph**: [`graph::DependencyGraph`] with wave layering and cycle detection
//! 3. **Plan**: [`planner::Plan`] computed by the diff engine against recorded state
//! 4. **Apply**: [`planner::PlanExecutor`] runs waves on a bounded worker pool
//!
//! ## Modules
//!
//! - [`config`]: Declaration parsing, overrides and validation
//! - [`model`]: Resources, kinds, references and stacks
//! - [`graph`]: Dependency graph and wave ordering
//! - [`planner`]: Diffing, planning and plan execution
//! - [`provider`]: Provider interface and implementations
//! - [`state`]: State storage backends (local, S3, memory)
//! - [`engine`]: Orchestration of plan and apply runs
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! stack:
//!   name: wordpress
//!   environment: production
//!
//! resources:
//!   - id: vpc
//!     kind: vpc
//!     properties:
//!       cidr: 10.0.0.0/16
//!   - id: public-a
//!     kind: subnet
//!     properties:
//!       vpc_id: ${vpc}
//!       cidr: 10.0.1.0/24
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod model;
pub mod planner;
pub mod provider;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackDocument};
pub use engine::{ApplyOptions, ApplyOutcome, Engine};
pub use error::{Result, StackError};
pub use graph::DependencyGraph;
pub use model::{Resource, ResourceKind, Stack};
pub use planner::{AbortSignal, DiffEngine, ExecutionReport, Plan, PlanExecutor};
pub use provider::{HttpProvider, Provider, SimulatedProvider};
pub use state::{LocalStateStore, MemoryStateStore, S3StateStore, StateStore};
