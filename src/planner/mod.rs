//! Planning module for stack operations.
//!
//! This module compares declared resources with recorded state, turns the
//! differences into wave-ordered plans, and executes those plans against a
//! provider.

mod diff;
mod plan;
mod executor;

pub use diff::{Action, DiffEngine, PropertyChange, PropertyDiff, ResourceDiff, KIND_PROPERTY};
pub use plan::{Plan, PlanItem, PlanSummary, PlanWave};
pub use executor::{
    AbortSignal, ExecutionReport, ExecutionSummary, ItemReport, ItemStatus, PlanExecutor, RetryPolicy,
};
