//! Error types for the Halldyll stack engine.
//!
//! This module provides the error hierarchy for every phase of a run:
//! reading declarations, building the dependency graph, talking to the
//! provider, and persisting state.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// The main error type for the Halldyll stack engine.
#[derive(Debug, Error)]
pub enum StackError {
    /// Malformed or inconsistent declarations.
    #[error("Declaration error: {0}")]
    Declaration(#[from] DeclarationError),

    /// The dependency relation is not acyclic.
    #[error("{0}")]
    Cycle(#[from] CycleError),

    /// Provider errors that escaped a single plan item.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Planning and execution errors.
    #[error("Plan error: {0}")]
    Plan(#[from] PlanError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors in the declaration document, reported before planning.
#[derive(Debug, Error)]
pub enum DeclarationError {
    /// The declaration file was not found.
    #[error("Declaration file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The declaration file could not be parsed.
    #[error("Failed to parse declarations: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Declaration validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Two resources share an id.
    #[error("Duplicate resource id: {id}")]
    DuplicateId {
        /// The duplicated id.
        id: String,
    },

    /// A resource depends on an id that is not declared.
    #[error("Resource '{resource}' depends on unknown resource '{dependency}'")]
    UnknownDependency {
        /// The declaring resource.
        resource: String,
        /// The missing dependency.
        dependency: String,
    },

    /// A property references an id that is not declared.
    #[error("Resource '{resource}' property '{property}' references unknown resource '{reference}'")]
    UnknownReference {
        /// The declaring resource.
        resource: String,
        /// Property holding the reference.
        property: String,
        /// The referenced id.
        reference: String,
    },

    /// A wiring patch names an id that is not declared.
    #[error("Wiring patch references unknown resource '{id}'")]
    UnknownPatchTarget {
        /// The missing id.
        id: String,
    },

    /// `--target` names an id that is neither declared nor recorded.
    #[error("Target resource not found: {id}")]
    UnknownTarget {
        /// The requested target.
        id: String,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },
}

/// The dependency relation contains a cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Dependency cycle detected among resources: {}", resources.join(", "))]
pub struct CycleError {
    /// Resources participating in (or trapped between) cycles, in declaration order.
    pub resources: Vec<String>,
}

/// Errors returned by a provider for a single resource action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// A transient failure (throttling, timeouts); retried with backoff.
    #[error("Transient provider failure for '{resource}': {message}")]
    Transient {
        /// Resource the action was for.
        resource: String,
        /// Description from the provider.
        message: String,
        /// Provider hint for when to retry.
        retry_after: Option<Duration>,
    },

    /// A permanent failure; fails the plan item.
    #[error("Provider rejected '{resource}': {message}")]
    Permanent {
        /// Resource the action was for.
        resource: String,
        /// Description from the provider.
        message: String,
    },

    /// The provider does not know the resource.
    #[error("Resource '{resource}' not found at provider")]
    NotFound {
        /// Resource the action was for.
        resource: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// Stored state cannot be trusted; operations on the stack halt.
    #[error("State for stack '{stack}' is corrupted: {message}")]
    Corrupted {
        /// Affected stack.
        stack: String,
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another process.
    #[error("State is locked by another process (lock holder: {holder}, since: {since})")]
    LockedByOther {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// Reading or writing the local state failed.
    #[error("State storage error: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },

    /// S3 backend error.
    #[error("S3 state backend error: {message}")]
    S3Error {
        /// Description of the S3 error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Planning and execution errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The run was aborted before completion.
    #[error("Run aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },

    /// A property reference could not be resolved at apply time.
    #[error("Resource '{resource}' has unresolved reference '{reference}'")]
    UnresolvedReference {
        /// Resource holding the reference.
        resource: String,
        /// The reference text.
        reference: String,
    },
}

/// Result type alias for Halldyll operations.
pub type Result<T> = std::result::Result<T, StackError>;

impl StackError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error must halt all work on the stack.
    #[must_use]
    pub const fn is_fatal_for_stack(&self) -> bool {
        matches!(
            self,
            Self::Cycle(_)
                | Self::State(StateError::Corrupted { .. } | StateError::VersionMismatch { .. })
        )
    }
}

impl DeclarationError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl ProviderError {
    /// Creates a transient error.
    #[must_use]
    pub fn transient(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            resource: resource.into(),
            message: message.into(),
            retry_after: None,
        }
    }

    /// Creates a permanent error.
    #[must_use]
    pub fn permanent(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Returns true if the action may succeed when retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns the provider's retry hint, if any.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Returns the resource id the error is about.
    #[must_use]
    pub fn resource(&self) -> &str {
        match self {
            Self::Transient { resource, .. }
            | Self::Permanent { resource, .. }
            | Self::NotFound { resource } => resource,
        }
    }
}

impl StateError {
    /// Creates an S3 error with the given message.
    #[must_use]
    pub fn s3(message: impl Into<String>) -> Self {
        Self::S3Error {
            message: message.into(),
        }
    }

    /// Creates a storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error for a stack.
    #[must_use]
    pub fn corrupted(stack: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupted {
            stack: stack.into(),
            message: message.into(),
        }
    }
}
