//! Declaration validation.
//!
//! This module checks a stack document for invalid or inconsistent values
//! before any graph is built, collecting every problem instead of stopping at
//! the first one.

use crate::error::{DeclarationError, Result, StackError};
use crate::model::{extract_references, ResourceKind};
use std::collections::HashSet;
use tracing::debug;

use super::spec::{
    ExecutorConfig, ProviderConfig, ProviderKind, StackConfig, StackDocument, StateBackend,
    StateConfig,
};

/// Parallelism above which a warning is emitted.
const PARALLELISM_WARN_THRESHOLD: usize = 64;

/// Validator for stack documents.
#[derive(Debug, Default)]
pub struct ConfigValidator {
    /// Whether missing expected properties produce warnings.
    check_expected_properties: bool,
}

/// Validation result containing all errors found.
#[derive(Debug, Default)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            check_expected_properties: true,
        }
    }

    /// Disables warnings about missing kind-specific properties.
    #[must_use]
    pub const fn without_property_hints(mut self) -> Self {
        self.check_expected_properties = false;
        self
    }

    /// Validates a stack document.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any were found.
    pub fn validate(&self, doc: &StackDocument) -> Result<ValidationResult> {
        let result = self.check(doc);

        if result.errors.is_empty() {
            debug!("Declaration validation passed");
            Ok(result)
        } else {
            let first_error = &result.errors[0];
            Err(StackError::Declaration(DeclarationError::validation(
                first_error.message.clone(),
                first_error.field.clone(),
            )))
        }
    }

    /// Runs every check and returns all errors and warnings.
    #[must_use]
    pub fn check(&self, doc: &StackDocument) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_stack(&doc.stack, &mut result);
        Self::validate_state(&doc.state, &mut result);
        Self::validate_provider(&doc.provider, &mut result);
        Self::validate_executor(&doc.executor, &mut result);
        self.validate_resources(doc, &mut result);
        Self::validate_wiring(doc, &mut result);

        result
    }

    /// Validates stack configuration.
    fn validate_stack(stack: &StackConfig, result: &mut ValidationResult) {
        if stack.name.is_empty() {
            result.error("stack.name", "Stack name cannot be empty");
        } else if !is_valid_name(&stack.name) {
            result.error(
                "stack.name",
                format!(
                    "Stack name '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    stack.name
                ),
            );
        }

        if stack.environment.is_empty() {
            result.error("stack.environment", "Environment cannot be empty");
        } else if !is_valid_name(&stack.environment) {
            result.error(
                "stack.environment",
                format!(
                    "Environment '{}' is invalid. Must be lowercase alphanumeric with hyphens.",
                    stack.environment
                ),
            );
        }
    }

    /// Validates state configuration.
    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {
                if state.bucket.is_some() {
                    result
                        .warnings
                        .push(String::from("state.bucket: ignored by the local backend"));
                }
            }
        }
    }

    /// Validates provider configuration.
    fn validate_provider(provider: &ProviderConfig, result: &mut ValidationResult) {
        if provider.timeout_secs == 0 {
            result.error("provider.timeout_secs", "Provider timeout must be at least 1 second");
        }

        match provider.kind {
            ProviderKind::Http => match provider.endpoint.as_deref() {
                None | Some("") => {
                    result.error("provider.endpoint", "Endpoint is required for the http provider");
                }
                Some(endpoint)
                    if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") =>
                {
                    result.error(
                        "provider.endpoint",
                        format!("Endpoint '{endpoint}' must start with http:// or https://"),
                    );
                }
                Some(_) => {}
            },
            ProviderKind::Simulated => {
                if provider.endpoint.is_some() {
                    result.warnings.push(String::from(
                        "provider.endpoint: ignored by the simulated provider",
                    ));
                }
            }
        }
    }

    /// Validates executor settings.
    fn validate_executor(executor: &ExecutorConfig, result: &mut ValidationResult) {
        if executor.max_parallel == 0 {
            result.error("executor.max_parallel", "Parallelism must be at least 1");
        } else if executor.max_parallel > PARALLELISM_WARN_THRESHOLD {
            result.warnings.push(format!(
                "executor.max_parallel: {} concurrent provider calls may trigger throttling",
                executor.max_parallel
            ));
        }

        if executor.max_attempts == 0 {
            result.error("executor.max_attempts", "At least one attempt is required");
        }

        if executor.initial_backoff_ms > executor.max_backoff_ms {
            result.error(
                "executor.initial_backoff_ms",
                format!(
                    "Initial backoff ({}ms) exceeds max backoff ({}ms)",
                    executor.initial_backoff_ms, executor.max_backoff_ms
                ),
            );
        }
    }

    /// Validates every resource declaration.
    fn validate_resources(&self, doc: &StackDocument, result: &mut ValidationResult) {
        if doc.resources.is_empty() {
            result.warnings.push(String::from("No resources declared"));
            return;
        }

        let declared: HashSet<&str> = doc.resources.iter().map(|r| r.id.as_str()).collect();
        let mut seen_ids = HashSet::new();

        for (i, resource) in doc.resources.iter().enumerate() {
            let prefix = format!("resources[{i}]");

            if !seen_ids.insert(resource.id.as_str()) {
                result.error(
                    format!("{prefix}.id"),
                    format!("Duplicate resource id: {}", resource.id),
                );
            }

            if !is_valid_id(&resource.id) {
                result.error(
                    format!("{prefix}.id"),
                    format!(
                        "Resource id '{}' is invalid. Must be lowercase alphanumeric with hyphens or underscores.",
                        resource.id
                    ),
                );
            }

            for dep in &resource.depends_on {
                if !declared.contains(dep.as_str()) {
                    result.error(
                        format!("{prefix}.depends_on"),
                        format!("Resource '{}' depends on unknown resource '{dep}'", resource.id),
                    );
                }
            }

            for (name, value) in &resource.properties {
                for reference in extract_references(value) {
                    if !declared.contains(reference.resource.as_str()) {
                        result.error(
                            format!("{prefix}.properties.{name}"),
                            format!(
                                "Resource '{}' references unknown resource '{}'",
                                resource.id, reference.resource
                            ),
                        );
                    }
                }
            }

            if let Some(flag) = &resource.enabled_if
                && !doc.flags.contains_key(flag)
            {
                result.warnings.push(format!(
                    "{prefix}.enabled_if: flag '{flag}' is not declared and counts as false"
                ));
            }

            if self.check_expected_properties {
                Self::check_expected(resource.kind, &resource.properties, &prefix, result);
            }
        }
    }

    /// Warns about properties a kind usually needs.
    fn check_expected(
        kind: ResourceKind,
        properties: &crate::model::Properties,
        prefix: &str,
        result: &mut ValidationResult,
    ) {
        for expected in kind.expected_properties() {
            if !properties.contains_key(*expected) {
                result.warnings.push(format!(
                    "{prefix}.properties: {kind} usually declares '{expected}'"
                ));
            }
        }
    }

    /// Validates wiring patches.
    fn validate_wiring(doc: &StackDocument, result: &mut ValidationResult) {
        let declared: HashSet<&str> = doc.resources.iter().map(|r| r.id.as_str()).collect();

        for (i, patch) in doc.wiring.iter().enumerate() {
            let prefix = format!("wiring[{i}]");

            if !declared.contains(patch.resource.as_str()) {
                result.error(
                    format!("{prefix}.resource"),
                    format!("Wiring patch references unknown resource '{}'", patch.resource),
                );
            }

            for dep in &patch.depends_on {
                if !declared.contains(dep.as_str()) {
                    result.error(
                        format!("{prefix}.depends_on"),
                        format!("Wiring patch references unknown resource '{dep}'"),
                    );
                }
            }

            if patch.depends_on.is_empty() {
                result
                    .warnings
                    .push(format!("{prefix}: patch on '{}' adds no edges", patch.resource));
            }
        }
    }
}

/// Validates that a name follows the naming convention.
/// Names must be lowercase alphanumeric with hyphens, starting with a letter.
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() {
        return false;
    }

    let mut chars = name.chars();

    // First character must be a letter
    if let Some(first) = chars.next()
        && !first.is_ascii_lowercase()
    {
        return false;
    }

    // Rest must be lowercase alphanumeric or hyphen
    for c in chars {
        if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
            return false;
        }
    }

    // Cannot end with hyphen
    if name.ends_with('-') {
        return false;
    }

    // Cannot have consecutive hyphens
    if name.contains("--") {
        return false;
    }

    true
}

/// Resource ids also allow underscores, matching the reference syntax.
fn is_valid_id(id: &str) -> bool {
    let mut chars = id.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

impl ValidationResult {
    /// Returns true if validation passed (no errors).
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns the number of errors.
    #[must_use]
    pub const fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Returns the number of warnings.
    #[must_use]
    pub const fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    fn error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}
