//! State types for tracking applied resources.
//!
//! These types represent the last-applied state of a stack, used to compute
//! diffs and to resolve references to provider identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::config::ConfigHasher;
use crate::error::StateError;
use crate::model::{Properties, Resource, ResourceKind, DEFAULT_OUTPUT};

/// Current version of the state format.
pub const STATE_VERSION: &str = "1.0";

/// Number of history entries kept per stack.
pub const MAX_HISTORY: usize = 100;

/// Provider identifiers of an applied resource (`id`, `arn`, `dns_name`, ...).
pub type Identifiers = BTreeMap<String, String>;

/// The complete state of one stack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackState {
    /// State format version.
    pub version: String,
    /// Stack id.
    pub stack: String,
    /// Applied resources by id.
    #[serde(default)]
    pub records: BTreeMap<String, StateRecord>,
    /// Run history (recent entries).
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    /// When the state was last updated.
    pub last_updated: DateTime<Utc>,
}

/// Last-applied view of a single resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRecord {
    /// Resource id.
    pub resource_id: String,
    /// Resource kind when applied.
    pub kind: ResourceKind,
    /// Declared properties as applied, references unresolved.
    pub applied_properties: Properties,
    /// Identifiers returned by the provider.
    pub provider_identifiers: Identifiers,
    /// Dependencies when applied; used to order deletes.
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Hash of the normalized applied properties.
    #[serde(default)]
    pub properties_hash: String,
    /// Values the references were resolved to when applied, keyed by
    /// reference (`${vpc.id}`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolved_refs: BTreeMap<String, String>,
    /// When the resource was last applied.
    pub applied_at: DateTime<Utc>,
}

/// A single entry in the run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Type of operation.
    pub operation: RunOperation,
    /// Hash of the declaration document.
    pub document_hash: String,
    /// Resources affected.
    pub resources: Vec<String>,
    /// Whether every item succeeded.
    pub success: bool,
    /// Optional error message.
    #[serde(default)]
    pub error: Option<String>,
}

/// Types of recorded operations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOperation {
    /// Plan executed against the provider.
    Apply,
    /// Record dropped without touching the provider.
    Forget,
}

impl StackState {
    /// Creates a new empty stack state.
    #[must_use]
    pub fn new(stack: &str) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            stack: stack.to_string(),
            records: BTreeMap::new(),
            history: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Checks the document for signs of corruption.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Corrupted`] on a version mismatch, a record
    /// stored under a key other than its own id, or a record whose
    /// properties no longer match their hash.
    pub fn verify(&self, expected_stack: &str) -> Result<(), StateError> {
        if self.version != STATE_VERSION {
            return Err(StateError::corrupted(
                expected_stack,
                format!(
                    "unsupported state version {} (expected {STATE_VERSION})",
                    self.version
                ),
            ));
        }

        if self.stack != expected_stack {
            return Err(StateError::corrupted(
                expected_stack,
                format!("document belongs to stack '{}'", self.stack),
            ));
        }

        if let Some((key, record)) = self.records.iter().find(|(k, r)| **k != r.resource_id) {
            return Err(StateError::corrupted(
                expected_stack,
                format!("record '{}' stored under key '{key}'", record.resource_id),
            ));
        }

        let hasher = ConfigHasher::new();
        if let Some(record) = self.records.values().find(|r| {
            !r.properties_hash.is_empty()
                && !ConfigHasher::hashes_match(
                    &r.properties_hash,
                    &hasher.hash_properties(r.kind, &r.applied_properties),
                )
        }) {
            return Err(StateError::corrupted(
                expected_stack,
                format!("properties of '{}' do not match their hash", record.resource_id),
            ));
        }

        Ok(())
    }

    /// Gets a record by resource id.
    #[must_use]
    pub fn record(&self, id: &str) -> Option<&StateRecord> {
        self.records.get(id)
    }

    /// Adds or replaces a record.
    pub fn set_record(&mut self, record: StateRecord) {
        self.records.insert(record.resource_id.clone(), record);
        self.last_updated = Utc::now();
    }

    /// Removes a record by resource id.
    pub fn remove_record(&mut self, id: &str) -> Option<StateRecord> {
        let result = self.records.remove(id);
        if result.is_some() {
            self.last_updated = Utc::now();
        }
        result
    }

    /// Adds a history entry.
    pub fn add_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= MAX_HISTORY {
            self.history.remove(0);
        }
        self.history.push(entry);
        self.last_updated = Utc::now();
    }

    /// Returns all recorded resource ids.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.records.keys().map(String::as_str).collect()
    }
}

impl StateRecord {
    /// Creates a record for a resource the provider just applied.
    #[must_use]
    pub fn applied(resource: &Resource, identifiers: Identifiers, properties_hash: String) -> Self {
        Self {
            resource_id: resource.id.clone(),
            kind: resource.kind,
            applied_properties: resource.properties.clone(),
            provider_identifiers: identifiers,
            depends_on: resource.depends_on.clone(),
            properties_hash,
            resolved_refs: BTreeMap::new(),
            applied_at: Utc::now(),
        }
    }

    /// Sets the values references were resolved to.
    #[must_use]
    pub fn with_resolved_refs(mut self, resolved_refs: BTreeMap<String, String>) -> Self {
        self.resolved_refs = resolved_refs;
        self
    }

    /// Gets a provider identifier by output name.
    #[must_use]
    pub fn identifier(&self, output: &str) -> Option<&str> {
        self.provider_identifiers.get(output).map(String::as_str)
    }

    /// Gets the primary provider identifier.
    #[must_use]
    pub fn primary_id(&self) -> Option<&str> {
        self.identifier(DEFAULT_OUTPUT)
    }
}

impl HistoryEntry {
    /// Creates a new history entry.
    #[must_use]
    pub fn new(operation: RunOperation, document_hash: &str, resources: Vec<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            operation,
            document_hash: document_hash.to_string(),
            resources,
            success: true,
            error: None,
        }
    }

    /// Creates a failed history entry.
    #[must_use]
    pub fn failed(
        operation: RunOperation,
        document_hash: &str,
        resources: Vec<String>,
        error: &str,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::new(operation, document_hash, resources)
        }
    }
}

impl std::fmt::Display for RunOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let op = match self {
            Self::Apply => "apply",
            Self::Forget => "forget",
        };
        write!(f, "{op}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str) -> StateRecord {
        let resource = Resource::new(id, ResourceKind::Vpc).with_property("cidr", json!("10.0.0.0/16"));
        let identifiers = Identifiers::from([(String::from("id"), format!("vpc-{id}"))]);
        let hash = ConfigHasher::new().hash_resource(&resource);
        StateRecord::applied(&resource, identifiers, hash)
    }

    #[test]
    fn test_verify_accepts_consistent_state() {
        let mut state = StackState::new("web-dev");
        state.set_record(record("vpc"));
        assert!(state.verify("web-dev").is_ok());
    }

    #[test]
    fn test_verify_rejects_mismatched_key() {
        let mut state = StackState::new("web-dev");
        state.records.insert(String::from("subnet"), record("vpc"));
        assert!(matches!(
            state.verify("web-dev"),
            Err(StateError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_verify_rejects_tampered_properties() {
        let mut tampered = record("vpc");
        tampered
            .applied_properties
            .insert(String::from("cidr"), json!("10.9.0.0/16"));

        let mut state = StackState::new("web-dev");
        state.set_record(tampered);
        match state.verify("web-dev") {
            Err(StateError::Corrupted { message, .. }) => assert!(message.contains("'vpc'")),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn test_verify_skips_records_without_hash() {
        let resource = Resource::new("legacy", ResourceKind::Bucket);
        let mut state = StackState::new("web-dev");
        state.set_record(StateRecord::applied(&resource, Identifiers::new(), String::new()));
        assert!(state.verify("web-dev").is_ok());
    }

    #[test]
    fn test_verify_rejects_unknown_version() {
        let mut state = StackState::new("web-dev");
        state.version = String::from("9.9");
        assert!(state.verify("web-dev").is_err());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = StackState::new("web-dev");
        for i in 0..(MAX_HISTORY + 5) {
            state.add_history(HistoryEntry::new(RunOperation::Apply, &i.to_string(), vec![]));
        }
        assert_eq!(state.history.len(), MAX_HISTORY);
        assert_eq!(state.history[0].document_hash, "5");
    }

    #[test]
    fn test_primary_id() {
        let record = record("main");
        assert_eq!(record.primary_id(), Some("vpc-main"));
        assert_eq!(record.identifier("arn"), None);
    }
}
