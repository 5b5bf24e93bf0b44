//! State store trait definition.
//!
//! This module defines the common interface for state storage backends.
//! Backends only provide whole-document load and save; per-resource commits
//! are read-modify-write cycles serialized by the backend's write guard.

use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Result, StackError, StateError};

use super::lock::LockInfo;
use super::types::{HistoryEntry, StackState, StateRecord};

/// Trait for state storage backends.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Loads the full state document of a stack.
    ///
    /// Returns `None` if no state exists yet.
    async fn load_state(&self, stack: &str) -> Result<Option<StackState>>;

    /// Replaces the full state document of a stack atomically.
    async fn save_state(&self, state: &StackState) -> Result<()>;

    /// Lists stacks that have state.
    async fn list_stacks(&self) -> Result<Vec<String>>;

    /// Guard serializing read-modify-write cycles.
    fn write_guard(&self) -> &Mutex<()>;

    /// Acquires a lock on a stack.
    ///
    /// Returns lock information if successful.
    async fn acquire_lock(&self, stack: &str, holder: &str) -> Result<LockInfo>;

    /// Releases a lock on a stack if `lock_id` matches.
    async fn release_lock(&self, stack: &str, lock_id: &str) -> Result<()>;

    /// Removes any lock on a stack.
    async fn force_unlock(&self, stack: &str) -> Result<()>;

    /// Gets current lock information if locked.
    async fn lock_info(&self, stack: &str) -> Result<Option<LockInfo>>;

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;

    /// Loads the records of a stack, keyed by resource id.
    async fn load(&self, stack: &str) -> Result<BTreeMap<String, StateRecord>> {
        Ok(self
            .load_state(stack)
            .await?
            .map(|state| state.records)
            .unwrap_or_default())
    }

    /// Persists the record of one resource.
    ///
    /// Other records of the stack are left untouched.
    async fn commit(&self, stack: &str, resource_id: &str, record: &StateRecord) -> Result<()> {
        if record.resource_id != resource_id {
            return Err(StackError::State(StateError::storage(format!(
                "refusing to store record '{}' under '{resource_id}'",
                record.resource_id
            ))));
        }

        let _guard = self.write_guard().lock().await;
        let mut state = self
            .load_state(stack)
            .await?
            .unwrap_or_else(|| StackState::new(stack));
        state.set_record(record.clone());
        self.save_state(&state).await?;

        debug!("Committed {resource_id} to state of {stack}");
        Ok(())
    }

    /// Removes the record of one resource.
    ///
    /// Called only after the provider confirmed the deletion.
    async fn delete(&self, stack: &str, resource_id: &str) -> Result<()> {
        let _guard = self.write_guard().lock().await;
        let Some(mut state) = self.load_state(stack).await? else {
            return Ok(());
        };
        if state.remove_record(resource_id).is_some() {
            self.save_state(&state).await?;
            debug!("Removed {resource_id} from state of {stack}");
        }
        Ok(())
    }

    /// Appends a run to the stack history.
    async fn append_history(&self, stack: &str, entry: HistoryEntry) -> Result<()> {
        let _guard = self.write_guard().lock().await;
        let mut state = self
            .load_state(stack)
            .await?
            .unwrap_or_else(|| StackState::new(stack));
        state.add_history(entry);
        self.save_state(&state).await
    }

    /// Checks if a stack is locked by an unexpired lock.
    async fn is_locked(&self, stack: &str) -> Result<bool> {
        Ok(self
            .lock_info(stack)
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }
}

/// Parses a stored state document and checks it for corruption.
///
/// # Errors
///
/// Returns [`StateError::Corrupted`] if the document cannot be trusted.
pub fn decode_state(stack: &str, content: &[u8]) -> Result<StackState> {
    let state: StackState = serde_json::from_slice(content).map_err(|e| {
        StackError::State(StateError::corrupted(stack, format!("unreadable state document: {e}")))
    })?;
    state.verify(stack)?;
    Ok(state)
}

/// Serializes a state document.
///
/// # Errors
///
/// Returns a serialization error if encoding fails.
pub fn encode_state(state: &StackState) -> Result<String> {
    serde_json::to_string_pretty(state).map_err(|e| {
        StackError::State(StateError::serialization(format!("Failed to serialize state: {e}")))
    })
}

/// File name of a stack's state document.
#[must_use]
pub fn state_file_name(stack: &str) -> String {
    format!("{stack}.state.json")
}

/// File name of a stack's lock.
#[must_use]
pub fn lock_file_name(stack: &str) -> String {
    format!("{stack}.lock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_rejects_garbage() {
        let err = decode_state("web-dev", b"{not json").unwrap_err();
        assert!(matches!(err, StackError::State(StateError::Corrupted { .. })));
        assert!(err.is_fatal_for_stack());
    }

    #[test]
    fn test_encode_decode() {
        let state = StackState::new("web-dev");
        let text = encode_state(&state).unwrap();
        let decoded = decode_state("web-dev", text.as_bytes()).unwrap();
        assert_eq!(decoded.stack, "web-dev");
    }

    #[test]
    fn test_file_names() {
        assert_eq!(state_file_name("web-dev"), "web-dev.state.json");
        assert_eq!(lock_file_name("web-dev"), "web-dev.lock");
    }
}
