//! Local file-based state storage backend.
//!
//! One JSON document per stack under a state directory, written with
//! temp-file, fsync and rename so a crash never leaves a partial document.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StackError, StateError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::{decode_state, encode_state, lock_file_name, state_file_name, StateStore};
use super::types::StackState;

/// Default state directory name.
pub const STATE_DIR: &str = ".halldyll";

/// Suffix of state documents.
const STATE_SUFFIX: &str = ".state.json";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a new local state store in `./.halldyll`.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| StackError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of a stack's state document.
    #[must_use]
    pub fn state_path(&self, stack: &str) -> PathBuf {
        self.base_dir.join(state_file_name(stack))
    }

    fn lock_path(&self, stack: &str) -> PathBuf {
        self.base_dir.join(lock_file_name(stack))
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                StackError::State(StateError::storage(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    /// Writes `content` to `path` through a synced temp file and a rename.
    async fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.ensure_dir().await?;

        let temp_path = path.with_extension("tmp");
        let storage = |what: &str, e: std::io::Error| {
            StackError::State(StateError::storage(format!("Failed to {what}: {e}")))
        };

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| storage("create temp state file", e))?;
        file.write_all(content)
            .await
            .map_err(|e| storage("write state file", e))?;
        file.sync_all()
            .await
            .map_err(|e| storage("sync state file", e))?;
        drop(file);

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| storage("rename state file", e))?;

        Ok(())
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self, stack: &str) -> Result<Option<LockInfo>> {
        let lock_path = self.lock_path(stack);
        if !lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&lock_path).await.map_err(|e| {
            StackError::State(StateError::LockFailed {
                message: format!("Failed to read lock file: {e}"),
            })
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            StackError::State(StateError::LockFailed {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self, stack: &str) -> Result<()> {
        let lock_path = self.lock_path(stack);
        if lock_path.exists() {
            fs::remove_file(&lock_path).await.map_err(|e| {
                StackError::State(StateError::LockFailed {
                    message: format!("Failed to delete lock file: {e}"),
                })
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load_state(&self, stack: &str) -> Result<Option<StackState>> {
        let state_path = self.state_path(stack);
        if !state_path.exists() {
            debug!("State file does not exist: {}", state_path.display());
            return Ok(None);
        }

        debug!("Loading state from: {}", state_path.display());

        let content = fs::read(&state_path).await.map_err(|e| {
            StackError::State(StateError::storage(format!("Failed to read state file: {e}")))
        })?;

        decode_state(stack, &content).map(Some)
    }

    async fn save_state(&self, state: &StackState) -> Result<()> {
        let content = encode_state(state)?;
        let state_path = self.state_path(&state.stack);
        self.write_atomic(&state_path, content.as_bytes()).await?;
        debug!("State saved to: {}", state_path.display());
        Ok(())
    }

    async fn list_stacks(&self) -> Result<Vec<String>> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = fs::read_dir(&self.base_dir).await.map_err(|e| {
            StackError::State(StateError::storage(format!("Failed to list state directory: {e}")))
        })?;

        let mut stacks = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            StackError::State(StateError::storage(format!("Failed to list state directory: {e}")))
        })? {
            if let Some(stack) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_suffix(STATE_SUFFIX))
            {
                stacks.push(stack.to_string());
            }
        }

        stacks.sort();
        Ok(stacks)
    }

    fn write_guard(&self) -> &Mutex<()> {
        &self.write_lock
    }

    async fn acquire_lock(&self, stack: &str, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file(stack).await? {
            if !existing.is_expired() {
                return Err(existing.conflict());
            }
            debug!("Expired lock found, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(stack, &holder_id);
        let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
            StackError::State(StateError::serialization(format!("Failed to serialize lock: {e}")))
        })?;
        self.write_atomic(&self.lock_path(stack), content.as_bytes())
            .await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, stack: &str, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file(stack).await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file(stack).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self, stack: &str) -> Result<()> {
        self.delete_lock_file(stack).await
    }

    async fn lock_info(&self, stack: &str) -> Result<Option<LockInfo>> {
        self.read_lock_file(stack).await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Resource, ResourceKind};
    use crate::state::{Identifiers, StateRecord};
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn record(id: &str) -> StateRecord {
        let resource = Resource::new(id, ResourceKind::Bucket).with_property("versioning", json!(true));
        StateRecord::applied(&resource, Identifiers::new(), String::new())
    }

    #[tokio::test]
    async fn test_commit_and_load() {
        let (store, _temp) = create_test_store();

        store
            .commit("web-dev", "uploads", &record("uploads"))
            .await
            .expect("Failed to commit");
        store
            .commit("web-dev", "logs", &record("logs"))
            .await
            .expect("Failed to commit");

        let records = store.load("web-dev").await.expect("Failed to load state");
        assert_eq!(records.len(), 2);
        assert!(records.contains_key("uploads"));
        assert!(store.state_path("web-dev").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load_state("web-dev").await.expect("Load should not fail");
        assert!(result.is_none());
        assert!(store.load("web-dev").await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn test_delete_record() {
        let (store, _temp) = create_test_store();
        store.commit("web-dev", "a", &record("a")).await.expect("commit");
        store.commit("web-dev", "b", &record("b")).await.expect("commit");

        store.delete("web-dev", "a").await.expect("delete");

        let records = store.load("web-dev").await.expect("load");
        assert_eq!(records.keys().collect::<Vec<_>>(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_commit_rejects_mismatched_id() {
        let (store, _temp) = create_test_store();
        assert!(store.commit("web-dev", "other", &record("a")).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupted_file_detected() {
        let (store, temp) = create_test_store();
        std::fs::write(temp.path().join("web-dev.state.json"), "{\"version\":").expect("write");

        let err = store.load("web-dev").await.unwrap_err();
        assert!(matches!(err, StackError::State(StateError::Corrupted { .. })));
    }

    #[tokio::test]
    async fn test_list_stacks() {
        let (store, _temp) = create_test_store();
        store.commit("web-prod", "a", &record("a")).await.expect("commit");
        store.commit("web-dev", "a", &record("a")).await.expect("commit");
        let _lock = store.acquire_lock("web-dev", "me").await.expect("lock");

        let stacks = store.list_stacks().await.expect("list");
        assert_eq!(stacks, vec!["web-dev", "web-prod"]);
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("web-dev", "test-holder")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked("web-dev").await.expect("is_locked failed"));
        assert!(!store.is_locked("web-prod").await.expect("is_locked failed"));

        store
            .release_lock("web-dev", &lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked("web-dev").await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("web-dev", "holder-1")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("web-dev", "holder-2").await;
        assert!(matches!(
            result,
            Err(StackError::State(StateError::LockedByOther { .. }))
        ));

        store.force_unlock("web-dev").await.expect("force unlock");
        assert!(store.acquire_lock("web-dev", "holder-2").await.is_ok());
    }
}
