//! In-memory state storage backend.
//!
//! Keeps encoded documents in a map so that tests exercise the same
//! encode/decode and corruption checks as the file and S3 backends.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Mutex as StdMutex, PoisonError};
use tokio::sync::Mutex;

use crate::error::Result;

use super::lock::{generate_holder_id, LockInfo};
use super::store::{decode_state, encode_state, StateStore};
use super::types::StackState;

/// In-memory state store.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    /// Encoded state documents by stack id.
    documents: StdMutex<BTreeMap<String, Vec<u8>>>,
    /// Locks by stack id.
    locks: StdMutex<BTreeMap<String, LockInfo>>,
    /// Serializes read-modify-write cycles.
    write_lock: Mutex<()>,
}

impl MemoryStateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a stored document with raw bytes.
    pub fn put_raw(&self, stack: &str, content: impl Into<Vec<u8>>) {
        self.documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(stack.to_string(), content.into());
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load_state(&self, stack: &str) -> Result<Option<StackState>> {
        let content = self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stack)
            .cloned();

        content.map(|bytes| decode_state(stack, &bytes)).transpose()
    }

    async fn save_state(&self, state: &StackState) -> Result<()> {
        let content = encode_state(state)?;
        self.put_raw(&state.stack, content);
        Ok(())
    }

    async fn list_stacks(&self) -> Result<Vec<String>> {
        Ok(self
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect())
    }

    fn write_guard(&self) -> &Mutex<()> {
        &self.write_lock
    }

    async fn acquire_lock(&self, stack: &str, holder: &str) -> Result<LockInfo> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = locks.get(stack)
            && !existing.is_expired()
        {
            return Err(existing.conflict());
        }

        let lock_info = if holder.is_empty() {
            LockInfo::new(stack, &generate_holder_id())
        } else {
            LockInfo::new(stack, holder)
        };
        locks.insert(stack.to_string(), lock_info.clone());
        Ok(lock_info)
    }

    async fn release_lock(&self, stack: &str, lock_id: &str) -> Result<()> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.get(stack).is_some_and(|l| l.lock_id == lock_id) {
            locks.remove(stack);
        }
        Ok(())
    }

    async fn force_unlock(&self, stack: &str) -> Result<()> {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stack);
        Ok(())
    }

    async fn lock_info(&self, stack: &str) -> Result<Option<LockInfo>> {
        Ok(self
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stack)
            .cloned())
    }

    fn backend_type(&self) -> &'static str {
        "memory"
    }
}
