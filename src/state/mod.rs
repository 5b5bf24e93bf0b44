//! State management module.
//!
//! This module provides persistent state storage for tracking applied
//! resources, their provider identifiers, stack locks and run history.

mod store;
mod local;
mod s3;
mod memory;
mod lock;
mod types;

pub use store::{decode_state, encode_state, StateStore};
pub use local::{LocalStateStore, STATE_DIR};
pub use s3::S3StateStore;
pub use memory::MemoryStateStore;
pub use lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
pub use types::{
    HistoryEntry, Identifiers, RunOperation, StackState, StateRecord, MAX_HISTORY, STATE_VERSION,
};
