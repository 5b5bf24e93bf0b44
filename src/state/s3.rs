//! S3-based state storage backend.
//!
//! This module provides remote state storage using AWS S3 (or compatible
//! services) for shared stacks and team collaboration.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{Result, StackError, StateError};

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::{decode_state, encode_state, lock_file_name, state_file_name, StateStore};
use super::types::StackState;

/// Suffix of state document keys.
const STATE_SUFFIX: &str = ".state.json";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl S3StateStore {
    /// Creates a new S3 state store.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            write_lock: Mutex::new(()),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    StackError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;
                Ok(Some(bytes.to_vec()))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(StackError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object to S3.
    ///
    /// A single PUT replaces the object as a whole.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| StackError::State(StateError::s3(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StackError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    /// Reads the lock object of a stack.
    async fn read_lock(&self, stack: &str) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(&self.key(&lock_file_name(stack))).await? else {
            return Ok(None);
        };

        let lock_info: LockInfo = serde_json::from_slice(&content).map_err(|e| {
            StackError::State(StateError::LockFailed {
                message: format!("Failed to parse lock: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }
}

fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn load_state(&self, stack: &str) -> Result<Option<StackState>> {
        let key = self.key(&state_file_name(stack));
        debug!("Loading state from s3://{}/{key}", self.bucket);

        match self.get_object(&key).await? {
            Some(content) => decode_state(stack, &content).map(Some),
            None => {
                debug!("No state found in S3 for {stack}");
                Ok(None)
            }
        }
    }

    async fn save_state(&self, state: &StackState) -> Result<()> {
        let key = self.key(&state_file_name(&state.stack));
        let content = encode_state(state)?;
        self.put_object(&key, &content).await?;
        debug!("State saved to s3://{}/{key}", self.bucket);
        Ok(())
    }

    async fn list_stacks(&self) -> Result<Vec<String>> {
        let mut stacks = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| StackError::State(StateError::s3(format!("S3 list error: {e}"))))?;

            for object in response.contents() {
                if let Some(stack) = object
                    .key()
                    .and_then(|k| k.strip_prefix(self.prefix.as_str()))
                    .and_then(|k| k.strip_suffix(STATE_SUFFIX))
                    .filter(|k| !k.contains('/'))
                {
                    stacks.push(stack.to_string());
                }
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        stacks.sort();
        Ok(stacks)
    }

    fn write_guard(&self) -> &Mutex<()> {
        &self.write_lock
    }

    async fn acquire_lock(&self, stack: &str, holder: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock(stack).await? {
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
            StackError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        self.put_object(&self.key(&lock_file_name(stack)), &content)
            .await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, stack: &str, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock(stack).await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(&lock_file_name(stack))).await?;
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
        self.delete_object(&self.key(&lock_file_name(stack))).await
    }

    async fn lock_info(&self, stack: &str) -> Result<Option<LockInfo>> {
        self.read_lock(stack).await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_prefix() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("stacks")), "stacks/");
        assert_eq!(normalize_prefix(Some("/team/stacks/")), "team/stacks/");
    }
}
