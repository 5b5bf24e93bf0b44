//! Declaration document types.
//!
//! This module defines the structs that map to the `halldyll.stack.yaml` file.
//! The document fully describes the desired state of one stack.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::model::{ResourceDecl, StackSettings, WiringPatch};

/// The root declaration document of a stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StackDocument {
    /// Stack-level settings.
    pub stack: StackConfig,
    /// Feature flags for optional components.
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Provider configuration.
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Executor tuning.
    #[serde(default)]
    pub executor: ExecutorConfig,
    /// Declared resources, in order.
    #[serde(default)]
    pub resources: Vec<ResourceDecl>,
    /// Extra edges applied after the graph is built.
    #[serde(default)]
    pub wiring: Vec<WiringPatch>,
}

/// Stack-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StackConfig {
    /// Stack name.
    pub name: String,
    /// Environment (e.g., "dev", "staging", "production").
    #[serde(default = "default_environment")]
    pub environment: String,
    /// Deployment region.
    #[serde(default)]
    pub region: Option<String>,
    /// Tags applied to every resource.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// State backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Provider configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Provider implementation.
    #[serde(default)]
    pub kind: ProviderKind,
    /// Base URL of the provisioning API (http only).
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Environment variable holding the bearer token (http only).
    #[serde(default)]
    pub token_env: Option<String>,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::default(),
            endpoint: None,
            token_env: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Provider implementations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// In-process provider generating identifiers locally.
    #[default]
    Simulated,
    /// Remote provisioning API over HTTP.
    Http,
}

/// Executor tuning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum concurrent provider calls within a wave.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Attempts per provider call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Upper bound on retry delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl ExecutorConfig {
    /// Delay before the first retry.
    #[must_use]
    pub const fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Upper bound on retry delay.
    #[must_use]
    pub const fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

// Default value functions

const fn default_max_parallel() -> usize {
    4
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    30_000
}

const fn default_timeout_secs() -> u64 {
    30
}

fn default_environment() -> String {
    String::from("dev")
}

impl StackDocument {
    /// Returns the stack id including environment.
    #[must_use]
    pub fn stack_id(&self) -> String {
        format!("{}-{}", self.stack.name, self.stack.environment)
    }

    /// Returns the settings passed into stack construction.
    #[must_use]
    pub fn settings(&self) -> StackSettings {
        StackSettings {
            name: self.stack.name.clone(),
            environment: self.stack.environment.clone(),
            region: self.stack.region.clone(),
            tags: self.stack.tags.clone(),
            flags: self.flags.clone(),
        }
    }

    /// Returns declared resource ids in order.
    #[must_use]
    pub fn resource_ids(&self) -> Vec<&str> {
        self.resources.iter().map(|r| r.id.as_str()).collect()
    }
}
