//! Provider interface.
//!
//! A provider turns a resource action into real infrastructure and reports
//! the identifiers it assigned. The engine treats it as an opaque service:
//! it only distinguishes transient failures (retried), permanent failures
//! and resources the provider does not know.

mod http;
mod simulated;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{DeclarationError, ProviderError, Result, StackError};
use crate::model::Resource;
use crate::state::{Identifiers, StateRecord};

pub use http::HttpProvider;
pub use simulated::{ProviderAction, ProviderCall, SimulatedProvider};

/// Identifiers returned by a successful create or update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOutput {
    /// Provider identifiers (`id`, `arn`, `dns_name`, ...).
    #[serde(default)]
    pub identifiers: Identifiers,
}

impl ProviderOutput {
    /// Creates an output from identifier pairs.
    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            identifiers: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Trait for infrastructure providers.
///
/// Resources passed in carry resolved properties: every `${...}` reference
/// has been replaced by the referenced provider identifier.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Creates a resource.
    async fn create(&self, resource: &Resource) -> std::result::Result<ProviderOutput, ProviderError>;

    /// Updates a resource previously applied as `prior`.
    async fn update(
        &self,
        resource: &Resource,
        prior: &StateRecord,
    ) -> std::result::Result<ProviderOutput, ProviderError>;

    /// Deletes a previously applied resource.
    async fn delete(&self, prior: &StateRecord) -> std::result::Result<(), ProviderError>;

    /// Gets the provider name.
    fn name(&self) -> &'static str;
}

/// Builds the provider selected by the configuration.
///
/// # Errors
///
/// Returns an error if the http provider has no endpoint, its token variable
/// is missing, or the HTTP client cannot be built.
pub fn from_config(config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    match config.kind {
        ProviderKind::Simulated => Ok(Arc::new(SimulatedProvider::new())),
        ProviderKind::Http => {
            let endpoint = config.endpoint.as_deref().ok_or_else(|| {
                StackError::Declaration(DeclarationError::validation(
                    "Endpoint is required for the http provider",
                    "provider.endpoint",
                ))
            })?;

            let token = match &config.token_env {
                Some(name) => Some(std::env::var(name).map_err(|_| {
                    StackError::Declaration(DeclarationError::MissingEnvVar { name: name.clone() })
                })?),
                None => None,
            };

            Ok(Arc::new(HttpProvider::new(endpoint, token, config.timeout_secs)?))
        }
    }
}
