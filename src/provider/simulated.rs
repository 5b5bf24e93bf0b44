//! In-process provider.
//!
//! Generates identifiers locally and records every call. Failures can be
//! injected per resource, which makes it the provider of choice for dry
//! runs and tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::model::{Properties, Resource, ResourceKind};
use crate::state::StateRecord;

use super::{Provider, ProviderOutput};

/// Kind of provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderAction {
    /// `create` was called.
    Create,
    /// `update` was called.
    Update,
    /// `delete` was called.
    Delete,
}

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderCall {
    /// Called action.
    pub action: ProviderAction,
    /// Resource id.
    pub resource_id: String,
    /// Properties passed in (empty for deletes).
    pub properties: Properties,
}

#[derive(Debug, Default)]
struct Inner {
    calls: Vec<ProviderCall>,
    next_failures: HashMap<String, VecDeque<ProviderError>>,
    permanent_failures: HashMap<String, ProviderError>,
}

/// In-process provider with failure injection.
#[derive(Debug, Default)]
pub struct SimulatedProvider {
    inner: Mutex<Inner>,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl SimulatedProvider {
    /// Creates a provider that always succeeds.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every call by `latency`.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Makes the next call for `resource_id` fail with `error`.
    ///
    /// Queued failures are consumed in order, one per call.
    pub fn fail_next(&self, resource_id: &str, error: ProviderError) {
        self.lock()
            .next_failures
            .entry(resource_id.to_string())
            .or_default()
            .push_back(error);
    }

    /// Makes every call for `resource_id` fail with `error`.
    pub fn fail_always(&self, resource_id: &str, error: ProviderError) {
        self.lock()
            .permanent_failures
            .insert(resource_id.to_string(), error);
    }

    /// Returns every call made so far.
    #[must_use]
    pub fn calls(&self) -> Vec<ProviderCall> {
        self.lock().calls.clone()
    }

    /// Number of calls made for `resource_id`.
    #[must_use]
    pub fn call_count(&self, resource_id: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.resource_id == resource_id)
            .count()
    }

    /// Highest number of calls that were in progress at the same time.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records the call and returns the injected failure, if any.
    async fn record(
        &self,
        action: ProviderAction,
        resource_id: &str,
        properties: Properties,
    ) -> Result<(), ProviderError> {
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut inner = self.lock();
        inner.calls.push(ProviderCall {
            action,
            resource_id: resource_id.to_string(),
            properties,
        });

        if let Some(error) = inner
            .next_failures
            .get_mut(resource_id)
            .and_then(VecDeque::pop_front)
        {
            debug!("Simulated failure for {resource_id}: {error}");
            return Err(error);
        }

        if let Some(error) = inner.permanent_failures.get(resource_id) {
            return Err(error.clone());
        }

        Ok(())
    }
}

fn generate_identifiers(resource_id: &str, kind: ResourceKind) -> ProviderOutput {
    let suffix = &Uuid::new_v4().simple().to_string()[..12];
    let id = format!("{}-{suffix}", kind.id_prefix());

    let mut output = ProviderOutput::from_pairs([
        (String::from("id"), id.clone()),
        (
            String::from("arn"),
            format!("arn:halldyll:{}:{resource_id}/{id}", kind.as_str()),
        ),
    ]);
    if kind.has_dns_name() {
        output
            .identifiers
            .insert(String::from("dns_name"), format!("{id}.sim.halldyll.internal"));
    }
    output
}

#[async_trait]
impl Provider for SimulatedProvider {
    async fn create(&self, resource: &Resource) -> Result<ProviderOutput, ProviderError> {
        self.record(ProviderAction::Create, &resource.id, resource.properties.clone())
            .await?;
        Ok(generate_identifiers(&resource.id, resource.kind))
    }

    async fn update(
        &self,
        resource: &Resource,
        prior: &StateRecord,
    ) -> Result<ProviderOutput, ProviderError> {
        self.record(ProviderAction::Update, &resource.id, resource.properties.clone())
            .await?;

        // A kind change replaces the resource.
        if prior.kind != resource.kind {
            return Ok(generate_identifiers(&resource.id, resource.kind));
        }
        Ok(ProviderOutput {
            identifiers: prior.provider_identifiers.clone(),
        })
    }

    async fn delete(&self, prior: &StateRecord) -> Result<(), ProviderError> {
        self.record(ProviderAction::Delete, &prior.resource_id, Properties::new())
            .await
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Identifiers;

    #[tokio::test]
    async fn test_create_generates_identifiers() {
        let provider = SimulatedProvider::new();
        let alb = Resource::new("alb", ResourceKind::LoadBalancer);

        let output = provider.create(&alb).await.expect("create");
        assert!(output.identifiers["id"].starts_with("alb-"));
        assert!(output.identifiers.contains_key("arn"));
        assert!(output.identifiers.contains_key("dns_name"));
        assert_eq!(provider.call_count("alb"), 1);
    }

    #[tokio::test]
    async fn test_update_keeps_identifiers() {
        let provider = SimulatedProvider::new();
        let vpc = Resource::new("vpc", ResourceKind::Vpc);
        let prior = StateRecord::applied(
            &vpc,
            Identifiers::from([(String::from("id"), String::from("vpc-1"))]),
            String::new(),
        );

        let output = provider.update(&vpc, &prior).await.expect("update");
        assert_eq!(output.identifiers["id"], "vpc-1");
    }

    #[tokio::test]
    async fn test_fail_next_consumed_once() {
        let provider = SimulatedProvider::new();
        provider.fail_next("db", ProviderError::transient("db", "throttled"));
        let db = Resource::new("db", ResourceKind::DbInstance);

        assert!(provider.create(&db).await.is_err());
        assert!(provider.create(&db).await.is_ok());
        assert_eq!(provider.call_count("db"), 2);
    }

    #[tokio::test]
    async fn test_fail_always() {
        let provider = SimulatedProvider::new();
        provider.fail_always("db", ProviderError::permanent("db", "quota"));
        let db = Resource::new("db", ResourceKind::DbInstance);

        for _ in 0..3 {
            assert!(matches!(
                provider.create(&db).await,
                Err(ProviderError::Permanent { .. })
            ));
        }
        assert_eq!(provider.calls()[0].action, ProviderAction::Create);
    }
}
