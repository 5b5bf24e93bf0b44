//! HTTP provisioning API provider.
//!
//! Maps resource actions onto a small REST surface:
//! `POST /resources`, `PUT /resources/{id}` and `DELETE /resources/{id}`,
//! where `{id}` is the provider identifier recorded in state.

use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ProviderError, Result, StackError};
use crate::model::{Properties, Resource, ResourceKind};
use crate::state::{Identifiers, StateRecord};

use super::{Provider, ProviderOutput};

/// Request body for create and update.
#[derive(Debug, Serialize)]
struct ResourceRequest<'a> {
    id: &'a str,
    kind: ResourceKind,
    properties: &'a Properties,
    #[serde(skip_serializing_if = "Option::is_none")]
    identifiers: Option<&'a Identifiers>,
}

/// Provider backed by a remote provisioning API.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// Optional bearer token.
    token: Option<String>,
}

impl HttpProvider {
    /// Creates a new provider for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>, timeout_secs: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| StackError::internal(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.endpoint)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    /// Sends a request and maps transport errors.
    async fn send(
        &self,
        resource_id: &str,
        request: reqwest::RequestBuilder,
    ) -> std::result::Result<Response, ProviderError> {
        self.authorize(request)
            .send()
            .await
            .map_err(|e| classify_transport(resource_id, &e))
    }

    /// Parses a successful create/update response.
    async fn read_output(
        resource_id: &str,
        response: Response,
    ) -> std::result::Result<ProviderOutput, ProviderError> {
        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(resource_id, response).await);
        }

        response.json::<ProviderOutput>().await.map_err(|e| {
            ProviderError::permanent(resource_id, format!("Invalid provider response: {e}"))
        })
    }
}

/// Connection failures and timeouts may succeed on retry.
fn classify_transport(resource_id: &str, error: &reqwest::Error) -> ProviderError {
    if error.is_timeout() || error.is_connect() {
        ProviderError::transient(resource_id, format!("Request failed: {error}"))
    } else {
        ProviderError::permanent(resource_id, format!("Request failed: {error}"))
    }
}

/// Maps a non-success status to a provider error.
async fn classify_status(resource_id: &str, response: Response) -> ProviderError {
    let status = response.status();
    let retry_after = response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();

    match status {
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            ProviderError::Transient {
                resource: resource_id.to_string(),
                message: format!("HTTP {status}: {body}"),
                retry_after,
            }
        }
        StatusCode::NOT_FOUND => ProviderError::NotFound {
            resource: resource_id.to_string(),
        },
        _ => ProviderError::permanent(resource_id, format!("HTTP {status}: {body}")),
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(&self, resource: &Resource) -> std::result::Result<ProviderOutput, ProviderError> {
        trace!("POST resource {}", resource.id);
        let body = ResourceRequest {
            id: &resource.id,
            kind: resource.kind,
            properties: &resource.properties,
            identifiers: None,
        };
        let request = self.client.post(self.url("/resources")).json(&body);
        let response = self.send(&resource.id, request).await?;
        Self::read_output(&resource.id, response).await
    }

    async fn update(
        &self,
        resource: &Resource,
        prior: &StateRecord,
    ) -> std::result::Result<ProviderOutput, ProviderError> {
        let remote_id = prior.primary_id().unwrap_or(&resource.id);
        trace!("PUT resource {} ({remote_id})", resource.id);

        let body = ResourceRequest {
            id: &resource.id,
            kind: resource.kind,
            properties: &resource.properties,
            identifiers: Some(&prior.provider_identifiers),
        };
        let request = self
            .client
            .put(self.url(&format!("/resources/{remote_id}")))
            .json(&body);
        let response = self.send(&resource.id, request).await?;
        Self::read_output(&resource.id, response).await
    }

    async fn delete(&self, prior: &StateRecord) -> std::result::Result<(), ProviderError> {
        let remote_id = prior.primary_id().unwrap_or(&prior.resource_id);
        trace!("DELETE resource {} ({remote_id})", prior.resource_id);

        let request = self.client.delete(self.url(&format!("/resources/{remote_id}")));
        let response = self.send(&prior.resource_id, request).await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("{} already gone at provider", prior.resource_id);
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(classify_status(&prior.resource_id, response).await);
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn prior(id: &str, remote: &str) -> StateRecord {
        StateRecord::applied(
            &Resource::new(id, ResourceKind::Bucket),
            Identifiers::from([(String::from("id"), remote.to_string())]),
            String::new(),
        )
    }

    #[tokio::test]
    async fn test_create_posts_resource() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources"))
            .and(header_eq("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "identifiers": {"id": "bucket-123", "arn": "arn:bucket-123"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), Some(String::from("secret")), 5).unwrap();
        let bucket = Resource::new("uploads", ResourceKind::Bucket).with_property("versioning", json!(true));

        let output = provider.create(&bucket).await.unwrap();
        assert_eq!(output.identifiers["id"], "bucket-123");
    }

    #[tokio::test]
    async fn test_update_puts_to_provider_id() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/resources/bucket-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "identifiers": {"id": "bucket-123"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None, 5).unwrap();
        let bucket = Resource::new("uploads", ResourceKind::Bucket);

        let output = provider.update(&bucket, &prior("uploads", "bucket-123")).await.unwrap();
        assert_eq!(output.identifiers["id"], "bucket-123");
    }

    #[tokio::test]
    async fn test_throttling_is_transient_with_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/resources"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None, 5).unwrap();
        let err = provider
            .create(&Resource::new("uploads", ResourceKind::Bucket))
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_unavailable_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None, 5).unwrap();
        let err = provider
            .create(&Resource::new("uploads", ResourceKind::Bucket))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_bad_request_is_permanent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid cidr"))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None, 5).unwrap();
        let err = provider
            .create(&Resource::new("vpc", ResourceKind::Vpc))
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Permanent { .. }));
        assert!(err.to_string().contains("invalid cidr"));
        assert!(err.to_string().contains("vpc"));
    }

    #[tokio::test]
    async fn test_delete_not_found_is_success() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/resources/bucket-123"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None, 5).unwrap();
        assert!(provider.delete(&prior("uploads", "bucket-123")).await.is_ok());
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let provider = HttpProvider::new("http://127.0.0.1:1", None, 1).unwrap();
        let err = provider
            .create(&Resource::new("vpc", ResourceKind::Vpc))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
