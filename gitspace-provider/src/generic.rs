//! Infra provider delegating allocation to an external provisioning service
//! over HTTP.
//!
//! Protocol:
//! - `POST {endpoint}/resources` with `{config_id, template}` answers `200`
//!   with a resource body when allocation finished synchronously, or `202`
//!   when the service will report back through the infra callback.
//! - `DELETE {endpoint}/resources/{config_id}` releases; `404` means the
//!   resource is already gone.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument};
use url::Url;

use crate::{
    GitspaceError, InfraProvider, InfraProviderType, ProvisionOutcome, ProvisionedResource,
    ResourceTemplate, Result,
};

#[derive(Debug, Serialize)]
struct ProvisionRequest<'a> {
    config_id: &'a str,
    template: &'a ResourceTemplate,
}

#[derive(Debug, Deserialize)]
struct ProvisionResponse {
    handle: String,
    host: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct GenericInfraProvider {
    endpoint: Url,
    client: reqwest::Client,
}

impl GenericInfraProvider {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let mut endpoint = Url::parse(endpoint).map_err(|e| {
            GitspaceError::Validation(format!("Invalid provider endpoint '{}': {}", endpoint, e))
        })?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GitspaceError::Internal(format!("HTTP client: {}", e)))?;

        Ok(Self { endpoint, client })
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.endpoint
            .join(path)
            .map_err(|e| GitspaceError::Internal(format!("Invalid provider path {}: {}", path, e)))
    }
}

fn classify_status(status: StatusCode, body: String) -> GitspaceError {
    match status {
        StatusCode::CONFLICT | StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE => {
            GitspaceError::ResourceUnavailable(format!("{}: {}", status, body))
        }
        StatusCode::NOT_FOUND => GitspaceError::NotFound(body),
        s if s.is_client_error() => GitspaceError::Validation(format!("{}: {}", status, body)),
        _ => GitspaceError::Network(format!("{}: {}", status, body)),
    }
}

fn transport_error(e: reqwest::Error) -> GitspaceError {
    if e.is_timeout() {
        GitspaceError::Timeout(e.to_string())
    } else {
        GitspaceError::Network(e.to_string())
    }
}

#[async_trait]
impl InfraProvider for GenericInfraProvider {
    fn provider_type(&self) -> InfraProviderType {
        InfraProviderType::Generic
    }

    #[instrument(skip(self, template), fields(gitspace_id = %config_id))]
    async fn provision(
        &self,
        config_id: &str,
        template: &ResourceTemplate,
    ) -> Result<ProvisionOutcome> {
        let response = self
            .client
            .post(self.url("resources")?)
            .json(&ProvisionRequest {
                config_id,
                template,
            })
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            info!("External provisioning accepted, awaiting callback");
            return Ok(ProvisionOutcome::Pending {
                handle: config_id.to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, body));
        }

        let body: ProvisionResponse = response
            .json()
            .await
            .map_err(|e| GitspaceError::Serialization(e.to_string()))?;

        Ok(ProvisionOutcome::Ready(ProvisionedResource {
            config_id: config_id.to_string(),
            template_id: template.identifier.clone(),
            provider_type: InfraProviderType::Generic,
            handle: body.handle,
            host: body.host,
            data: body.data,
        }))
    }

    #[instrument(skip(self, resource), fields(gitspace_id = %resource.config_id))]
    async fn deprovision(&self, resource: &ProvisionedResource) -> Result<()> {
        let response = self
            .client
            .delete(self.url(&format!("resources/{}", resource.config_id))?)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joining_keeps_base_path() {
        let provider =
            GenericInfraProvider::new("http://infra.internal/api/v1", Duration::from_secs(5))
                .unwrap();
        assert_eq!(
            provider.url("resources/c1").unwrap().as_str(),
            "http://infra.internal/api/v1/resources/c1"
        );
    }

    #[test]
    fn test_invalid_endpoint_is_validation_error() {
        let err = GenericInfraProvider::new("not a url", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, GitspaceError::Validation(_)));
    }

    #[test]
    fn test_status_classification() {
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_retryable());
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, "bad template".into()),
            GitspaceError::Validation(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, String::new()),
            GitspaceError::Network(_)
        ));
    }
}
