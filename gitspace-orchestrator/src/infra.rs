//! Infra Provisioner Service: allocation records on top of the provider
//! registry.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use gitspace_core::GitspaceError;
use gitspace_provider::{
    InfraProviderRegistry, InfraProviderType, ProvisionOutcome, ProvisionedResource,
    ResourceTemplate,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, instrument, warn};

use crate::error::{OrchestratorError, Result};
use crate::store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ProvisioningStatus {
    /// Requested; an asynchronous provider has not reported back yet.
    Pending,
    Ready,
    Failed,
}

/// Persisted record of an infra allocation for one config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraProvisionedResource {
    pub config_id: String,
    pub template_id: String,
    pub provider_type: InfraProviderType,
    pub resource_handle: Option<String>,
    pub host: Option<String>,
    pub data: serde_json::Value,
    pub status: ProvisioningStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InfraProvisionedResource {
    fn new(config_id: &str, template: &ResourceTemplate) -> Self {
        let now = Utc::now();
        Self {
            config_id: config_id.to_string(),
            template_id: template.identifier.clone(),
            provider_type: template.provider,
            resource_handle: None,
            host: None,
            data: serde_json::Value::Null,
            status: ProvisioningStatus::Pending,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn ready(mut self, resource: &ProvisionedResource) -> Self {
        self.resource_handle = Some(resource.handle.clone());
        self.host = Some(resource.host.clone());
        self.data = resource.data.clone();
        self.status = ProvisioningStatus::Ready;
        self.error_message = None;
        self.updated_at = Utc::now();
        self
    }

    /// The provider-level view, as handed to container backends.
    pub fn to_resource(&self) -> ProvisionedResource {
        ProvisionedResource {
            config_id: self.config_id.clone(),
            template_id: self.template_id.clone(),
            provider_type: self.provider_type,
            handle: self.resource_handle.clone().unwrap_or_default(),
            host: self.host.clone().unwrap_or_default(),
            data: self.data.clone(),
        }
    }
}

/// Resource templates a config can reference, fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct TemplateRegistry {
    templates: HashMap<String, ResourceTemplate>,
}

impl TemplateRegistry {
    pub fn new(templates: impl IntoIterator<Item = ResourceTemplate>) -> Self {
        Self {
            templates: templates
                .into_iter()
                .map(|t| (t.identifier.clone(), t))
                .collect(),
        }
    }

    pub fn get(&self, identifier: &str) -> std::result::Result<&ResourceTemplate, GitspaceError> {
        self.templates.get(identifier).ok_or_else(|| {
            GitspaceError::Validation(format!("Unknown infra resource: {}", identifier))
        })
    }
}

#[derive(Clone)]
pub struct InfraProvisioner {
    pool: SqlitePool,
    providers: InfraProviderRegistry,
    templates: TemplateRegistry,
}

impl InfraProvisioner {
    pub fn new(pool: SqlitePool, providers: InfraProviderRegistry, templates: TemplateRegistry) -> Self {
        Self {
            pool,
            providers,
            templates,
        }
    }

    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    /// The template must exist and its provider must be configured.
    pub fn validate_template(&self, identifier: &str) -> Result<()> {
        let template = self.templates.get(identifier)?;
        self.providers.get(template.provider)?;
        Ok(())
    }

    pub async fn record(&self, config_id: &str) -> Result<Option<InfraProvisionedResource>> {
        store::fetch_infra(&self.pool, config_id).await
    }

    /// Allocate infra for `config_id` from `template_id`, idempotently.
    ///
    /// A ready allocation from the same template is returned as is. One from
    /// a different template is released first. An allocation still awaiting
    /// its provider stays pending.
    #[instrument(skip(self), fields(gitspace_id = %config_id))]
    pub async fn provision(&self, config_id: &str, template_id: &str) -> Result<ProvisionOutcome> {
        let template = self.templates.get(template_id)?.clone();

        if let Some(existing) = store::fetch_infra(&self.pool, config_id).await? {
            if existing.template_id == template.identifier {
                match existing.status {
                    ProvisioningStatus::Ready => {
                        info!("Reusing provisioned resource for {}", config_id);
                        return Ok(ProvisionOutcome::Ready(existing.to_resource()));
                    }
                    ProvisioningStatus::Pending if existing.resource_handle.is_some() => {
                        return Ok(ProvisionOutcome::Pending {
                            handle: existing.resource_handle.clone().unwrap_or_default(),
                        });
                    }
                    ProvisioningStatus::Failed if existing.resource_handle.is_some() => {
                        info!("Releasing failed allocation for {} before retrying", config_id);
                        self.release(&existing).await?;
                    }
                    _ => {}
                }
            } else {
                info!(
                    "Infra reference changed from {} to {}; releasing old resource",
                    existing.template_id, template.identifier
                );
                self.release(&existing).await?;
            }
        }

        let provider = self.providers.get(template.provider)?;
        let mut record = InfraProvisionedResource::new(config_id, &template);
        if let Some(existing) = store::fetch_infra(&self.pool, config_id).await? {
            record.created_at = existing.created_at;
        }
        store::upsert_infra(&self.pool, &record).await?;

        match provider.provision(config_id, &template).await {
            Ok(ProvisionOutcome::Ready(resource)) => {
                store::upsert_infra(&self.pool, &record.ready(&resource)).await?;
                info!("Provisioned {} on {}", resource.handle, resource.host);
                Ok(ProvisionOutcome::Ready(resource))
            }
            Ok(ProvisionOutcome::Pending { handle }) => {
                record.resource_handle = Some(handle.clone());
                record.updated_at = Utc::now();
                store::upsert_infra(&self.pool, &record).await?;
                info!("Provisioning of {} is pending", handle);
                Ok(ProvisionOutcome::Pending { handle })
            }
            Err(e) => {
                record.status = ProvisioningStatus::Failed;
                record.error_message = Some(e.to_string());
                record.updated_at = Utc::now();
                store::upsert_infra(&self.pool, &record).await?;
                Err(e.into())
            }
        }
    }

    /// The record still waiting on the allocation named `handle`. Results
    /// for any other allocation are stale.
    async fn pending_record(
        &self,
        config_id: &str,
        handle: &str,
    ) -> Result<Option<InfraProvisionedResource>> {
        Ok(store::fetch_infra(&self.pool, config_id)
            .await?
            .filter(|record| {
                record.status == ProvisioningStatus::Pending
                    && record.resource_handle.as_deref() == Some(handle)
            }))
    }

    /// Record the completion reported by an asynchronous provider. Returns
    /// `None` when no allocation named `handle` is pending.
    #[instrument(skip(self, data), fields(gitspace_id = %config_id))]
    pub async fn complete(
        &self,
        config_id: &str,
        handle: &str,
        host: &str,
        data: serde_json::Value,
    ) -> Result<Option<ProvisionedResource>> {
        let Some(record) = self.pending_record(config_id, handle).await? else {
            return Ok(None);
        };

        let resource = ProvisionedResource {
            config_id: config_id.to_string(),
            template_id: record.template_id.clone(),
            provider_type: record.provider_type,
            handle: handle.to_string(),
            host: host.to_string(),
            data,
        };
        store::upsert_infra(&self.pool, &record.ready(&resource)).await?;
        Ok(Some(resource))
    }

    /// Mark the pending allocation named `handle` as failed. Returns whether
    /// it was pending.
    pub async fn fail(&self, config_id: &str, handle: &str, error: &str) -> Result<bool> {
        let Some(mut record) = self.pending_record(config_id, handle).await? else {
            return Ok(false);
        };
        record.status = ProvisioningStatus::Failed;
        record.error_message = Some(error.to_string());
        record.updated_at = Utc::now();
        store::upsert_infra(&self.pool, &record).await?;
        Ok(true)
    }

    /// Release the allocation of `config_id` and drop its record. Fails with
    /// `NotFound` when there is no record; a provider reporting the resource
    /// already gone counts as released.
    #[instrument(skip(self), fields(gitspace_id = %config_id))]
    pub async fn deprovision(&self, config_id: &str) -> Result<()> {
        let record = store::fetch_infra(&self.pool, config_id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("infra for {}", config_id)))?;
        self.release(&record).await
    }

    async fn release(&self, record: &InfraProvisionedResource) -> Result<()> {
        if record.resource_handle.is_some() {
            let provider = self.providers.get(record.provider_type)?;
            match provider.deprovision(&record.to_resource()).await {
                Ok(()) => {}
                Err(GitspaceError::NotFound(_)) => {
                    warn!("Resource for {} was already released", record.config_id);
                }
                Err(e) => return Err(e.into()),
            }
        }
        store::delete_infra(&self.pool, &record.config_id).await?;
        info!("Released infra for {}", record.config_id);
        Ok(())
    }
}
