//! Gitspace Service: owns configs and instances, and turns user requests into
//! persisted intent plus a lifecycle event.
//!
//! Each request writes its state change, its history entry and its event in
//! one transaction, so the event becomes visible to consumers exactly when
//! the state it refers to does.

use std::sync::Arc;

use chrono::Utc;
use gitspace_core::{GitspaceError, LogLine, LogSink};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, instrument};
use utoipa::ToSchema;

use crate::bus::enqueue;
use crate::config::{
    generate_identifier, validate_identifier, ConfigFilters, CreateConfigRequest, GitspaceConfig,
    UpdateConfigRequest,
};
use crate::error::{OrchestratorError, Result};
use crate::event::{EventPayload, HistoryKind, HistoryRecord, LifecycleEvent};
use crate::ide::IdeType;
use crate::instance::{GitspaceInstance, GitspaceStatus, InstanceState};
use crate::orchestrator::Orchestrator;
use crate::store::{self, InstanceField};

pub const DEFAULT_LOG_LINES: usize = 200;

/// Result reported by an external infra provider.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InfraCallbackRequest {
    pub config_id: String,
    /// Handle the provider answered the provisioning request with.
    #[serde(default)]
    pub handle: Option<String>,
    /// Set when provisioning failed; `host` is then ignored.
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub data: serde_json::Value,
}

#[derive(Clone)]
pub struct GitspaceService {
    pool: SqlitePool,
    orchestrator: Arc<Orchestrator>,
}

impl GitspaceService {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            pool: orchestrator.pool().clone(),
            orchestrator,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn parse_ide(&self, ide: &str) -> Result<IdeType> {
        let ide: IdeType = ide.parse()?;
        self.orchestrator.backends().ides.get(ide)?;
        Ok(ide)
    }

    fn validate_secret_ref(&self, secret_ref: Option<&str>) -> Result<()> {
        if let Some(reference) = secret_ref {
            self.orchestrator.backends().secrets.validate(reference)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Configs

    #[instrument(skip(self, req), fields(owner = %req.owner))]
    pub async fn create_config(&self, req: CreateConfigRequest) -> Result<GitspaceConfig> {
        let identifier = req.identifier.unwrap_or_else(generate_identifier);
        validate_identifier(&identifier)?;
        if req.owner.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput("owner is required".to_string()));
        }

        let ide = self.parse_ide(&req.ide)?;
        self.orchestrator
            .backends()
            .scms
            .get(req.repo_type)?
            .validate(&req.repo_ref)?;
        self.orchestrator
            .infra()
            .validate_template(&req.infra_resource_ref)?;
        self.validate_secret_ref(req.secret_ref.as_deref())?;

        let now = Utc::now();
        let config = GitspaceConfig {
            identifier,
            owner: req.owner,
            repo_ref: req.repo_ref,
            repo_type: req.repo_type,
            branch: req.branch.filter(|b| !b.is_empty()),
            ide,
            infra_resource_ref: req.infra_resource_ref,
            secret_ref: req.secret_ref,
            created_at: now,
            updated_at: now,
            is_deleted: false,
        };

        let mut tx = self.pool.begin().await?;
        store::insert_config(&mut *tx, &config).await.map_err(|e| {
            if e.is_unique_violation() {
                OrchestratorError::Conflict(format!(
                    "gitspace {} already exists",
                    config.identifier
                ))
            } else {
                e
            }
        })?;
        store::append_history(
            &mut *tx,
            &config.identifier,
            None,
            HistoryKind::ConfigCreated,
            None,
        )
        .await?;
        tx.commit().await?;

        info!("Created gitspace config {}", config.identifier);
        Ok(config)
    }

    /// Change a config while nothing runs on it. A changed infra reference
    /// takes effect on the next start, which replaces the old resource.
    #[instrument(skip(self, req), fields(gitspace_id = %id))]
    pub async fn update_config(&self, id: &str, req: UpdateConfigRequest) -> Result<GitspaceConfig> {
        let _guard = self.orchestrator.locks().acquire(id).await?;
        let mut config = self.get_config(id).await?;

        if let Some(instance) = store::latest_instance(&self.pool, id).await? {
            if instance.state == InstanceState::Running || instance.state.is_transitioning() {
                return Err(OrchestratorError::InvalidState(format!(
                    "gitspace {} is {}; stop it before changing its config",
                    id, instance.state
                )));
            }
        }

        let mut changed = Vec::new();
        if let Some(ide) = req.ide.as_deref() {
            config.ide = self.parse_ide(ide)?;
            changed.push("ide");
        }
        if let Some(branch) = req.branch {
            config.branch = Some(branch).filter(|b| !b.is_empty());
            changed.push("branch");
        }
        if let Some(infra_ref) = req.infra_resource_ref {
            self.orchestrator.infra().validate_template(&infra_ref)?;
            config.infra_resource_ref = infra_ref;
            changed.push("infra_resource_ref");
        }
        if let Some(secret_ref) = req.secret_ref {
            let secret_ref = Some(secret_ref).filter(|s| !s.is_empty());
            self.validate_secret_ref(secret_ref.as_deref())?;
            config.secret_ref = secret_ref;
            changed.push("secret_ref");
        }
        if changed.is_empty() {
            return Ok(config);
        }
        config.updated_at = Utc::now();

        let mut tx = self.pool.begin().await?;
        store::update_config(&mut *tx, &config).await?;
        store::append_history(
            &mut *tx,
            id,
            None,
            HistoryKind::ConfigUpdated,
            Some(&changed.join(",")),
        )
        .await?;
        tx.commit().await?;

        Ok(config)
    }

    pub async fn get_config(&self, id: &str) -> Result<GitspaceConfig> {
        match store::fetch_config(&self.pool, id).await? {
            Some(config) if !config.is_deleted => Ok(config),
            _ => Err(OrchestratorError::NotFound(id.to_string())),
        }
    }

    pub async fn list_configs(&self, filters: &ConfigFilters) -> Result<Vec<GitspaceConfig>> {
        store::list_configs(&self.pool, filters).await
    }

    // -----------------------------------------------------------------------
    // Lifecycle requests

    /// Ask for the gitspace to run. A running gitspace is left as is; one in
    /// the middle of another operation is a `Conflict`.
    #[instrument(skip(self), fields(gitspace_id = %id))]
    pub async fn request_start(&self, id: &str) -> Result<GitspaceStatus> {
        let _guard = self.orchestrator.locks().acquire(id).await?;
        let config = self.get_config(id).await?;
        let latest = store::latest_instance(&self.pool, id).await?;

        let mut tx = self.pool.begin().await?;
        let instance_id = match latest.as_ref().map(|i| i.state) {
            None | Some(InstanceState::Stopped) | Some(InstanceState::Deleted) => {
                let instance_id = uuid::Uuid::new_v4().to_string();
                let event = LifecycleEvent::new(id, Some(&instance_id), EventPayload::Start);
                store::insert_instance(
                    &mut *tx,
                    &instance_id,
                    id,
                    InstanceState::Provisioning,
                    Some(&event.id),
                )
                .await?;
                enqueue(&mut *tx, &event).await?;
                instance_id
            }
            Some(InstanceState::Uninitialized) | Some(InstanceState::Error) => {
                let Some(instance) = latest.as_ref() else {
                    return Err(OrchestratorError::NotFound(id.to_string()));
                };
                let event =
                    LifecycleEvent::new(id, Some(&instance.identifier), EventPayload::Start);
                self.transition(
                    &mut tx,
                    instance,
                    InstanceState::Provisioning,
                    &event,
                )
                .await?;
                instance.identifier.clone()
            }
            Some(InstanceState::Running) => {
                info!("Gitspace {} is already running", id);
                return self.status_of(&config, latest);
            }
            Some(state) => {
                return Err(OrchestratorError::Conflict(format!(
                    "gitspace {} is {}",
                    id, state
                )));
            }
        };
        if let Some(limit) = self.orchestrator.settings().max_active_per_owner {
            let active = store::count_active_for_owner(&mut *tx, &config.owner, id).await?;
            if active >= i64::from(limit) {
                return Err(GitspaceError::ResourceUnavailable(format!(
                    "{} already has {} active gitspaces (limit {})",
                    config.owner, active, limit
                ))
                .into());
            }
        }
        store::append_history(
            &mut *tx,
            id,
            Some(&instance_id),
            HistoryKind::StartRequested,
            None,
        )
        .await?;
        tx.commit().await?;

        info!("Start of {} requested", id);
        self.get_status(id).await
    }

    /// Ask for the gitspace to stop. Stopping something that is not running
    /// or already stopping succeeds without effect.
    #[instrument(skip(self), fields(gitspace_id = %id))]
    pub async fn request_stop(&self, id: &str) -> Result<GitspaceStatus> {
        let _guard = self.orchestrator.locks().acquire(id).await?;
        let config = self.get_config(id).await?;
        let latest = store::latest_instance(&self.pool, id).await?;

        let instance = match latest {
            Some(instance) if instance.state == InstanceState::Running => instance,
            Some(instance)
                if instance.state == InstanceState::Error
                    || (instance.state.is_transitioning()
                        && instance.state != InstanceState::Stopping) =>
            {
                return Err(OrchestratorError::InvalidState(format!(
                    "gitspace {} is {} and cannot be stopped",
                    id, instance.state
                )));
            }
            other => return self.status_of(&config, other),
        };

        let event = LifecycleEvent::new(id, Some(&instance.identifier), EventPayload::Stop);
        let mut tx = self.pool.begin().await?;
        self.transition(&mut tx, &instance, InstanceState::Stopping, &event)
            .await?;
        store::append_history(
            &mut *tx,
            id,
            Some(&instance.identifier),
            HistoryKind::StopRequested,
            None,
        )
        .await?;
        tx.commit().await?;

        info!("Stop of {} requested", id);
        self.get_status(id).await
    }

    /// Ask for the gitspace to be torn down, from any state. An operation in
    /// flight is superseded; its pending event becomes a no-op.
    #[instrument(skip(self), fields(gitspace_id = %id))]
    pub async fn request_delete(&self, id: &str) -> Result<GitspaceStatus> {
        let _guard = self.orchestrator.locks().acquire(id).await?;
        let config = store::fetch_config(&self.pool, id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        let latest = store::latest_instance(&self.pool, id).await?;
        if config.is_deleted {
            return self.status_of(&config, latest);
        }

        let mut tx = self.pool.begin().await?;
        let instance_id = match latest {
            Some(instance) if instance.state == InstanceState::Deleting => {
                return self.status_of(&config, Some(instance));
            }
            Some(instance) if instance.state.is_active() => {
                let event =
                    LifecycleEvent::new(id, Some(&instance.identifier), EventPayload::Delete);
                self.transition(&mut tx, &instance, InstanceState::Deleting, &event)
                    .await?;
                instance.identifier
            }
            _ => {
                let instance_id = uuid::Uuid::new_v4().to_string();
                let event = LifecycleEvent::new(id, Some(&instance_id), EventPayload::Delete);
                store::insert_instance(
                    &mut *tx,
                    &instance_id,
                    id,
                    InstanceState::Deleting,
                    Some(&event.id),
                )
                .await?;
                enqueue(&mut *tx, &event).await?;
                instance_id
            }
        };
        store::append_history(
            &mut *tx,
            id,
            Some(&instance_id),
            HistoryKind::DeleteRequested,
            None,
        )
        .await?;
        tx.commit().await?;

        info!("Delete of {} requested", id);
        self.get_status(id).await
    }

    /// Move `instance` to `to`, make `event` the one it waits on, and enqueue
    /// the event, all inside `tx`.
    async fn transition(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        instance: &GitspaceInstance,
        to: InstanceState,
        event: &LifecycleEvent,
    ) -> Result<()> {
        let updated = store::update_instance(
            &mut **tx,
            &instance.identifier,
            &[instance.state],
            Some(to),
            &[InstanceField::PendingEvent(Some(event.id.clone()))],
        )
        .await?;
        if !updated {
            return Err(OrchestratorError::Conflict(format!(
                "gitspace {} changed state concurrently",
                instance.config_id
            )));
        }
        enqueue(&mut **tx, event).await
    }

    // -----------------------------------------------------------------------
    // Queries

    pub async fn get_status(&self, id: &str) -> Result<GitspaceStatus> {
        let config = store::fetch_config(&self.pool, id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))?;
        let latest = store::latest_instance(&self.pool, id).await?;
        self.status_of(&config, latest)
    }

    fn status_of(
        &self,
        config: &GitspaceConfig,
        instance: Option<GitspaceInstance>,
    ) -> Result<GitspaceStatus> {
        Ok(GitspaceStatus {
            config_id: config.identifier.clone(),
            state: instance
                .as_ref()
                .map(|i| i.state)
                .unwrap_or(InstanceState::Uninitialized),
            instance,
        })
    }

    pub async fn list_events(&self, id: &str) -> Result<Vec<HistoryRecord>> {
        if store::fetch_config(&self.pool, id).await?.is_none() {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }
        store::list_history(&self.pool, id).await
    }

    /// Output of the most recent instance, oldest line first.
    pub async fn get_logs(&self, id: &str, limit: usize) -> Result<Vec<LogLine>> {
        if store::fetch_config(&self.pool, id).await?.is_none() {
            return Err(OrchestratorError::NotFound(id.to_string()));
        }
        match store::latest_instance(&self.pool, id).await? {
            Some(instance) => Ok(self
                .orchestrator
                .backends()
                .logs
                .tail(&instance.identifier, limit)
                .await?),
            None => Ok(Vec::new()),
        }
    }

    /// Publish an external provider's result on the infra-provisioning stream.
    #[instrument(skip(self, req), fields(gitspace_id = %req.config_id))]
    pub async fn infra_callback(&self, req: InfraCallbackRequest) -> Result<LifecycleEvent> {
        let config_id = req.config_id;
        if store::fetch_config(&self.pool, &config_id).await?.is_none() {
            return Err(OrchestratorError::NotFound(config_id));
        }

        let Some(handle) = req.handle else {
            return Err(OrchestratorError::InvalidInput(
                "a callback needs the allocation handle".to_string(),
            ));
        };
        let payload = match (req.error, req.host) {
            (Some(error), _) => EventPayload::InfraProvisionFailed { handle, error },
            (None, Some(host)) => EventPayload::InfraProvisioned {
                handle,
                host,
                data: req.data,
            },
            (None, None) => {
                return Err(OrchestratorError::InvalidInput(
                    "a successful callback needs a host".to_string(),
                ))
            }
        };

        let instance = store::latest_instance(&self.pool, &config_id).await?;
        let event = LifecycleEvent::new(
            &config_id,
            instance.as_ref().map(|i| i.identifier.as_str()),
            payload,
        );
        enqueue(&self.pool, &event).await?;
        info!("Queued infra result for {}", config_id);
        Ok(event)
    }
}
