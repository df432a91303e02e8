//! The lifecycle engine: advances one gitspace from its persisted intent to
//! the matching runtime state.
//!
//! Every handler runs under the per-gitspace lock and only acts on an instance
//! whose `pending_event_id` matches the event. A redelivered event that was
//! already processed therefore finds nothing pending and is a no-op.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use gitspace_core::command_stream::system_line;
use gitspace_core::secrets::generate_token;
use gitspace_core::{retry_with_backoff, ErrorKind, GitspaceError, LogSink};
use gitspace_provider::{
    ContainerHandle, ContainerOrchestrator, ProvisionOutcome, ProvisionedResource, RunArgContext,
    RunArgResolver, RunArgs,
};
use sqlx::SqlitePool;
use tracing::{debug, error, info, instrument, warn};

use crate::bus::enqueue;
use crate::config::GitspaceConfig;
use crate::error::{OrchestratorError, Result};
use crate::event::{EventPayload, HistoryKind, LifecycleEvent, Operation};
use crate::ide::{ConnectionInfo, IdeContext, IdeRegistry, ACCESS_TOKEN_ENV};
use crate::infra::InfraProvisioner;
use crate::instance::{GitspaceInstance, InstanceState, LifecycleStage};
use crate::lock::LockManager;
use crate::scm::{CloneInfo, Credentials, ScmRegistry};
use crate::secret::SecretRegistry;
use crate::settings::OrchestratorSettings;
use crate::store::{self, InstanceField};

const ACCESS_TOKEN_LENGTH: usize = 32;

/// States a start may be carried forward from.
const STARTING_STATES: &[InstanceState] = &[InstanceState::Provisioning, InstanceState::Starting];

/// Backends the engine drives, each selected once at startup.
#[derive(Clone)]
pub struct Backends {
    pub containers: Arc<dyn ContainerOrchestrator>,
    pub run_args: RunArgResolver,
    pub ides: IdeRegistry,
    pub scms: ScmRegistry,
    pub secrets: SecretRegistry,
    pub logs: Arc<dyn LogSink>,
}

/// A start that stopped at `stage`.
struct StageFailure {
    stage: LifecycleStage,
    error: GitspaceError,
}

impl StageFailure {
    fn at(stage: LifecycleStage) -> impl FnOnce(OrchestratorError) -> StageFailure {
        move |e| StageFailure {
            stage,
            error: e.into_gitspace(),
        }
    }

    fn gitspace(stage: LifecycleStage) -> impl FnOnce(GitspaceError) -> StageFailure {
        move |error| StageFailure { stage, error }
    }
}

enum StartProgress {
    Running,
    /// The infra provider answers asynchronously.
    AwaitingInfra,
}

type StageResult<T> = std::result::Result<T, StageFailure>;

pub struct Orchestrator {
    pool: SqlitePool,
    infra: InfraProvisioner,
    backends: Backends,
    locks: Arc<LockManager>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        pool: SqlitePool,
        infra: InfraProvisioner,
        backends: Backends,
        locks: Arc<LockManager>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            pool,
            infra,
            backends,
            locks,
            settings,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn infra(&self) -> &InfraProvisioner {
        &self.infra
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Process one event. An `Err` means the event was not handled and should
    /// be delivered again; lifecycle failures are persisted as `Error` state
    /// and return `Ok`.
    #[instrument(skip(self, event), fields(gitspace_id = %event.gitspace_id, event_id = %event.id))]
    pub async fn handle(&self, event: &LifecycleEvent) -> Result<()> {
        if let EventPayload::OperationCompleted {
            operation,
            succeeded,
            detail,
        } = &event.payload
        {
            return self
                .record_operation(event, *operation, *succeeded, detail.as_deref())
                .await;
        }

        let _guard = self.locks.acquire(&event.gitspace_id).await?;
        match &event.payload {
            EventPayload::Start => self.handle_start(event).await,
            EventPayload::Stop => self.handle_stop(event).await,
            EventPayload::Delete => self.handle_delete(event).await,
            EventPayload::InfraProvisioned { handle, host, data } => {
                self.handle_infra_provisioned(event, handle, host, data.clone())
                    .await
            }
            EventPayload::InfraProvisionFailed { handle, error } => {
                self.handle_infra_failed(event, handle, error).await
            }
            EventPayload::OperationCompleted { .. } => Ok(()),
        }
    }

    /// Give up on an event that kept failing. The instance waiting on it, if
    /// any, is moved to `Error`.
    #[instrument(skip(self, event), fields(gitspace_id = %event.gitspace_id, event_id = %event.id))]
    pub async fn abandon(&self, event: &LifecycleEvent, deliveries: u32) -> Result<()> {
        let _guard = self.locks.acquire(&event.gitspace_id).await?;
        let message = format!(
            "{} event dropped after {} deliveries",
            event.category(),
            deliveries
        );
        error!("{}", message);

        let waiting = self.pending_instance(event).await?;
        let mut tx = self.pool.begin().await?;
        if let Some(instance) = waiting {
            if instance.state.is_transitioning() {
                store::update_instance(
                    &mut *tx,
                    &instance.identifier,
                    &[instance.state],
                    Some(InstanceState::Error),
                    &[
                        InstanceField::Error(Some((ErrorKind::Internal, message.clone()))),
                        InstanceField::PendingEvent(None),
                    ],
                )
                .await?;
            }
        }
        store::append_history(
            &mut *tx,
            &event.gitspace_id,
            event.instance_id.as_deref(),
            HistoryKind::EventDropped,
            Some(&message),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    /// The instance `event` was issued for, if it still waits on this event.
    async fn pending_instance(&self, event: &LifecycleEvent) -> Result<Option<GitspaceInstance>> {
        let Some(instance_id) = event.instance_id.as_deref() else {
            warn!("Event {} names no instance", event.id);
            return Ok(None);
        };
        let Some(instance) = store::fetch_instance(&self.pool, instance_id).await? else {
            warn!("Instance {} no longer exists", instance_id);
            return Ok(None);
        };
        if instance.pending_event_id.as_deref() != Some(event.id.as_str()) {
            debug!(
                "Event {} is not pending on {}; already processed or superseded",
                event.id, instance_id
            );
            return Ok(None);
        }
        Ok(Some(instance))
    }

    async fn config(&self, id: &str) -> Result<GitspaceConfig> {
        store::fetch_config(&self.pool, id)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(id.to_string()))
    }

    async fn log(&self, instance: &GitspaceInstance, line: &str) {
        system_line(self.backends.logs.as_ref(), &instance.identifier, line).await;
    }

    // -----------------------------------------------------------------------
    // Start

    async fn handle_start(&self, event: &LifecycleEvent) -> Result<()> {
        let Some(instance) = self.pending_instance(event).await? else {
            return Ok(());
        };
        if !STARTING_STATES.contains(&instance.state) {
            debug!("Instance {} is {}; nothing to start", instance.identifier, instance.state);
            return Ok(());
        }
        let config = self.config(&instance.config_id).await?;
        self.start(&config, instance).await
    }

    async fn start(&self, config: &GitspaceConfig, instance: GitspaceInstance) -> Result<()> {
        info!(
            "Starting gitspace {} (instance {}, resuming after {:?})",
            config.identifier, instance.identifier, instance.stage
        );

        match self.run_start_stages(config, &instance).await {
            Ok(StartProgress::Running) => Ok(()),
            Ok(StartProgress::AwaitingInfra) => Ok(()),
            Err(failure) => self.fail_start(config, &instance, failure).await,
        }
    }

    async fn run_start_stages(
        &self,
        config: &GitspaceConfig,
        instance: &GitspaceInstance,
    ) -> StageResult<StartProgress> {
        // ResolveSource
        let clone = self
            .resolve_source(config)
            .await
            .map_err(StageFailure::gitspace(LifecycleStage::ResolveSource))?;
        self.checkpoint(instance, LifecycleStage::ResolveSource, None)
            .await
            .map_err(StageFailure::at(LifecycleStage::ResolveSource))?;

        // ProvisionInfra
        let resource = match self.provision_infra(config, instance).await? {
            Some(resource) => resource,
            None => return Ok(StartProgress::AwaitingInfra),
        };

        // ResolveRunArgs
        let adapter = self
            .backends
            .ides
            .get(config.ide)
            .map_err(StageFailure::gitspace(LifecycleStage::ResolveRunArgs))?;
        let template = self
            .infra
            .templates()
            .get(&config.infra_resource_ref)
            .map_err(StageFailure::gitspace(LifecycleStage::ResolveRunArgs))?;
        let args = self
            .backends
            .run_args
            .resolve(&RunArgContext {
                gitspace_id: &config.identifier,
                repo_name: &clone.repo_name,
                template,
                resource: &resource,
                ide_port: adapter.container_port(),
            })
            .map_err(StageFailure::gitspace(LifecycleStage::ResolveRunArgs))?;
        self.checkpoint(instance, LifecycleStage::ResolveRunArgs, None)
            .await
            .map_err(StageFailure::at(LifecycleStage::ResolveRunArgs))?;

        // StartContainer
        let handle = self
            .start_container(instance, &resource, &args, &clone)
            .await
            .map_err(StageFailure::gitspace(LifecycleStage::StartContainer))?;
        self.checkpoint(
            instance,
            LifecycleStage::StartContainer,
            Some(InstanceField::Container {
                id: handle.container_id.clone(),
                name: handle.container_name.clone(),
                host: handle.host.clone(),
            }),
        )
        .await
        .map_err(StageFailure::at(LifecycleStage::StartContainer))?;
        store::append_history(
            &self.pool,
            &config.identifier,
            Some(&instance.identifier),
            HistoryKind::ContainerStarted,
            Some(&handle.container_name),
        )
        .await
        .map_err(StageFailure::at(LifecycleStage::StartContainer))?;

        // ConfigureIde
        let access_token = instance
            .access_token
            .clone()
            .unwrap_or_else(|| generate_token(ACCESS_TOKEN_LENGTH));
        let connection = self
            .configure_ide(config, instance, &handle, &args, &access_token)
            .await
            .map_err(StageFailure::gitspace(LifecycleStage::ConfigureIde))?;
        self.checkpoint(
            instance,
            LifecycleStage::ConfigureIde,
            Some(InstanceField::AccessToken(access_token)),
        )
        .await
        .map_err(StageFailure::at(LifecycleStage::ConfigureIde))?;
        store::append_history(
            &self.pool,
            &config.identifier,
            Some(&instance.identifier),
            HistoryKind::IdeConfigured,
            Some(config.ide.as_str()),
        )
        .await
        .map_err(StageFailure::at(LifecycleStage::ConfigureIde))?;

        // Finalize
        self.finalize_start(config, instance, &connection)
            .await
            .map_err(StageFailure::at(LifecycleStage::Finalize))?;
        Ok(StartProgress::Running)
    }

    /// Record `stage` as completed, optionally with more columns.
    async fn checkpoint(
        &self,
        instance: &GitspaceInstance,
        stage: LifecycleStage,
        extra: Option<InstanceField>,
    ) -> Result<()> {
        let mut fields = vec![InstanceField::Stage(Some(stage))];
        fields.extend(extra);
        let updated = store::update_instance(
            &self.pool,
            &instance.identifier,
            STARTING_STATES,
            None,
            &fields,
        )
        .await?;
        if !updated {
            return Err(OrchestratorError::InvalidState(format!(
                "instance {} left the start sequence",
                instance.identifier
            )));
        }
        debug!("Instance {} completed {}", instance.identifier, stage);
        Ok(())
    }

    async fn resolve_source(&self, config: &GitspaceConfig) -> gitspace_core::Result<CloneInfo> {
        let credentials = match &config.secret_ref {
            Some(reference) => Some(Credentials {
                username: config.owner.clone(),
                password: self.backends.secrets.resolve(reference).await?,
            }),
            None => None,
        };
        let scm = self.backends.scms.get(config.repo_type)?;
        scm.resolve_clone(&config.repo_ref, config.branch.as_deref(), credentials)
            .await
    }

    /// Allocate infra and move the instance to `Starting`. `None` means the
    /// provider will report back through the infra-provisioning stream.
    async fn provision_infra(
        &self,
        config: &GitspaceConfig,
        instance: &GitspaceInstance,
    ) -> StageResult<Option<ProvisionedResource>> {
        let stage = LifecycleStage::ProvisionInfra;
        let deadline = self.settings.provision_deadline();

        let outcome = with_deadline(
            deadline,
            "infra provisioning",
            retry_with_backoff(&self.settings.stage_retry, "provision infra", move |_| async move {
                self.infra
                    .provision(&config.identifier, &config.infra_resource_ref)
                    .await
                    .map_err(OrchestratorError::into_gitspace)
            }),
        )
        .await
        .map_err(StageFailure::gitspace(stage))?;

        match outcome {
            ProvisionOutcome::Ready(resource) => {
                if instance.state == InstanceState::Provisioning {
                    let mut tx = self.pool.begin().await.map_err(db_failure(stage))?;
                    store::update_instance(
                        &mut *tx,
                        &instance.identifier,
                        &[InstanceState::Provisioning],
                        Some(InstanceState::Starting),
                        &[InstanceField::Stage(Some(stage))],
                    )
                    .await
                    .map_err(StageFailure::at(stage))?;
                    store::append_history(
                        &mut *tx,
                        &config.identifier,
                        Some(&instance.identifier),
                        HistoryKind::InfraProvisioned,
                        Some(&resource.handle),
                    )
                    .await
                    .map_err(StageFailure::at(stage))?;
                    tx.commit().await.map_err(db_failure(stage))?;
                } else {
                    self.checkpoint(instance, stage, None)
                        .await
                        .map_err(StageFailure::at(stage))?;
                }
                self.log(instance, &format!("Infrastructure ready on {}", resource.host))
                    .await;
                Ok(Some(resource))
            }
            ProvisionOutcome::Pending { handle } => {
                info!(
                    "Infra for {} is pending ({}); waiting for the provider",
                    config.identifier, handle
                );
                let mut tx = self.pool.begin().await.map_err(db_failure(stage))?;
                store::update_instance(
                    &mut *tx,
                    &instance.identifier,
                    &[InstanceState::Provisioning],
                    None,
                    &[InstanceField::PendingEvent(None)],
                )
                .await
                .map_err(StageFailure::at(stage))?;
                store::append_history(
                    &mut *tx,
                    &config.identifier,
                    Some(&instance.identifier),
                    HistoryKind::InfraProvisioningPending,
                    Some(&handle),
                )
                .await
                .map_err(StageFailure::at(stage))?;
                tx.commit().await.map_err(db_failure(stage))?;
                Ok(None)
            }
        }
    }

    async fn start_container(
        &self,
        instance: &GitspaceInstance,
        resource: &ProvisionedResource,
        args: &RunArgs,
        clone: &CloneInfo,
    ) -> gitspace_core::Result<ContainerHandle> {
        let containers = &self.backends.containers;

        // A container that faulted is not trusted; start from a fresh one.
        let restart = instance.failed_stage == Some(LifecycleStage::StartContainer)
            && matches!(
                instance.error_kind,
                Some(ErrorKind::RuntimeFault) | Some(ErrorKind::Timeout)
            );
        if restart {
            info!("Removing faulted container {}", args.container_name);
            containers
                .remove(&ContainerHandle::for_name(
                    &instance.identifier,
                    &args.container_name,
                    &resource.host,
                ))
                .await?;
        }

        self.log(instance, &format!("Starting container {}", args.container_name))
            .await;
        let handle = with_deadline(
            self.settings.container_start_deadline(),
            "container start",
            retry_with_backoff(&self.settings.stage_retry, "create container", |_| {
                containers.create_and_start(&instance.identifier, resource, args)
            }),
        )
        .await?;

        let cloned = !restart
            && instance
                .stage
                .is_some_and(|stage| stage >= LifecycleStage::StartContainer);
        if !cloned {
            let home = RunArgResolver::home_dir(&args.user);
            self.log(instance, &format!("Cloning {}", clone.clone_url)).await;
            containers
                .exec(&handle, &clone.clone_script(&home), &clone.env())
                .await?;
        }

        Ok(handle)
    }

    async fn configure_ide(
        &self,
        config: &GitspaceConfig,
        instance: &GitspaceInstance,
        handle: &ContainerHandle,
        args: &RunArgs,
        access_token: &str,
    ) -> gitspace_core::Result<ConnectionInfo> {
        let adapter = self.backends.ides.get(config.ide)?;
        let connection = adapter.configure(
            handle,
            &IdeContext {
                ide: config.ide,
                user: &args.user,
                workspace_dir: &args.working_dir,
                access_token,
            },
        )?;

        self.log(instance, &format!("Bootstrapping {}", config.ide)).await;
        let env = BTreeMap::from([(ACCESS_TOKEN_ENV.to_string(), access_token.to_string())]);
        self.backends
            .containers
            .exec(handle, &connection.bootstrap_command, &env)
            .await?;

        Ok(connection)
    }

    async fn finalize_start(
        &self,
        config: &GitspaceConfig,
        instance: &GitspaceInstance,
        connection: &ConnectionInfo,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let updated = store::update_instance(
            &mut *tx,
            &instance.identifier,
            &[InstanceState::Starting],
            Some(InstanceState::Running),
            &[
                InstanceField::Stage(Some(LifecycleStage::Finalize)),
                InstanceField::FailedStage(None),
                InstanceField::Error(None),
                InstanceField::PendingEvent(None),
                InstanceField::Connection {
                    port: connection.port,
                    uri: connection.uri.clone(),
                    bootstrap_command: connection.bootstrap_command.clone(),
                },
                InstanceField::StartedNow,
            ],
        )
        .await?;
        if !updated {
            return Err(OrchestratorError::InvalidState(format!(
                "instance {} is no longer starting",
                instance.identifier
            )));
        }
        store::append_history(
            &mut *tx,
            &config.identifier,
            Some(&instance.identifier),
            HistoryKind::Running,
            Some(&connection.uri),
        )
        .await?;
        enqueue(
            &mut *tx,
            &completed(config, instance, Operation::Start, None),
        )
        .await?;
        tx.commit().await?;

        self.log(instance, "Gitspace is running").await;
        info!("Gitspace {} is running", config.identifier);
        Ok(())
    }

    async fn fail_start(
        &self,
        config: &GitspaceConfig,
        instance: &GitspaceInstance,
        failure: StageFailure,
    ) -> Result<()> {
        let StageFailure { stage, error } = failure;
        let kind = error.kind();
        let message = error.to_string();
        warn!(
            "Start of {} failed at {}: {}",
            config.identifier, stage, message
        );

        if kind == ErrorKind::Timeout {
            self.revert_after_timeout(config, instance, stage).await;
        }

        let mut tx = self.pool.begin().await?;
        store::update_instance(
            &mut *tx,
            &instance.identifier,
            STARTING_STATES,
            Some(InstanceState::Error),
            &[
                InstanceField::FailedStage(Some(stage)),
                InstanceField::Error(Some((kind, message.clone()))),
                InstanceField::PendingEvent(None),
            ],
        )
        .await?;
        let detail = format!("{}: {}", stage, message);
        store::append_history(
            &mut *tx,
            &config.identifier,
            Some(&instance.identifier),
            HistoryKind::Error,
            Some(&detail),
        )
        .await?;
        enqueue(
            &mut *tx,
            &completed(config, instance, Operation::Start, Some(detail.clone())),
        )
        .await?;
        tx.commit().await?;

        self.log(instance, &format!("Start failed: {}", detail)).await;
        Ok(())
    }

    /// Best effort: release what the timed-out stage may have half-created.
    async fn revert_after_timeout(
        &self,
        config: &GitspaceConfig,
        instance: &GitspaceInstance,
        stage: LifecycleStage,
    ) {
        match stage {
            LifecycleStage::ProvisionInfra => {
                if let Err(e) = self.infra.deprovision(&config.identifier).await {
                    warn!("Could not release infra of {}: {}", config.identifier, e);
                }
            }
            LifecycleStage::StartContainer => {
                let name = RunArgResolver::container_name(&config.identifier);
                let handle = ContainerHandle::for_name(&instance.identifier, &name, "");
                if let Err(e) = self.backends.containers.remove(&handle).await {
                    warn!("Could not remove container {}: {}", name, e);
                }
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Asynchronous infra results

    /// Results only count for the allocation the record is still waiting
    /// on; a redelivered or late result for an earlier attempt is dropped.
    async fn handle_infra_provisioned(
        &self,
        event: &LifecycleEvent,
        handle: &str,
        host: &str,
        data: serde_json::Value,
    ) -> Result<()> {
        let config_id = &event.gitspace_id;
        if self
            .infra
            .complete(config_id, handle, host, data)
            .await?
            .is_none()
        {
            warn!(
                "Ignoring infra result {} for {}: no such allocation is pending",
                handle, config_id
            );
            return Ok(());
        }
        info!("Infra {} for {} reported ready on {}", handle, config_id, host);

        match store::latest_instance(&self.pool, config_id).await? {
            Some(instance) if instance.state == InstanceState::Provisioning => {
                let config = self.config(config_id).await?;
                self.start(&config, instance).await
            }
            _ => {
                debug!("No instance of {} is waiting for infra", config_id);
                Ok(())
            }
        }
    }

    async fn handle_infra_failed(
        &self,
        event: &LifecycleEvent,
        handle: &str,
        error: &str,
    ) -> Result<()> {
        let config_id = &event.gitspace_id;
        if !self.infra.fail(config_id, handle, error).await? {
            warn!(
                "Ignoring infra failure {} for {}: no such allocation is pending",
                handle, config_id
            );
            return Ok(());
        }

        match store::latest_instance(&self.pool, config_id).await? {
            Some(instance) if instance.state == InstanceState::Provisioning => {
                let config = self.config(config_id).await?;
                self.fail_start(
                    &config,
                    &instance,
                    StageFailure {
                        stage: LifecycleStage::ProvisionInfra,
                        error: GitspaceError::ResourceUnavailable(error.to_string()),
                    },
                )
                .await
            }
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Stop

    async fn handle_stop(&self, event: &LifecycleEvent) -> Result<()> {
        let Some(instance) = self.pending_instance(event).await? else {
            return Ok(());
        };
        if instance.state != InstanceState::Stopping {
            debug!("Instance {} is {}; nothing to stop", instance.identifier, instance.state);
            return Ok(());
        }
        let config = self.config(&instance.config_id).await?;

        let handle = self.container_handle(&instance);
        let stopped = retry_with_backoff(&self.settings.stage_retry, "stop container", |_| {
            self.backends.containers.stop(&handle)
        })
        .await;

        let mut tx = self.pool.begin().await?;
        match stopped {
            Ok(()) => {
                store::update_instance(
                    &mut *tx,
                    &instance.identifier,
                    &[InstanceState::Stopping],
                    Some(InstanceState::Stopped),
                    &[InstanceField::PendingEvent(None), InstanceField::StoppedNow],
                )
                .await?;
                store::append_history(
                    &mut *tx,
                    &config.identifier,
                    Some(&instance.identifier),
                    HistoryKind::Stopped,
                    None,
                )
                .await?;
                enqueue(&mut *tx, &completed(&config, &instance, Operation::Stop, None)).await?;
                info!("Gitspace {} stopped", config.identifier);
            }
            Err(e) => {
                warn!("Stopping {} failed: {}", config.identifier, e);
                self.persist_failure(&mut tx, &config, &instance, Operation::Stop, e)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Delete

    async fn handle_delete(&self, event: &LifecycleEvent) -> Result<()> {
        let Some(instance) = self.pending_instance(event).await? else {
            return Ok(());
        };
        if instance.state != InstanceState::Deleting {
            debug!("Instance {} is {}; nothing to delete", instance.identifier, instance.state);
            return Ok(());
        }
        let config = self.config(&instance.config_id).await?;

        let torn_down = self.teardown(&config, &instance).await;

        let mut tx = self.pool.begin().await?;
        match torn_down {
            Ok(()) => {
                store::soft_delete_config(&mut *tx, &config.identifier).await?;
                store::update_instance(
                    &mut *tx,
                    &instance.identifier,
                    &[InstanceState::Deleting],
                    Some(InstanceState::Deleted),
                    &[
                        InstanceField::PendingEvent(None),
                        InstanceField::Error(None),
                        InstanceField::StoppedNow,
                    ],
                )
                .await?;
                store::append_history(
                    &mut *tx,
                    &config.identifier,
                    Some(&instance.identifier),
                    HistoryKind::Deleted,
                    None,
                )
                .await?;
                enqueue(&mut *tx, &completed(&config, &instance, Operation::Delete, None))
                    .await?;
                info!("Gitspace {} deleted", config.identifier);
            }
            Err(e) => {
                warn!("Deleting {} failed: {}", config.identifier, e);
                self.persist_failure(&mut tx, &config, &instance, Operation::Delete, e)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    /// Stop and remove the container, then release infra. Each step treats
    /// an already-gone resource as done.
    async fn teardown(
        &self,
        config: &GitspaceConfig,
        instance: &GitspaceInstance,
    ) -> gitspace_core::Result<()> {
        let containers = &self.backends.containers;
        let handle = self.container_handle(instance);
        retry_with_backoff(&self.settings.stage_retry, "stop container", |_| {
            containers.stop(&handle)
        })
        .await?;
        retry_with_backoff(&self.settings.stage_retry, "remove container", |_| {
            containers.remove(&handle)
        })
        .await?;

        let released = retry_with_backoff(&self.settings.stage_retry, "deprovision infra", move |_| async move {
            self.infra
                .deprovision(&config.identifier)
                .await
                .map_err(OrchestratorError::into_gitspace)
        })
        .await;
        match released {
            Ok(()) => {
                store::append_history(
                    &self.pool,
                    &config.identifier,
                    Some(&instance.identifier),
                    HistoryKind::InfraDeprovisioned,
                    None,
                )
                .await
                .map_err(OrchestratorError::into_gitspace)?;
                Ok(())
            }
            Err(GitspaceError::NotFound(_)) => {
                debug!("No infra recorded for {}", config.identifier);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn container_handle(&self, instance: &GitspaceInstance) -> ContainerHandle {
        let name = instance
            .container_name
            .clone()
            .unwrap_or_else(|| RunArgResolver::container_name(&instance.config_id));
        let mut handle = ContainerHandle::for_name(
            &instance.identifier,
            &name,
            instance.host.as_deref().unwrap_or_default(),
        );
        if let Some(id) = &instance.container_id {
            handle.container_id = id.clone();
        }
        handle
    }

    /// Move a stopping or deleting instance to `Error`, inside `tx`.
    async fn persist_failure(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        config: &GitspaceConfig,
        instance: &GitspaceInstance,
        operation: Operation,
        error: GitspaceError,
    ) -> Result<()> {
        let message = error.to_string();
        store::update_instance(
            &mut **tx,
            &instance.identifier,
            &[instance.state],
            Some(InstanceState::Error),
            &[
                InstanceField::Error(Some((error.kind(), message.clone()))),
                InstanceField::PendingEvent(None),
            ],
        )
        .await?;
        let detail = format!("{}: {}", operation, message);
        store::append_history(
            &mut **tx,
            &config.identifier,
            Some(&instance.identifier),
            HistoryKind::Error,
            Some(&detail),
        )
        .await?;
        enqueue(
            &mut **tx,
            &completed(config, instance, operation, Some(message)),
        )
        .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Operation results

    async fn record_operation(
        &self,
        event: &LifecycleEvent,
        operation: Operation,
        succeeded: bool,
        detail: Option<&str>,
    ) -> Result<()> {
        let summary = match (succeeded, detail) {
            (true, _) => format!("{} succeeded", operation),
            (false, Some(detail)) => format!("{} failed: {}", operation, detail),
            (false, None) => format!("{} failed", operation),
        };
        let recorded = store::append_event_history(
            &self.pool,
            &event.id,
            &event.gitspace_id,
            event.instance_id.as_deref(),
            HistoryKind::OperationCompleted,
            Some(&summary),
        )
        .await?;
        if !recorded {
            debug!("Operation result {} already recorded", event.id);
        }
        Ok(())
    }
}

fn completed(
    config: &GitspaceConfig,
    instance: &GitspaceInstance,
    operation: Operation,
    failure: Option<String>,
) -> LifecycleEvent {
    LifecycleEvent::new(
        &config.identifier,
        Some(&instance.identifier),
        EventPayload::OperationCompleted {
            operation,
            succeeded: failure.is_none(),
            detail: failure,
        },
    )
}

fn db_failure(stage: LifecycleStage) -> impl FnOnce(sqlx::Error) -> StageFailure {
    move |e| StageFailure::at(stage)(OrchestratorError::Database(e))
}

/// Run `fut` under `deadline`, mapping expiry to a `Timeout` error.
async fn with_deadline<T>(
    deadline: Duration,
    what: &str,
    fut: impl Future<Output = gitspace_core::Result<T>>,
) -> gitspace_core::Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(GitspaceError::Timeout(format!(
            "{} exceeded {}s",
            what,
            deadline.as_secs()
        ))),
    }
}
