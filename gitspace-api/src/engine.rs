//! Builds the orchestration engine from configuration: registries are
//! constructed once here and never change while the process runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use gitspace_orchestrator::scm::{GenericScm, InternalScm};
use gitspace_orchestrator::secret::{FileSecretResolver, StaticPasswordResolver};
use gitspace_orchestrator::{
    spawn_consumers, Backends, GitspaceService, IdeRegistry, InfraProvisioner, LockManager,
    Orchestrator, ScmRegistry, SecretRegistry, SqliteEventBus, SqliteLogSink, TemplateRegistry,
};
use gitspace_provider::docker::{DockerInfraProvider, EmbeddedDockerOrchestrator};
use gitspace_provider::generic::GenericInfraProvider;
use gitspace_provider::{InfraProviderRegistry, RunArgResolver};
use sqlx::SqlitePool;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;

pub struct Engine {
    pub orchestrator: Arc<Orchestrator>,
    pub service: GitspaceService,
    pub bus: Arc<SqliteEventBus>,
    config: Config,
}

impl Engine {
    pub fn build(config: &Config, pool: SqlitePool) -> Result<Self> {
        let logs = Arc::new(SqliteLogSink::new(pool.clone()));

        let mut providers = InfraProviderRegistry::new()
            .register(Arc::new(DockerInfraProvider::new(config.docker.clone())));
        if let Some(generic) = &config.generic_provider {
            let provider = GenericInfraProvider::new(
                &generic.endpoint,
                Duration::from_secs(generic.timeout_secs),
            )
            .context("Failed to configure generic infra provider")?;
            providers = providers.register(Arc::new(provider));
            info!("Generic infra provider at {}", generic.endpoint);
        }

        let scms = ScmRegistry::new()
            .register(Arc::new(
                InternalScm::new(&config.scm.internal_base_url)
                    .context("Invalid scm.internal_base_url")?,
            ))
            .register(Arc::new(GenericScm));

        let mut secrets = SecretRegistry::new().register(Arc::new(StaticPasswordResolver));
        if let Some(dir) = &config.secrets_dir {
            secrets = secrets.register(Arc::new(FileSecretResolver::new(dir)));
        }

        let backends = Backends {
            containers: Arc::new(EmbeddedDockerOrchestrator::new(
                config.docker.clone(),
                logs.clone(),
            )),
            run_args: RunArgResolver::new(config.run_args.clone()),
            ides: IdeRegistry::from_settings(&config.ide),
            scms,
            secrets,
            logs,
        };

        let infra = InfraProvisioner::new(
            pool.clone(),
            providers,
            TemplateRegistry::new(config.infra_resources.iter().cloned()),
        );
        let locks = Arc::new(LockManager::new(config.orchestrator.lock_timeout()));
        let orchestrator = Arc::new(Orchestrator::new(
            pool.clone(),
            infra,
            backends,
            locks,
            config.orchestrator.clone(),
        ));
        let bus = Arc::new(SqliteEventBus::new(
            pool,
            config.events.visibility_timeout(),
        ));

        info!(
            "Engine ready with {} infra resource template(s)",
            config.infra_resources.len()
        );

        Ok(Self {
            service: GitspaceService::new(orchestrator.clone()),
            orchestrator,
            bus,
            config: config.clone(),
        })
    }

    /// Start the consumer loops; they stop once `shutdown` turns true.
    pub fn start_consumers(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        spawn_consumers(
            self.bus.clone(),
            self.orchestrator.clone(),
            &self.config.events,
            shutdown,
        )
    }
}
