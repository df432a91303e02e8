use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use gitspace_core::RetryPolicy;
use gitspace_provider::mock::{FakeContainerOrchestrator, FakeInfraProvider};
use gitspace_provider::{InfraProviderRegistry, InfraProviderType, ResourceTemplate, RunArgResolver};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;

use crate::bus::SqliteEventBus;
use crate::config::{CreateConfigRequest, GitspaceConfig};
use crate::consumer::EventConsumer;
use crate::event::EventCategory;
use crate::ide::{IdeRegistry, IdeSettings, IdeType};
use crate::infra::{InfraProvisioner, TemplateRegistry};
use crate::instance::GitspaceInstance;
use crate::lock::LockManager;
use crate::log_sink::SqliteLogSink;
use crate::orchestrator::{Backends, Orchestrator};
use crate::scm::{CodeRepoType, GenericScm, InternalScm, ScmRegistry};
use crate::secret::{SecretRegistry, StaticPasswordResolver};
use crate::service::GitspaceService;
use crate::settings::{EventSettings, OrchestratorSettings};
use crate::store;

/// Helper to create an in-memory test database with migrations applied
pub async fn create_test_db() -> SqlitePool {
    // A single connection that never expires; every connection to
    // `sqlite::memory:` would otherwise be a separate empty database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

pub fn standard_template() -> ResourceTemplate {
    ResourceTemplate {
        identifier: "standard".to_string(),
        provider: InfraProviderType::Docker,
        image: None,
        cpus: Some("2".to_string()),
        memory: Some("4g".to_string()),
        run_args: BTreeMap::new(),
    }
}

pub fn sample_config(identifier: &str) -> GitspaceConfig {
    let now = Utc::now();
    GitspaceConfig {
        identifier: identifier.to_string(),
        owner: "alice".to_string(),
        repo_ref: "acme/widgets".to_string(),
        repo_type: CodeRepoType::Internal,
        branch: Some("main".to_string()),
        ide: IdeType::VsCodeWeb,
        infra_resource_ref: "standard".to_string(),
        secret_ref: None,
        created_at: now,
        updated_at: now,
        is_deleted: false,
    }
}

pub fn create_request(identifier: &str, ide: IdeType) -> CreateConfigRequest {
    CreateConfigRequest {
        identifier: Some(identifier.to_string()),
        owner: "alice".to_string(),
        repo_ref: "acme/widgets".to_string(),
        repo_type: CodeRepoType::Internal,
        branch: Some("main".to_string()),
        ide: ide.as_str().to_string(),
        infra_resource_ref: "standard".to_string(),
        secret_ref: None,
    }
}

/// Knobs for [`TestHarness::with_options`].
pub struct HarnessOptions {
    pub docker: FakeInfraProvider,
    pub generic: FakeInfraProvider,
    pub containers: FakeContainerOrchestrator,
    pub orchestrator: OrchestratorSettings,
    pub events: EventSettings,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            docker: FakeInfraProvider::new(),
            generic: FakeInfraProvider::new()
                .with_type(InfraProviderType::Generic)
                .pending(),
            containers: FakeContainerOrchestrator::new(),
            orchestrator: OrchestratorSettings {
                lock_timeout_ms: 200,
                stage_retry: RetryPolicy {
                    max_attempts: 3,
                    initial_backoff_ms: 1,
                    max_backoff_ms: 5,
                },
                provision_deadline_secs: 5,
                container_start_deadline_secs: 5,
                max_active_per_owner: None,
            },
            events: EventSettings {
                poll_interval_ms: 10,
                visibility_timeout_secs: 60,
                max_deliveries: 3,
            },
        }
    }
}

/// The engine wired to in-memory backends and an in-memory database.
///
/// Templates: `standard` and `large` on the docker fake, `remote` on the
/// asynchronous generic fake.
pub struct TestHarness {
    pub pool: SqlitePool,
    pub docker: Arc<FakeInfraProvider>,
    pub generic: Arc<FakeInfraProvider>,
    pub containers: Arc<FakeContainerOrchestrator>,
    pub locks: Arc<LockManager>,
    pub bus: Arc<SqliteEventBus>,
    pub orchestrator: Arc<Orchestrator>,
    pub service: GitspaceService,
    pub events: EventSettings,
}

impl TestHarness {
    pub async fn new() -> Self {
        Self::with_options(HarnessOptions::default()).await
    }

    pub async fn with_options(options: HarnessOptions) -> Self {
        let pool = create_test_db().await;
        let docker = Arc::new(options.docker);
        let generic = Arc::new(options.generic);
        let containers = Arc::new(options.containers);

        let mut large = standard_template();
        large.identifier = "large".to_string();
        large.cpus = Some("8".to_string());
        let mut remote = standard_template();
        remote.identifier = "remote".to_string();
        remote.provider = InfraProviderType::Generic;

        let infra = InfraProvisioner::new(
            pool.clone(),
            InfraProviderRegistry::new()
                .register(docker.clone())
                .register(generic.clone()),
            TemplateRegistry::new([standard_template(), large, remote]),
        );
        let backends = Backends {
            containers: containers.clone(),
            run_args: RunArgResolver::default(),
            ides: IdeRegistry::from_settings(&IdeSettings::default()),
            scms: ScmRegistry::new()
                .register(Arc::new(
                    InternalScm::new("https://code.example.com").expect("valid base url"),
                ))
                .register(Arc::new(GenericScm)),
            secrets: SecretRegistry::new().register(Arc::new(StaticPasswordResolver)),
            logs: Arc::new(SqliteLogSink::new(pool.clone())),
        };
        let locks = Arc::new(LockManager::new(options.orchestrator.lock_timeout()));
        let orchestrator = Arc::new(Orchestrator::new(
            pool.clone(),
            infra,
            backends,
            locks.clone(),
            options.orchestrator,
        ));
        let bus = Arc::new(SqliteEventBus::new(
            pool.clone(),
            options.events.visibility_timeout(),
        ));

        Self {
            service: GitspaceService::new(orchestrator.clone()),
            pool,
            docker,
            generic,
            containers,
            locks,
            bus,
            orchestrator,
            events: options.events,
        }
    }

    pub fn consumer(&self, category: EventCategory) -> EventConsumer {
        EventConsumer::new(
            category,
            self.bus.clone(),
            self.orchestrator.clone(),
            self.events.clone(),
        )
    }

    /// Run every consumer until no category has a visible event left.
    /// Returns how many events were taken.
    pub async fn drain(&self) -> usize {
        let consumers: Vec<_> = EventCategory::ALL
            .into_iter()
            .map(|category| self.consumer(category))
            .collect();
        let mut taken = 0;
        loop {
            let mut progressed = false;
            for consumer in &consumers {
                while consumer.process_next().await.expect("consumer failed") {
                    taken += 1;
                    progressed = true;
                }
            }
            if !progressed {
                return taken;
            }
        }
    }

    pub async fn create(&self, identifier: &str, ide: IdeType) -> GitspaceConfig {
        self.service
            .create_config(create_request(identifier, ide))
            .await
            .expect("create config")
    }

    pub async fn instance(&self, config_id: &str) -> GitspaceInstance {
        store::latest_instance(&self.pool, config_id)
            .await
            .expect("query instance")
            .expect("instance exists")
    }
}
