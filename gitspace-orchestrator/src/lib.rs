//! Gitspace orchestration engine
//!
//! This crate turns declarative gitspace configs into running or stopped
//! container workspaces. The [`GitspaceService`] records intent and emits
//! lifecycle events; the [`EventConsumer`] loops feed those events to the
//! [`Orchestrator`], which drives infra, container and IDE backends through a
//! checkpointed state machine.

pub mod bus;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod event;
pub mod ide;
pub mod infra;
pub mod instance;
pub mod lock;
pub mod log_sink;
pub mod orchestrator;
pub mod scm;
pub mod secret;
pub mod service;
pub mod settings;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use bus::{Delivery, EventBus, SqliteEventBus};
pub use config::{ConfigFilters, CreateConfigRequest, GitspaceConfig, UpdateConfigRequest};
pub use consumer::{spawn_consumers, EventConsumer};
pub use error::{OrchestratorError, Result};
pub use event::{EventCategory, EventPayload, HistoryKind, HistoryRecord, LifecycleEvent, Operation};
pub use ide::{IdeRegistry, IdeSettings, IdeType};
pub use infra::{InfraProvisionedResource, InfraProvisioner, ProvisioningStatus, TemplateRegistry};
pub use instance::{GitspaceInstance, GitspaceStatus, InstanceState, LifecycleStage};
pub use lock::LockManager;
pub use log_sink::SqliteLogSink;
pub use orchestrator::{Backends, Orchestrator};
pub use scm::{CodeRepoType, ScmRegistry};
pub use secret::SecretRegistry;
pub use service::{GitspaceService, InfraCallbackRequest};
pub use settings::{EventSettings, OrchestratorSettings};
