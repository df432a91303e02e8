//! Infrastructure and container backends for gitspaces.
//!
//! This library defines the two backend contracts the orchestration engine
//! drives: [`InfraProvider`] allocates a host able to run containers, and
//! [`ContainerOrchestrator`] runs the workspace container on that host. Both
//! are selected from registries built once at startup.

// Standard library
use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

// External crates
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use gitspace_core::error::{GitspaceError, Result};

pub mod generic;
pub mod runarg;

#[cfg(feature = "docker")]
pub mod docker;

// When the `test-helpers` feature is enabled, include the fake backends.
#[cfg(any(test, feature = "test-helpers"))]
pub mod mock;

pub use runarg::{Mount, RunArgContext, RunArgDefaults, RunArgResolver, RunArgs};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfraProviderType {
    /// Containers run on the local Docker daemon.
    Docker,
    /// Hosts are allocated by an external provisioning service.
    Generic,
}

impl Display for InfraProviderType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            InfraProviderType::Docker => f.write_str("docker"),
            InfraProviderType::Generic => f.write_str("generic"),
        }
    }
}

impl std::str::FromStr for InfraProviderType {
    type Err = GitspaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "docker" => Ok(InfraProviderType::Docker),
            "generic" => Ok(InfraProviderType::Generic),
            other => Err(GitspaceError::Validation(format!(
                "Unknown infra provider: {}",
                other
            ))),
        }
    }
}

/// A named shape of infrastructure a gitspace config can reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTemplate {
    pub identifier: String,
    pub provider: InfraProviderType,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub cpus: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
    /// Extra container runtime arguments, validated by the run-arg resolver.
    #[serde(default)]
    pub run_args: BTreeMap<String, String>,
}

/// Infrastructure allocated for one gitspace config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionedResource {
    pub config_id: String,
    pub template_id: String,
    pub provider_type: InfraProviderType,
    /// Provider-specific handle (volume name, remote host id, ...).
    pub handle: String,
    /// Address the workspace container will be reachable on.
    pub host: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionOutcome {
    Ready(ProvisionedResource),
    /// The provider accepted the request and will report completion through
    /// the infra-provisioning event stream.
    Pending { handle: String },
}

/// Allocates and releases infrastructure for gitspaces.
#[async_trait]
pub trait InfraProvider: Send + Sync {
    fn provider_type(&self) -> InfraProviderType;

    /// Allocate infrastructure for `config_id`. Implementations detect an
    /// existing allocation and return it instead of allocating twice.
    async fn provision(
        &self,
        config_id: &str,
        template: &ResourceTemplate,
    ) -> Result<ProvisionOutcome>;

    /// Release infrastructure. A resource that is already gone is a success.
    async fn deprovision(&self, resource: &ProvisionedResource) -> Result<()>;
}

/// Live container, as far as the orchestrator is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub gitspace_id: String,
    pub container_id: String,
    pub container_name: String,
    pub host: String,
    /// Container port to host port.
    #[serde(default)]
    pub ports: BTreeMap<u16, u16>,
}

impl ContainerHandle {
    /// Handle addressing a container by name only, for teardown paths where
    /// the runtime id was never recorded.
    pub fn for_name(gitspace_id: &str, container_name: &str, host: &str) -> Self {
        Self {
            gitspace_id: gitspace_id.to_string(),
            container_id: String::new(),
            container_name: container_name.to_string(),
            host: host.to_string(),
            ports: BTreeMap::new(),
        }
    }

    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports.get(&container_port).copied()
    }
}

/// Runs the workspace container.
#[async_trait]
pub trait ContainerOrchestrator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create the container if needed and make sure it is running. Calling
    /// this for a container that already runs returns its handle unchanged.
    async fn create_and_start(
        &self,
        gitspace_id: &str,
        resource: &ProvisionedResource,
        args: &RunArgs,
    ) -> Result<ContainerHandle>;

    /// Run a shell script inside the container, streaming its output to the
    /// log sink, and fail with `RuntimeFault` on a non-zero exit.
    async fn exec(
        &self,
        handle: &ContainerHandle,
        script: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Stop the container. Stopping a stopped or missing container succeeds.
    async fn stop(&self, handle: &ContainerHandle) -> Result<()>;

    /// Remove the container. Removing a missing container succeeds.
    async fn remove(&self, handle: &ContainerHandle) -> Result<()>;
}

/// Configuration-time registry of infra providers.
#[derive(Clone, Default)]
pub struct InfraProviderRegistry {
    providers: HashMap<InfraProviderType, Arc<dyn InfraProvider>>,
}

impl InfraProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, provider: Arc<dyn InfraProvider>) -> Self {
        self.providers.insert(provider.provider_type(), provider);
        self
    }

    pub fn get(&self, provider_type: InfraProviderType) -> Result<Arc<dyn InfraProvider>> {
        self.providers.get(&provider_type).cloned().ok_or_else(|| {
            GitspaceError::Validation(format!(
                "Infra provider not configured: {}",
                provider_type
            ))
        })
    }

    pub fn contains(&self, provider_type: InfraProviderType) -> bool {
        self.providers.contains_key(&provider_type)
    }
}
