//! In-memory backends for exercising the orchestration engine without a
//! container runtime.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::{
    ContainerHandle, ContainerOrchestrator, GitspaceError, InfraProvider, InfraProviderType,
    ProvisionOutcome, ProvisionedResource, ResourceTemplate, Result, RunArgs,
};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Infra provider keeping allocations in a map.
#[derive(Debug)]
pub struct FakeInfraProvider {
    provider_type: InfraProviderType,
    pending: bool,
    host: String,
    resources: Mutex<HashMap<String, ProvisionedResource>>,
    provision_failures: Mutex<VecDeque<GitspaceError>>,
    deprovision_failures: Mutex<VecDeque<GitspaceError>>,
    provision_calls: AtomicUsize,
    deprovision_calls: AtomicUsize,
}

impl Default for FakeInfraProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeInfraProvider {
    pub fn new() -> Self {
        Self {
            provider_type: InfraProviderType::Docker,
            pending: false,
            host: "localhost".to_string(),
            resources: Mutex::new(HashMap::new()),
            provision_failures: Mutex::new(VecDeque::new()),
            deprovision_failures: Mutex::new(VecDeque::new()),
            provision_calls: AtomicUsize::new(0),
            deprovision_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_type(mut self, provider_type: InfraProviderType) -> Self {
        self.provider_type = provider_type;
        self
    }

    /// Answer every provision with `Pending`, like an asynchronous provider.
    pub fn pending(mut self) -> Self {
        self.pending = true;
        self
    }

    /// Fail the next provision call with `err`. Queued failures are consumed
    /// in order.
    pub fn fail_next_provision(&self, err: GitspaceError) {
        locked(&self.provision_failures).push_back(err);
    }

    pub fn fail_next_deprovision(&self, err: GitspaceError) {
        locked(&self.deprovision_failures).push_back(err);
    }

    /// The resource a completed allocation for `config_id` would produce.
    pub fn resource_for(&self, config_id: &str, template_id: &str) -> ProvisionedResource {
        ProvisionedResource {
            config_id: config_id.to_string(),
            template_id: template_id.to_string(),
            provider_type: self.provider_type,
            handle: format!("fake-{}", config_id),
            host: self.host.clone(),
            data: serde_json::json!({ "volume": format!("fake-{}-home", config_id) }),
        }
    }

    pub fn is_provisioned(&self, config_id: &str) -> bool {
        locked(&self.resources).contains_key(config_id)
    }

    pub fn resource(&self, config_id: &str) -> Option<ProvisionedResource> {
        locked(&self.resources).get(config_id).cloned()
    }

    pub fn live_count(&self) -> usize {
        locked(&self.resources).len()
    }

    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn deprovision_calls(&self) -> usize {
        self.deprovision_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InfraProvider for FakeInfraProvider {
    fn provider_type(&self) -> InfraProviderType {
        self.provider_type
    }

    async fn provision(
        &self,
        config_id: &str,
        template: &ResourceTemplate,
    ) -> Result<ProvisionOutcome> {
        let attempt = self.provision_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(err) = locked(&self.provision_failures).pop_front() {
            return Err(err);
        }
        if self.pending {
            // Each request gets its own handle, as a remote provisioner would.
            return Ok(ProvisionOutcome::Pending {
                handle: format!("fake-{}-{}", config_id, attempt),
            });
        }

        let mut resources = locked(&self.resources);
        let resource = resources
            .entry(config_id.to_string())
            .or_insert_with(|| self.resource_for(config_id, &template.identifier))
            .clone();
        Ok(ProvisionOutcome::Ready(resource))
    }

    async fn deprovision(&self, resource: &ProvisionedResource) -> Result<()> {
        self.deprovision_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = locked(&self.deprovision_failures).pop_front() {
            return Err(err);
        }
        locked(&self.resources).remove(&resource.config_id);
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct FakeContainer {
    handle: ContainerHandle,
    running: bool,
}

/// A script executed through [`FakeContainerOrchestrator::exec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub gitspace_id: String,
    pub script: String,
    pub env: BTreeMap<String, String>,
}

/// Container orchestrator keeping containers in a map, keyed by name.
#[derive(Debug, Default)]
pub struct FakeContainerOrchestrator {
    containers: Mutex<HashMap<String, FakeContainer>>,
    start_failures: Mutex<VecDeque<GitspaceError>>,
    exec_failures: Mutex<VecDeque<GitspaceError>>,
    execs: Mutex<Vec<ExecRecord>>,
    start_delay: Option<Duration>,
    start_calls: AtomicUsize,
    creations: AtomicUsize,
    stops: AtomicUsize,
    removes: AtomicUsize,
}

impl FakeContainerOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep inside every `create_and_start`, to let a deadline expire.
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    pub fn fail_next_start(&self, err: GitspaceError) {
        locked(&self.start_failures).push_back(err);
    }

    pub fn fail_next_exec(&self, err: GitspaceError) {
        locked(&self.exec_failures).push_back(err);
    }

    /// Host port the fake publishes for a container port.
    pub fn host_port_for(container_port: u16) -> u16 {
        30000u16.saturating_add(container_port)
    }

    pub fn is_running(&self, container_name: &str) -> bool {
        locked(&self.containers)
            .get(container_name)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    pub fn exists(&self, container_name: &str) -> bool {
        locked(&self.containers).contains_key(container_name)
    }

    pub fn container_count(&self) -> usize {
        locked(&self.containers).len()
    }

    pub fn execs(&self) -> Vec<ExecRecord> {
        locked(&self.execs).clone()
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    /// Containers actually created, not counting reuse of an existing one.
    pub fn creations(&self) -> usize {
        self.creations.load(Ordering::SeqCst)
    }

    /// Running containers actually stopped.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn removes(&self) -> usize {
        self.removes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerOrchestrator for FakeContainerOrchestrator {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn create_and_start(
        &self,
        gitspace_id: &str,
        resource: &ProvisionedResource,
        args: &RunArgs,
    ) -> Result<ContainerHandle> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.start_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = locked(&self.start_failures).pop_front() {
            return Err(err);
        }

        let mut containers = locked(&self.containers);
        if let Some(existing) = containers.get_mut(&args.container_name) {
            existing.running = true;
            return Ok(existing.handle.clone());
        }

        let handle = ContainerHandle {
            gitspace_id: gitspace_id.to_string(),
            container_id: format!("fake-{}", args.container_name),
            container_name: args.container_name.clone(),
            host: resource.host.clone(),
            ports: args
                .ports
                .iter()
                .map(|p| (*p, Self::host_port_for(*p)))
                .collect(),
        };
        containers.insert(
            args.container_name.clone(),
            FakeContainer {
                handle: handle.clone(),
                running: true,
            },
        );
        self.creations.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn exec(
        &self,
        handle: &ContainerHandle,
        script: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        locked(&self.execs).push(ExecRecord {
            gitspace_id: handle.gitspace_id.clone(),
            script: script.to_string(),
            env: env.clone(),
        });
        if let Some(err) = locked(&self.exec_failures).pop_front() {
            return Err(err);
        }
        if !self.is_running(&handle.container_name) {
            return Err(GitspaceError::RuntimeFault(format!(
                "{} is not running",
                handle.container_name
            )));
        }
        Ok(())
    }

    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        if let Some(container) = locked(&self.containers).get_mut(&handle.container_name) {
            if container.running {
                container.running = false;
                self.stops.fetch_add(1, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        if locked(&self.containers)
            .remove(&handle.container_name)
            .is_some()
        {
            self.removes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> ResourceTemplate {
        ResourceTemplate {
            identifier: "standard".to_string(),
            provider: InfraProviderType::Docker,
            image: None,
            cpus: None,
            memory: None,
            run_args: BTreeMap::new(),
        }
    }

    fn run_args() -> RunArgs {
        RunArgs {
            image: "busybox".to_string(),
            container_name: "gitspace-g1".to_string(),
            ports: vec![8089],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fake_provider_reuses_allocation() {
        let provider = FakeInfraProvider::new();
        let first = provider.provision("c1", &template()).await.unwrap();
        let second = provider.provision("c1", &template()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(provider.live_count(), 1);
        assert_eq!(provider.provision_calls(), 2);
    }

    #[tokio::test]
    async fn test_fake_provider_scripted_failure() {
        let provider = FakeInfraProvider::new();
        provider.fail_next_provision(GitspaceError::ResourceUnavailable("full".into()));

        assert!(provider.provision("c1", &template()).await.is_err());
        assert!(provider.provision("c1", &template()).await.is_ok());
    }

    #[tokio::test]
    async fn test_fake_orchestrator_start_is_idempotent() {
        let orchestrator = FakeContainerOrchestrator::new();
        let resource = FakeInfraProvider::new().resource_for("c1", "standard");

        let first = orchestrator
            .create_and_start("g1", &resource, &run_args())
            .await
            .unwrap();
        let second = orchestrator
            .create_and_start("g1", &resource, &run_args())
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(orchestrator.creations(), 1);
        assert_eq!(first.host_port(8089), Some(38089));
    }

    #[tokio::test]
    async fn test_fake_orchestrator_stop_and_remove_tolerate_missing() {
        let orchestrator = FakeContainerOrchestrator::new();
        let handle = ContainerHandle::for_name("g1", "gitspace-g1", "localhost");

        orchestrator.stop(&handle).await.unwrap();
        orchestrator.remove(&handle).await.unwrap();
        assert_eq!(orchestrator.stops(), 0);
        assert_eq!(orchestrator.removes(), 0);
    }
}
