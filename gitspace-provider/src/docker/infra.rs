use async_trait::async_trait;
use tracing::{info, instrument};

use super::command::DockerCommand;
use super::DockerSettings;
use crate::{
    GitspaceError, InfraProvider, InfraProviderType, ProvisionOutcome, ProvisionedResource,
    ResourceTemplate, Result,
};

/// Embedded infra provider: the local Docker daemon is the host, and each
/// gitspace owns a named volume for its home directory.
#[derive(Debug, Clone)]
pub struct DockerInfraProvider {
    settings: DockerSettings,
}

impl DockerInfraProvider {
    pub fn new(settings: DockerSettings) -> Self {
        Self { settings }
    }

    pub fn volume_name(config_id: &str) -> String {
        format!("gitspace-{}-home", config_id)
    }

    fn resource(&self, config_id: &str, template: &ResourceTemplate) -> ProvisionedResource {
        let volume = Self::volume_name(config_id);
        ProvisionedResource {
            config_id: config_id.to_string(),
            template_id: template.identifier.clone(),
            provider_type: InfraProviderType::Docker,
            handle: volume.clone(),
            host: self.settings.host.clone(),
            data: serde_json::json!({ "volume": volume }),
        }
    }

    async fn ensure_daemon(&self) -> Result<()> {
        DockerCommand::new(&self.settings.binary, "info")
            .args(["--format", "{{.ServerVersion}}"])
            .execute_with(|out| {
                GitspaceError::ResourceUnavailable(format!(
                    "Docker daemon is not usable: {}",
                    out.stderr
                ))
            })
            .await
            .map(|_| ())
    }

    async fn volume_exists(&self, volume: &str) -> Result<bool> {
        let output = DockerCommand::new(&self.settings.binary, "volume")
            .args(["inspect", volume])
            .output()
            .await?;
        if output.success {
            Ok(true)
        } else if output.is_not_found() {
            Ok(false)
        } else if output.daemon_unreachable() {
            Err(GitspaceError::ResourceUnavailable(output.stderr))
        } else {
            Err(GitspaceError::RuntimeFault(format!(
                "Failed to inspect volume {}: {}",
                volume, output.stderr
            )))
        }
    }
}

#[async_trait]
impl InfraProvider for DockerInfraProvider {
    fn provider_type(&self) -> InfraProviderType {
        InfraProviderType::Docker
    }

    #[instrument(skip(self, template), fields(gitspace_id = %config_id))]
    async fn provision(
        &self,
        config_id: &str,
        template: &ResourceTemplate,
    ) -> Result<ProvisionOutcome> {
        self.ensure_daemon().await?;

        let resource = self.resource(config_id, template);
        if self.volume_exists(&resource.handle).await? {
            info!("Reusing existing volume {}", resource.handle);
            return Ok(ProvisionOutcome::Ready(resource));
        }

        DockerCommand::new(&self.settings.binary, "volume")
            .args(["create", "--label"])
            .arg(format!("gitspace.id={}", config_id))
            .arg(&resource.handle)
            .execute_with(|out| {
                GitspaceError::ResourceUnavailable(format!(
                    "Failed to create volume: {}",
                    out.stderr
                ))
            })
            .await?;

        info!("Created volume {}", resource.handle);
        Ok(ProvisionOutcome::Ready(resource))
    }

    #[instrument(skip(self, resource), fields(gitspace_id = %resource.config_id))]
    async fn deprovision(&self, resource: &ProvisionedResource) -> Result<()> {
        let output = DockerCommand::new(&self.settings.binary, "volume")
            .args(["rm", "--force"])
            .arg(&resource.handle)
            .output()
            .await?;

        if output.success || output.is_not_found() {
            info!("Released volume {}", resource.handle);
            return Ok(());
        }
        if output.daemon_unreachable() {
            return Err(GitspaceError::ResourceUnavailable(output.stderr));
        }
        Err(GitspaceError::RuntimeFault(format!(
            "Failed to remove volume {}: {}",
            resource.handle, output.stderr
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_shape() {
        let provider = DockerInfraProvider::new(DockerSettings::default());
        let template = ResourceTemplate {
            identifier: "standard".to_string(),
            provider: InfraProviderType::Docker,
            image: None,
            cpus: None,
            memory: None,
            run_args: Default::default(),
        };

        let resource = provider.resource("c1", &template);
        assert_eq!(resource.handle, "gitspace-c1-home");
        assert_eq!(resource.host, "localhost");
        assert_eq!(resource.data["volume"], "gitspace-c1-home");
        assert_eq!(resource.template_id, "standard");
    }

    #[tokio::test]
    async fn test_provision_without_docker_is_resource_unavailable() {
        let provider = DockerInfraProvider::new(DockerSettings {
            binary: "definitely-not-a-docker-binary".to_string(),
            ..Default::default()
        });
        let template = ResourceTemplate {
            identifier: "standard".to_string(),
            provider: InfraProviderType::Docker,
            image: None,
            cpus: None,
            memory: None,
            run_args: Default::default(),
        };

        let err = provider.provision("c1", &template).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
