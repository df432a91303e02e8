//! Container runtime arguments for a gitspace.
//!
//! Arguments come from two places: static defaults configured at startup
//! (image, user, extra environment, labels) and dynamic values known only for
//! a specific gitspace (its resource template, provisioned volume, IDE port).

use crate::{GitspaceError, ProvisionedResource, ResourceTemplate, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Template `run_args` keys the resolver understands.
const SUPPORTED_RUN_ARGS: &[&str] = &["cpus", "memory", "network", "shm_size", "user"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunArgs {
    pub image: String,
    pub container_name: String,
    pub user: String,
    pub working_dir: String,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    /// Container ports published on an ephemeral host port.
    pub ports: Vec<u16>,
    pub network: Option<String>,
    pub cpus: Option<String>,
    pub memory: Option<String>,
    pub shm_size: Option<String>,
    /// Keeps the container alive so the IDE bootstrap can exec into it.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArgDefaults {
    #[serde(default = "default_image")]
    pub default_image: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_image() -> String {
    "mcr.microsoft.com/devcontainers/base:ubuntu".to_string()
}

fn default_user() -> String {
    "vscode".to_string()
}

impl Default for RunArgDefaults {
    fn default() -> Self {
        Self {
            default_image: default_image(),
            user: default_user(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }
}

/// Per-gitspace inputs to run-argument resolution.
#[derive(Debug, Clone)]
pub struct RunArgContext<'a> {
    pub gitspace_id: &'a str,
    pub repo_name: &'a str,
    pub template: &'a ResourceTemplate,
    pub resource: &'a ProvisionedResource,
    pub ide_port: u16,
}

#[derive(Debug, Clone, Default)]
pub struct RunArgResolver {
    defaults: RunArgDefaults,
}

impl RunArgResolver {
    pub fn new(defaults: RunArgDefaults) -> Self {
        Self { defaults }
    }

    /// Deterministic container name, so a retried start finds its container.
    pub fn container_name(gitspace_id: &str) -> String {
        format!("gitspace-{}", gitspace_id)
    }

    pub fn home_dir(user: &str) -> String {
        format!("/home/{}", user)
    }

    pub fn resolve(&self, ctx: &RunArgContext<'_>) -> Result<RunArgs> {
        for key in ctx.template.run_args.keys() {
            if !SUPPORTED_RUN_ARGS.contains(&key.as_str()) {
                return Err(GitspaceError::Validation(format!(
                    "Unsupported run argument '{}' in resource template '{}'",
                    key, ctx.template.identifier
                )));
            }
        }

        let template_arg = |key: &str| ctx.template.run_args.get(key).cloned();

        let user = template_arg("user").unwrap_or_else(|| self.defaults.user.clone());
        let home = Self::home_dir(&user);
        let working_dir = format!("{}/{}", home, ctx.repo_name);

        let mut env = self.defaults.env.clone();
        env.insert("GITSPACE_ID".to_string(), ctx.gitspace_id.to_string());
        env.insert("GITSPACE_HOME".to_string(), home.clone());
        env.insert("GITSPACE_WORKSPACE".to_string(), working_dir.clone());

        let mut labels = self.defaults.labels.clone();
        labels.insert("gitspace.id".to_string(), ctx.gitspace_id.to_string());
        labels.insert(
            "gitspace.template".to_string(),
            ctx.template.identifier.clone(),
        );

        let mut mounts = Vec::new();
        if let Some(volume) = ctx.resource.data.get("volume").and_then(|v| v.as_str()) {
            mounts.push(Mount {
                source: volume.to_string(),
                target: home.clone(),
                read_only: false,
            });
        }

        Ok(RunArgs {
            image: ctx
                .template
                .image
                .clone()
                .unwrap_or_else(|| self.defaults.default_image.clone()),
            container_name: Self::container_name(ctx.gitspace_id),
            user,
            working_dir,
            env,
            labels,
            mounts,
            ports: vec![ctx.ide_port],
            network: template_arg("network"),
            cpus: template_arg("cpus").or_else(|| ctx.template.cpus.clone()),
            memory: template_arg("memory").or_else(|| ctx.template.memory.clone()),
            shm_size: template_arg("shm_size"),
            command: vec!["sleep".to_string(), "infinity".to_string()],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InfraProviderType;

    fn template() -> ResourceTemplate {
        ResourceTemplate {
            identifier: "standard".to_string(),
            provider: InfraProviderType::Docker,
            image: None,
            cpus: Some("2".to_string()),
            memory: Some("4g".to_string()),
            run_args: BTreeMap::new(),
        }
    }

    fn resource() -> ProvisionedResource {
        ProvisionedResource {
            config_id: "c1".to_string(),
            template_id: "standard".to_string(),
            provider_type: InfraProviderType::Docker,
            handle: "gitspace-c1-home".to_string(),
            host: "localhost".to_string(),
            data: serde_json::json!({ "volume": "gitspace-c1-home" }),
        }
    }

    #[test]
    fn test_resolve_merges_static_and_dynamic_sources() {
        let mut defaults = RunArgDefaults::default();
        defaults.env.insert("TZ".to_string(), "UTC".to_string());
        let resolver = RunArgResolver::new(defaults);
        let template = template();
        let resource = resource();

        let args = resolver
            .resolve(&RunArgContext {
                gitspace_id: "c1",
                repo_name: "hello-world",
                template: &template,
                resource: &resource,
                ide_port: 8089,
            })
            .unwrap();

        assert_eq!(args.container_name, "gitspace-c1");
        assert_eq!(args.image, "mcr.microsoft.com/devcontainers/base:ubuntu");
        assert_eq!(args.working_dir, "/home/vscode/hello-world");
        assert_eq!(args.env.get("TZ").map(String::as_str), Some("UTC"));
        assert_eq!(args.env.get("GITSPACE_ID").map(String::as_str), Some("c1"));
        assert_eq!(args.labels.get("gitspace.id").map(String::as_str), Some("c1"));
        assert_eq!(args.ports, vec![8089]);
        assert_eq!(args.cpus.as_deref(), Some("2"));
        assert_eq!(
            args.mounts,
            vec![Mount {
                source: "gitspace-c1-home".to_string(),
                target: "/home/vscode".to_string(),
                read_only: false,
            }]
        );
    }

    #[test]
    fn test_template_run_args_override_defaults() {
        let resolver = RunArgResolver::default();
        let mut template = template();
        template.image = Some("rust:1.80".to_string());
        template
            .run_args
            .insert("user".to_string(), "dev".to_string());
        template
            .run_args
            .insert("memory".to_string(), "8g".to_string());
        let resource = resource();

        let args = resolver
            .resolve(&RunArgContext {
                gitspace_id: "c1",
                repo_name: "app",
                template: &template,
                resource: &resource,
                ide_port: 22,
            })
            .unwrap();

        assert_eq!(args.image, "rust:1.80");
        assert_eq!(args.user, "dev");
        assert_eq!(args.memory.as_deref(), Some("8g"));
        assert_eq!(args.mounts[0].target, "/home/dev");
    }

    #[test]
    fn test_unknown_run_arg_is_rejected() {
        let resolver = RunArgResolver::default();
        let mut template = template();
        template
            .run_args
            .insert("privileged".to_string(), "true".to_string());
        let resource = resource();

        let err = resolver
            .resolve(&RunArgContext {
                gitspace_id: "c1",
                repo_name: "app",
                template: &template,
                resource: &resource,
                ide_port: 22,
            })
            .unwrap_err();

        assert!(matches!(err, GitspaceError::Validation(_)));
        assert!(err.to_string().contains("privileged"));
    }
}
