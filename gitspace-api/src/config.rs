use anyhow::{Context, Result};
use gitspace_orchestrator::{EventSettings, IdeSettings, OrchestratorSettings};
use gitspace_provider::docker::DockerSettings;
use gitspace_provider::{InfraProviderType, ResourceTemplate, RunArgDefaults};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub orchestrator: OrchestratorSettings,

    #[serde(default)]
    pub events: EventSettings,

    #[serde(default)]
    pub docker: DockerSettings,

    /// Image, user and labels every container starts from.
    #[serde(default)]
    pub run_args: RunArgDefaults,

    #[serde(default = "default_infra_resources")]
    pub infra_resources: Vec<ResourceTemplate>,

    /// External provisioning service; the generic provider is only
    /// registered when this is set.
    #[serde(default)]
    pub generic_provider: Option<GenericProviderConfig>,

    #[serde(default)]
    pub scm: ScmConfig,

    #[serde(default)]
    pub ide: IdeSettings,

    /// Directory of the file-backed secret store.
    #[serde(default)]
    pub secrets_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GenericProviderConfig {
    pub endpoint: String,

    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScmConfig {
    #[serde(default = "default_internal_base_url")]
    pub internal_base_url: String,
}

impl Default for ScmConfig {
    fn default() -> Self {
        Self {
            internal_base_url: default_internal_base_url(),
        }
    }
}

fn default_bind_addr() -> String {
    std::env::var("GITSPACE_BIND").unwrap_or_else(|_| "0.0.0.0:3130".to_string())
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("GITSPACE_DB_PATH") {
        return PathBuf::from(path);
    }

    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata)
            .join("gitspace")
            .join("gitspace.db")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".gitspace").join("gitspace.db")
    }
}

fn default_infra_resources() -> Vec<ResourceTemplate> {
    vec![ResourceTemplate {
        identifier: "default".to_string(),
        provider: InfraProviderType::Docker,
        image: None,
        cpus: None,
        memory: None,
        run_args: BTreeMap::new(),
    }]
}

fn default_provider_timeout() -> u64 {
    30
}

fn default_internal_base_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            db_path: default_db_path(),
            orchestrator: OrchestratorSettings::default(),
            events: EventSettings::default(),
            docker: DockerSettings::default(),
            run_args: RunArgDefaults::default(),
            infra_resources: default_infra_resources(),
            generic_provider: None,
            scm: ScmConfig::default(),
            ide: IdeSettings::default(),
            secrets_dir: None,
        }
    }
}

impl Config {
    /// Defaults from the environment, overlaid by the YAML file named in
    /// `GITSPACE_CONFIG` when set.
    pub fn from_env() -> Result<Self> {
        match std::env::var("GITSPACE_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config = serde_yaml_ng::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for template in &self.infra_resources {
            if !seen.insert(template.identifier.as_str()) {
                anyhow::bail!("Duplicate infra resource '{}'", template.identifier);
            }
            if template.provider == InfraProviderType::Generic && self.generic_provider.is_none() {
                anyhow::bail!(
                    "Infra resource '{}' needs generic_provider to be configured",
                    template.identifier
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_yaml_overlay_keeps_defaults() {
        let config = Config::from_yaml(
            r#"
bind_addr: "127.0.0.1:9000"
orchestrator:
  lock_timeout_ms: 1000
  max_active_per_owner: 3
events:
  max_deliveries: 5
infra_resources:
  - identifier: small
    provider: docker
    cpus: "1"
    memory: 2g
ide:
  vs_code:
    enabled: false
    port: 22
"#,
        )
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(config.orchestrator.lock_timeout_ms, 1000);
        assert_eq!(config.orchestrator.provision_deadline_secs, 600);
        assert_eq!(config.orchestrator.max_active_per_owner, Some(3));
        assert_eq!(config.events.max_deliveries, 5);
        assert_eq!(config.infra_resources.len(), 1);
        assert_eq!(config.infra_resources[0].memory.as_deref(), Some("2g"));
        assert!(!config.ide.vs_code.enabled);
        assert!(config.ide.vs_code_web.enabled);
        assert_eq!(config.docker.binary, "docker");
        assert!(config.generic_provider.is_none());
    }

    #[test]
    fn test_generic_template_requires_endpoint() {
        let yaml = r#"
infra_resources:
  - identifier: remote
    provider: generic
"#;
        assert!(Config::from_yaml(yaml).is_err());

        let with_endpoint = format!(
            "{}generic_provider:\n  endpoint: http://provisioner.internal/\n",
            yaml
        );
        let config = Config::from_yaml(&with_endpoint).unwrap();
        assert_eq!(config.generic_provider.unwrap().timeout_secs, 30);
    }

    #[test]
    fn test_duplicate_templates_rejected() {
        let yaml = r#"
infra_resources:
  - identifier: small
    provider: docker
  - identifier: small
    provider: docker
"#;
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "secrets_dir: /run/gitspace/secrets").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(
            config.secrets_dir,
            Some(PathBuf::from("/run/gitspace/secrets"))
        );
        assert_eq!(config.infra_resources[0].identifier, "default");
    }
}
