//! IDE adapters turn a running container into a connection endpoint.
//!
//! Adapters are pure: they compute a URI and a bootstrap command from the
//! container handle. The orchestrator runs the bootstrap command inside the
//! container afterwards.

mod jetbrains;
mod vscode;
mod vscode_web;

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use gitspace_core::{GitspaceError, Result};
use gitspace_provider::ContainerHandle;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub use jetbrains::JetBrainsAdapter;
pub use vscode::VsCodeAdapter;
pub use vscode_web::VsCodeWebAdapter;

/// Environment variable carrying the instance access token into bootstrap
/// commands, so the token never appears in persisted command text.
pub const ACCESS_TOKEN_ENV: &str = "GITSPACE_ACCESS_TOKEN";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum IdeType {
    VsCode,
    VsCodeWeb,
    Intellij,
    Pycharm,
    Goland,
    Webstorm,
    Clion,
    Rider,
    Phpstorm,
    Rubymine,
}

impl IdeType {
    pub const ALL: [IdeType; 10] = [
        IdeType::VsCode,
        IdeType::VsCodeWeb,
        IdeType::Intellij,
        IdeType::Pycharm,
        IdeType::Goland,
        IdeType::Webstorm,
        IdeType::Clion,
        IdeType::Rider,
        IdeType::Phpstorm,
        IdeType::Rubymine,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IdeType::VsCode => "vs_code",
            IdeType::VsCodeWeb => "vs_code_web",
            IdeType::Intellij => "intellij",
            IdeType::Pycharm => "pycharm",
            IdeType::Goland => "goland",
            IdeType::Webstorm => "webstorm",
            IdeType::Clion => "clion",
            IdeType::Rider => "rider",
            IdeType::Phpstorm => "phpstorm",
            IdeType::Rubymine => "rubymine",
        }
    }

    pub fn is_jetbrains(&self) -> bool {
        !matches!(self, IdeType::VsCode | IdeType::VsCodeWeb)
    }
}

impl Display for IdeType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdeType {
    type Err = GitspaceError;

    fn from_str(s: &str) -> Result<Self> {
        IdeType::ALL
            .into_iter()
            .find(|ide| ide.as_str() == s)
            .ok_or_else(|| GitspaceError::UnsupportedIde(s.to_string()))
    }
}

/// What a client needs to reach the IDE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ConnectionInfo {
    pub uri: String,
    /// Host-side port the IDE is reachable on.
    pub port: u16,
    /// Shell command that brings the IDE server up inside the container.
    pub bootstrap_command: String,
}

/// Per-instance inputs to [`IdeAdapter::configure`].
#[derive(Debug, Clone)]
pub struct IdeContext<'a> {
    pub ide: IdeType,
    pub user: &'a str,
    pub workspace_dir: &'a str,
    pub access_token: &'a str,
}

pub trait IdeAdapter: Send + Sync {
    /// Port the IDE server listens on inside the container.
    fn container_port(&self) -> u16;

    fn configure(&self, handle: &ContainerHandle, ctx: &IdeContext<'_>) -> Result<ConnectionInfo>;
}

pub(crate) fn published_port(handle: &ContainerHandle, container_port: u16) -> Result<u16> {
    handle.host_port(container_port).ok_or_else(|| {
        GitspaceError::RuntimeFault(format!(
            "Port {} of {} is not published",
            container_port, handle.container_name
        ))
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdeAdapterSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub port: u16,
}

fn default_enabled() -> bool {
    true
}

/// Which adapters exist and where their servers listen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdeSettings {
    #[serde(default = "default_vs_code")]
    pub vs_code: IdeAdapterSettings,
    #[serde(default = "default_vs_code_web")]
    pub vs_code_web: IdeAdapterSettings,
    #[serde(default = "default_jetbrains")]
    pub jetbrains: IdeAdapterSettings,
}

fn default_vs_code() -> IdeAdapterSettings {
    IdeAdapterSettings {
        enabled: true,
        port: 22,
    }
}

fn default_vs_code_web() -> IdeAdapterSettings {
    IdeAdapterSettings {
        enabled: true,
        port: 8089,
    }
}

fn default_jetbrains() -> IdeAdapterSettings {
    IdeAdapterSettings {
        enabled: true,
        port: 22,
    }
}

impl Default for IdeSettings {
    fn default() -> Self {
        Self {
            vs_code: default_vs_code(),
            vs_code_web: default_vs_code_web(),
            jetbrains: default_jetbrains(),
        }
    }
}

/// Mapping from IDE type to adapter, fixed at startup.
#[derive(Clone, Default)]
pub struct IdeRegistry {
    adapters: HashMap<IdeType, Arc<dyn IdeAdapter>>,
}

impl IdeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &IdeSettings) -> Self {
        let mut registry = Self::new();
        if settings.vs_code.enabled {
            registry = registry.register(
                IdeType::VsCode,
                Arc::new(VsCodeAdapter::new(settings.vs_code.port)),
            );
        }
        if settings.vs_code_web.enabled {
            registry = registry.register(
                IdeType::VsCodeWeb,
                Arc::new(VsCodeWebAdapter::new(settings.vs_code_web.port)),
            );
        }
        if settings.jetbrains.enabled {
            let adapter: Arc<dyn IdeAdapter> =
                Arc::new(JetBrainsAdapter::new(settings.jetbrains.port));
            for ide in IdeType::ALL.into_iter().filter(IdeType::is_jetbrains) {
                registry = registry.register(ide, adapter.clone());
            }
        }
        registry
    }

    pub fn register(mut self, ide: IdeType, adapter: Arc<dyn IdeAdapter>) -> Self {
        self.adapters.insert(ide, adapter);
        self
    }

    pub fn get(&self, ide: IdeType) -> Result<Arc<dyn IdeAdapter>> {
        self.adapters
            .get(&ide)
            .cloned()
            .ok_or_else(|| GitspaceError::UnsupportedIde(format!("{} is not enabled", ide)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ide_type_parsing() {
        assert_eq!("vs_code_web".parse::<IdeType>().unwrap(), IdeType::VsCodeWeb);
        assert_eq!("goland".parse::<IdeType>().unwrap(), IdeType::Goland);
        assert!(matches!(
            "emacs".parse::<IdeType>(),
            Err(GitspaceError::UnsupportedIde(_))
        ));
    }

    #[test]
    fn test_registry_from_settings() {
        let mut settings = IdeSettings::default();
        settings.jetbrains.enabled = false;
        let registry = IdeRegistry::from_settings(&settings);

        assert_eq!(registry.get(IdeType::VsCodeWeb).unwrap().container_port(), 8089);
        assert!(registry.get(IdeType::VsCode).is_ok());

        let err = registry.get(IdeType::Pycharm).err().unwrap();
        assert!(matches!(err, GitspaceError::UnsupportedIde(_)));
        assert_eq!(err.kind(), gitspace_core::ErrorKind::Validation);
    }

    #[test]
    fn test_jetbrains_family_shares_adapter() {
        let registry = IdeRegistry::from_settings(&IdeSettings::default());
        for ide in [IdeType::Intellij, IdeType::Rider, IdeType::Rubymine] {
            assert_eq!(registry.get(ide).unwrap().container_port(), 22);
        }
    }
}
