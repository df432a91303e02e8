use gitspace_core::{GitspaceError, Result};
use gitspace_provider::ContainerHandle;
use url::Url;

use super::vscode::sshd_bootstrap;
use super::{published_port, ConnectionInfo, IdeAdapter, IdeContext, IdeType};

/// JetBrains IDEs reached through Gateway over SSH. One adapter serves the
/// whole family; the product code comes from the IDE type.
#[derive(Debug, Clone)]
pub struct JetBrainsAdapter {
    port: u16,
}

impl JetBrainsAdapter {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    fn product_code(ide: IdeType) -> Result<&'static str> {
        match ide {
            IdeType::Intellij => Ok("IU"),
            IdeType::Pycharm => Ok("PY"),
            IdeType::Goland => Ok("GO"),
            IdeType::Webstorm => Ok("WS"),
            IdeType::Clion => Ok("CL"),
            IdeType::Rider => Ok("RD"),
            IdeType::Phpstorm => Ok("PS"),
            IdeType::Rubymine => Ok("RM"),
            other => Err(GitspaceError::UnsupportedIde(format!(
                "{} is not a JetBrains IDE",
                other
            ))),
        }
    }
}

impl IdeAdapter for JetBrainsAdapter {
    fn container_port(&self) -> u16 {
        self.port
    }

    fn configure(&self, handle: &ContainerHandle, ctx: &IdeContext<'_>) -> Result<ConnectionInfo> {
        let product = Self::product_code(ctx.ide)?;
        let port = published_port(handle, self.port)?;

        let mut uri = Url::parse("jetbrains-gateway://connect")
            .map_err(|e| GitspaceError::Internal(e.to_string()))?;
        let fragment = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("type", "ssh")
            .append_pair("deploy", "true")
            .append_pair("host", &handle.host)
            .append_pair("port", &port.to_string())
            .append_pair("user", ctx.user)
            .append_pair("projectPath", ctx.workspace_dir)
            .append_pair("productCode", product)
            .finish();
        uri.set_fragment(Some(&fragment));

        Ok(ConnectionInfo {
            uri: uri.to_string(),
            port,
            bootstrap_command: sshd_bootstrap(self.port),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle() -> ContainerHandle {
        let mut handle = ContainerHandle::for_name("i1", "gitspace-c1", "10.0.0.5");
        handle.ports.insert(22, 2222);
        handle
    }

    fn ctx(ide: IdeType) -> IdeContext<'static> {
        IdeContext {
            ide,
            user: "vscode",
            workspace_dir: "/home/vscode/demo",
            access_token: "t",
        }
    }

    #[test]
    fn test_gateway_uri() {
        let info = JetBrainsAdapter::new(22)
            .configure(&handle(), &ctx(IdeType::Goland))
            .unwrap();

        assert!(info.uri.starts_with("jetbrains-gateway://connect#"));
        assert!(info.uri.contains("host=10.0.0.5"));
        assert!(info.uri.contains("port=2222"));
        assert!(info.uri.contains("productCode=GO"));
        assert!(info.uri.contains("projectPath=%2Fhome%2Fvscode%2Fdemo"));
    }

    #[test]
    fn test_non_jetbrains_ide_rejected() {
        let err = JetBrainsAdapter::new(22)
            .configure(&handle(), &ctx(IdeType::VsCode))
            .unwrap_err();
        assert!(matches!(err, GitspaceError::UnsupportedIde(_)));
    }
}
