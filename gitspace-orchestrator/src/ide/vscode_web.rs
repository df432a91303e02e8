use gitspace_core::{GitspaceError, Result};
use gitspace_provider::ContainerHandle;
use url::Url;

use super::{published_port, ConnectionInfo, IdeAdapter, IdeContext, ACCESS_TOKEN_ENV};

/// Browser VS Code served by openvscode-server inside the container.
#[derive(Debug, Clone)]
pub struct VsCodeWebAdapter {
    port: u16,
}

impl VsCodeWebAdapter {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl IdeAdapter for VsCodeWebAdapter {
    fn container_port(&self) -> u16 {
        self.port
    }

    fn configure(&self, handle: &ContainerHandle, ctx: &IdeContext<'_>) -> Result<ConnectionInfo> {
        let port = published_port(handle, self.port)?;

        let mut uri = Url::parse(&format!("http://{}:{}/", handle.host, port))
            .map_err(|e| GitspaceError::RuntimeFault(format!("Invalid IDE address: {}", e)))?;
        uri.query_pairs_mut()
            .append_pair("folder", ctx.workspace_dir)
            .append_pair("tkn", ctx.access_token);

        let bootstrap_command = format!(
            "pgrep -f openvscode-server >/dev/null || nohup openvscode-server \
             --host 0.0.0.0 --port {} --connection-token \"${}\" \
             --default-folder '{}' >/tmp/openvscode-server.log 2>&1 &",
            self.port, ACCESS_TOKEN_ENV, ctx.workspace_dir
        );

        Ok(ConnectionInfo {
            uri: uri.to_string(),
            port,
            bootstrap_command,
        })
    }
}
