use gitspace_core::Result;
use gitspace_provider::ContainerHandle;

use super::{published_port, ConnectionInfo, IdeAdapter, IdeContext};

/// Desktop VS Code connecting through Remote-SSH.
#[derive(Debug, Clone)]
pub struct VsCodeAdapter {
    port: u16,
}

impl VsCodeAdapter {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

pub(crate) fn sshd_bootstrap(port: u16) -> String {
    format!(
        "pgrep -x sshd >/dev/null || sudo /usr/sbin/sshd -p {} || /usr/sbin/sshd -p {}",
        port, port
    )
}

impl IdeAdapter for VsCodeAdapter {
    fn container_port(&self) -> u16 {
        self.port
    }

    fn configure(&self, handle: &ContainerHandle, ctx: &IdeContext<'_>) -> Result<ConnectionInfo> {
        let port = published_port(handle, self.port)?;
        Ok(ConnectionInfo {
            uri: format!(
                "vscode-remote://ssh-remote+{}@{}:{}{}",
                ctx.user, handle.host, port, ctx.workspace_dir
            ),
            port,
            bootstrap_command: sshd_bootstrap(self.port),
        })
    }
}
