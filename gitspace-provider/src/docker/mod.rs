//! Embedded Docker backends: the local daemon acts both as the infra host and
//! as the container runtime.

pub mod command;
pub mod container;
pub mod infra;

use serde::{Deserialize, Serialize};

pub use container::EmbeddedDockerOrchestrator;
pub use infra::DockerInfraProvider;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerSettings {
    /// CLI binary; any Docker-compatible CLI works.
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Host name handed to IDE clients.
    #[serde(default = "default_host")]
    pub host: String,

    /// Address published container ports bind to.
    #[serde(default = "default_publish_address")]
    pub publish_address: String,

    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_binary() -> String {
    "docker".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_publish_address() -> String {
    "127.0.0.1".to_string()
}

fn default_start_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            host: default_host(),
            publish_address: default_publish_address(),
            start_timeout_secs: default_start_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}
