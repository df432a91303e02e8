use gitspace_core::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSettings {
    /// How long an operation waits for the per-gitspace lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Retries for transient failures inside a single stage.
    #[serde(default)]
    pub stage_retry: RetryPolicy,

    #[serde(default = "default_provision_deadline_secs")]
    pub provision_deadline_secs: u64,

    #[serde(default = "default_container_start_deadline_secs")]
    pub container_start_deadline_secs: u64,

    /// Cap on gitspaces one owner may have active at once. Unlimited when
    /// unset.
    #[serde(default)]
    pub max_active_per_owner: Option<u32>,
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

fn default_provision_deadline_secs() -> u64 {
    600
}

fn default_container_start_deadline_secs() -> u64 {
    300
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            stage_retry: RetryPolicy::default(),
            provision_deadline_secs: default_provision_deadline_secs(),
            container_start_deadline_secs: default_container_start_deadline_secs(),
            max_active_per_owner: None,
        }
    }
}

impl OrchestratorSettings {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn provision_deadline(&self) -> Duration {
        Duration::from_secs(self.provision_deadline_secs)
    }

    pub fn container_start_deadline(&self) -> Duration {
        Duration::from_secs(self.container_start_deadline_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventSettings {
    /// Idle wait between polls of an empty queue.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long a received event stays hidden before it is redelivered.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Deliveries after which an event is dropped.
    #[serde(default = "default_max_deliveries")]
    pub max_deliveries: u32,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_visibility_timeout_secs() -> u64 {
    900
}

fn default_max_deliveries() -> u32 {
    20
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_deliveries: default_max_deliveries(),
        }
    }
}

impl EventSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }
}
