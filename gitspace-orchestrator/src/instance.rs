use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use utoipa::ToSchema;

use gitspace_core::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum InstanceState {
    Uninitialized,
    Provisioning,
    Starting,
    Running,
    Stopping,
    Stopped,
    Deleting,
    Deleted,
    Error,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Uninitialized => "uninitialized",
            InstanceState::Provisioning => "provisioning",
            InstanceState::Starting => "starting",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Deleting => "deleting",
            InstanceState::Deleted => "deleted",
            InstanceState::Error => "error",
        }
    }

    /// An operation is in flight; a new request must not overtake it.
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            InstanceState::Provisioning
                | InstanceState::Starting
                | InstanceState::Stopping
                | InstanceState::Deleting
        )
    }

    /// Counts against the one-active-instance-per-config rule.
    pub fn is_active(&self) -> bool {
        !matches!(self, InstanceState::Stopped | InstanceState::Deleted)
    }
}

impl Display for InstanceState {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checkpointed steps of a start. Persisted so a retried start knows how far
/// the previous attempt got.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type, ToSchema,
)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum LifecycleStage {
    ResolveSource,
    ProvisionInfra,
    ResolveRunArgs,
    StartContainer,
    ConfigureIde,
    Finalize,
}

impl Display for LifecycleStage {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            LifecycleStage::ResolveSource => "resolve_source",
            LifecycleStage::ProvisionInfra => "provision_infra",
            LifecycleStage::ResolveRunArgs => "resolve_run_args",
            LifecycleStage::StartContainer => "start_container",
            LifecycleStage::ConfigureIde => "configure_ide",
            LifecycleStage::Finalize => "finalize",
        };
        f.write_str(name)
    }
}

/// Runtime record of one gitspace session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GitspaceInstance {
    pub identifier: String,
    pub config_id: String,
    pub state: InstanceState,
    /// Last stage the current start completed.
    pub stage: Option<LifecycleStage>,
    /// Stage the last failed start stopped at.
    pub failed_stage: Option<LifecycleStage>,
    #[schema(value_type = Option<String>)]
    pub error_kind: Option<ErrorKind>,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    #[serde(skip_serializing)]
    pub access_token: Option<String>,
    pub connection_uri: Option<String>,
    pub bootstrap_command: Option<String>,
    pub error_message: Option<String>,
    #[serde(skip)]
    pub pending_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Answer to `GetStatus`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GitspaceStatus {
    pub config_id: String,
    pub state: InstanceState,
    pub instance: Option<GitspaceInstance>,
}
