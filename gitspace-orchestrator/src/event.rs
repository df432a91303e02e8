use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use utoipa::ToSchema;

/// Topic a lifecycle event travels on. Each has its own consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum EventCategory {
    Action,
    InfraProvisioning,
    Delete,
    Operations,
}

impl EventCategory {
    pub const ALL: [EventCategory; 4] = [
        EventCategory::Action,
        EventCategory::InfraProvisioning,
        EventCategory::Delete,
        EventCategory::Operations,
    ];
}

impl Display for EventCategory {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            EventCategory::Action => "action",
            EventCategory::InfraProvisioning => "infra_provisioning",
            EventCategory::Delete => "delete",
            EventCategory::Operations => "operations",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Start,
    Stop,
    Delete,
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Operation::Start => f.write_str("start"),
            Operation::Stop => f.write_str("stop"),
            Operation::Delete => f.write_str("delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Start,
    Stop,
    Delete,
    /// An asynchronous provider finished allocating. `handle` names the
    /// pending allocation the result answers.
    InfraProvisioned {
        handle: String,
        host: String,
        #[serde(default)]
        data: serde_json::Value,
    },
    InfraProvisionFailed {
        handle: String,
        error: String,
    },
    /// Result of a lifecycle operation, for downstream consumers.
    OperationCompleted {
        operation: Operation,
        succeeded: bool,
        #[serde(default)]
        detail: Option<String>,
    },
}

impl EventPayload {
    pub fn category(&self) -> EventCategory {
        match self {
            EventPayload::Start | EventPayload::Stop => EventCategory::Action,
            EventPayload::Delete => EventCategory::Delete,
            EventPayload::InfraProvisioned { .. } | EventPayload::InfraProvisionFailed { .. } => {
                EventCategory::InfraProvisioning
            }
            EventPayload::OperationCompleted { .. } => EventCategory::Operations,
        }
    }
}

/// Immutable envelope for everything that travels on the event bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub id: String,
    /// Config identifier of the gitspace.
    pub gitspace_id: String,
    pub instance_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub payload: EventPayload,
}

impl LifecycleEvent {
    pub fn new(gitspace_id: &str, instance_id: Option<&str>, payload: EventPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            gitspace_id: gitspace_id.to_string(),
            instance_id: instance_id.map(str::to_string),
            enqueued_at: Utc::now(),
            payload,
        }
    }

    pub fn category(&self) -> EventCategory {
        self.payload.category()
    }
}

/// Milestones appended to a gitspace's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum HistoryKind {
    ConfigCreated,
    ConfigUpdated,
    StartRequested,
    InfraProvisioningPending,
    InfraProvisioned,
    InfraDeprovisioned,
    ContainerStarted,
    IdeConfigured,
    Running,
    StopRequested,
    Stopped,
    DeleteRequested,
    Deleted,
    Error,
    OperationCompleted,
    EventDropped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct HistoryRecord {
    pub id: i64,
    pub config_id: String,
    pub instance_id: Option<String>,
    pub kind: HistoryKind,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_wire_format() {
        let event = LifecycleEvent::new("c1", Some("i1"), EventPayload::Start);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["payload"]["type"], "start");

        let provisioned: EventPayload = serde_json::from_str(
            r#"{"type":"infra_provisioned","handle":"vm-1","host":"10.0.0.5"}"#,
        )
        .unwrap();
        assert_eq!(provisioned.category(), EventCategory::InfraProvisioning);
    }

    #[test]
    fn test_categories() {
        assert_eq!(EventPayload::Stop.category(), EventCategory::Action);
        assert_eq!(EventPayload::Delete.category(), EventCategory::Delete);
        assert_eq!(
            EventPayload::OperationCompleted {
                operation: Operation::Start,
                succeeded: true,
                detail: None
            }
            .category(),
            EventCategory::Operations
        );
    }
}
