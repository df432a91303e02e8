//! SQL for configs, instances, provisioned resources and history.
//!
//! Every function takes an executor so callers choose between the pool and
//! an open transaction. Instance updates are guarded: they name the states
//! the row must currently be in, and report whether the row matched.

use chrono::{DateTime, Utc};
use gitspace_core::ErrorKind;
use gitspace_provider::InfraProviderType;
use sqlx::{QueryBuilder, Sqlite, SqliteExecutor};

use crate::config::{ConfigFilters, GitspaceConfig};
use crate::error::Result;
use crate::event::{HistoryKind, HistoryRecord};
use crate::ide::IdeType;
use crate::infra::{InfraProvisionedResource, ProvisioningStatus};
use crate::instance::{GitspaceInstance, InstanceState, LifecycleStage};
use crate::scm::CodeRepoType;

fn timestamp(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Configs

pub async fn insert_config<'e, E: SqliteExecutor<'e>>(ex: E, config: &GitspaceConfig) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO gitspace_configs (identifier, owner, repo_ref, repo_type, branch, ide, infra_resource_ref, secret_ref, created_at, updated_at, is_deleted)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
        "#,
    )
    .bind(&config.identifier)
    .bind(&config.owner)
    .bind(&config.repo_ref)
    .bind(config.repo_type)
    .bind(&config.branch)
    .bind(config.ide)
    .bind(&config.infra_resource_ref)
    .bind(&config.secret_ref)
    .bind(config.created_at.timestamp())
    .bind(config.updated_at.timestamp())
    .execute(ex)
    .await?;

    Ok(())
}

/// Fetch a config, soft-deleted ones included.
pub async fn fetch_config<'e, E: SqliteExecutor<'e>>(ex: E, id: &str) -> Result<Option<GitspaceConfig>> {
    let row = sqlx::query_as::<_, ConfigRow>("SELECT * FROM gitspace_configs WHERE identifier = ?")
        .bind(id)
        .fetch_optional(ex)
        .await?;

    Ok(row.map(Into::into))
}

pub async fn list_configs<'e, E: SqliteExecutor<'e>>(
    ex: E,
    filters: &ConfigFilters,
) -> Result<Vec<GitspaceConfig>> {
    let mut query = "SELECT * FROM gitspace_configs WHERE is_deleted = 0".to_string();
    if filters.owner.is_some() {
        query.push_str(" AND owner = ?");
    }
    query.push_str(" ORDER BY created_at DESC, identifier");

    let mut q = sqlx::query_as::<_, ConfigRow>(&query);
    if let Some(owner) = &filters.owner {
        q = q.bind(owner);
    }

    let rows = q.fetch_all(ex).await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn update_config<'e, E: SqliteExecutor<'e>>(ex: E, config: &GitspaceConfig) -> Result<()> {
    sqlx::query(
        "UPDATE gitspace_configs
         SET ide = ?, branch = ?, infra_resource_ref = ?, secret_ref = ?, updated_at = ?
         WHERE identifier = ? AND is_deleted = 0",
    )
    .bind(config.ide)
    .bind(&config.branch)
    .bind(&config.infra_resource_ref)
    .bind(&config.secret_ref)
    .bind(config.updated_at.timestamp())
    .bind(&config.identifier)
    .execute(ex)
    .await?;

    Ok(())
}

pub async fn soft_delete_config<'e, E: SqliteExecutor<'e>>(ex: E, id: &str) -> Result<()> {
    sqlx::query("UPDATE gitspace_configs SET is_deleted = 1, updated_at = ? WHERE identifier = ?")
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(ex)
        .await?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Instances

pub async fn insert_instance<'e, E: SqliteExecutor<'e>>(
    ex: E,
    identifier: &str,
    config_id: &str,
    state: InstanceState,
    pending_event_id: Option<&str>,
) -> Result<()> {
    let now = Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO gitspace_instances (identifier, config_id, state, pending_event_id, created_at, updated_at, last_transition_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(identifier)
    .bind(config_id)
    .bind(state)
    .bind(pending_event_id)
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(ex)
    .await?;

    Ok(())
}

pub async fn fetch_instance<'e, E: SqliteExecutor<'e>>(ex: E, id: &str) -> Result<Option<GitspaceInstance>> {
    let row = sqlx::query_as::<_, InstanceRow>("SELECT * FROM gitspace_instances WHERE identifier = ?")
        .bind(id)
        .fetch_optional(ex)
        .await?;

    Ok(row.map(Into::into))
}

/// Most recent instance of a config.
pub async fn latest_instance<'e, E: SqliteExecutor<'e>>(
    ex: E,
    config_id: &str,
) -> Result<Option<GitspaceInstance>> {
    let row = sqlx::query_as::<_, InstanceRow>(
        "SELECT * FROM gitspace_instances WHERE config_id = ? ORDER BY seq DESC LIMIT 1",
    )
    .bind(config_id)
    .fetch_optional(ex)
    .await?;

    Ok(row.map(Into::into))
}

pub async fn count_active_instances<'e, E: SqliteExecutor<'e>>(ex: E, config_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM gitspace_instances WHERE config_id = ? AND state NOT IN ('stopped', 'deleted')",
    )
    .bind(config_id)
    .fetch_one(ex)
    .await?;

    Ok(count)
}

/// Active instances across every live config of `owner`, other than
/// `except_config`.
pub async fn count_active_for_owner<'e, E: SqliteExecutor<'e>>(
    ex: E,
    owner: &str,
    except_config: &str,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        r#"
        SELECT COUNT(*) FROM gitspace_instances i
        JOIN gitspace_configs c ON c.identifier = i.config_id
        WHERE c.owner = ? AND c.is_deleted = 0 AND c.identifier != ?
          AND i.state NOT IN ('stopped', 'deleted', 'error')
        "#,
    )
    .bind(owner)
    .bind(except_config)
    .fetch_one(ex)
    .await?;

    Ok(count)
}

/// A column assignment for [`update_instance`].
#[derive(Debug, Clone)]
pub enum InstanceField {
    Stage(Option<LifecycleStage>),
    FailedStage(Option<LifecycleStage>),
    /// Kind and message of the last failure; `None` clears both.
    Error(Option<(ErrorKind, String)>),
    Container {
        id: String,
        name: String,
        host: String,
    },
    Connection {
        port: u16,
        uri: String,
        bootstrap_command: String,
    },
    AccessToken(String),
    PendingEvent(Option<String>),
    StartedNow,
    StoppedNow,
}

/// Apply `fields` (and the move to `to`, if any) iff the instance is
/// currently in one of `guard`. Returns whether the row was updated.
pub async fn update_instance<'e, E: SqliteExecutor<'e>>(
    ex: E,
    id: &str,
    guard: &[InstanceState],
    to: Option<InstanceState>,
    fields: &[InstanceField],
) -> Result<bool> {
    let now = Utc::now().timestamp();
    let mut qb = QueryBuilder::<Sqlite>::new("UPDATE gitspace_instances SET updated_at = ");
    qb.push_bind(now);

    if let Some(to) = to {
        qb.push(", state = ").push_bind(to);
        qb.push(", last_transition_at = ").push_bind(now);
    }

    for field in fields {
        match field {
            InstanceField::Stage(stage) => {
                qb.push(", stage = ").push_bind(*stage);
            }
            InstanceField::FailedStage(stage) => {
                qb.push(", failed_stage = ").push_bind(*stage);
            }
            InstanceField::Error(error) => {
                let (kind, message) = match error {
                    Some((kind, message)) => (Some(kind.to_string()), Some(message.clone())),
                    None => (None, None),
                };
                qb.push(", error_kind = ").push_bind(kind);
                qb.push(", error_message = ").push_bind(message);
            }
            InstanceField::Container { id, name, host } => {
                qb.push(", container_id = ").push_bind(id.clone());
                qb.push(", container_name = ").push_bind(name.clone());
                qb.push(", host = ").push_bind(host.clone());
            }
            InstanceField::Connection {
                port,
                uri,
                bootstrap_command,
            } => {
                qb.push(", port = ").push_bind(i64::from(*port));
                qb.push(", connection_uri = ").push_bind(uri.clone());
                qb.push(", bootstrap_command = ").push_bind(bootstrap_command.clone());
            }
            InstanceField::AccessToken(token) => {
                qb.push(", access_token = ").push_bind(token.clone());
            }
            InstanceField::PendingEvent(event_id) => {
                qb.push(", pending_event_id = ").push_bind(event_id.clone());
            }
            InstanceField::StartedNow => {
                qb.push(", started_at = ").push_bind(now);
            }
            InstanceField::StoppedNow => {
                qb.push(", stopped_at = ").push_bind(now);
            }
        }
    }

    qb.push(" WHERE identifier = ").push_bind(id.to_string());
    if !guard.is_empty() {
        qb.push(" AND state IN (");
        let mut states = qb.separated(", ");
        for state in guard {
            states.push_bind(*state);
        }
        states.push_unseparated(")");
    }

    let result = qb.build().execute(ex).await?;
    Ok(result.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Provisioned resources

pub async fn fetch_infra<'e, E: SqliteExecutor<'e>>(
    ex: E,
    config_id: &str,
) -> Result<Option<InfraProvisionedResource>> {
    let row = sqlx::query_as::<_, InfraRow>(
        "SELECT * FROM infra_provisioned_resources WHERE config_id = ?",
    )
    .bind(config_id)
    .fetch_optional(ex)
    .await?;

    Ok(row.map(Into::into))
}

pub async fn upsert_infra<'e, E: SqliteExecutor<'e>>(
    ex: E,
    record: &InfraProvisionedResource,
) -> Result<()> {
    let data = match &record.data {
        serde_json::Value::Null => None,
        value => Some(serde_json::to_string(value)?),
    };

    sqlx::query(
        r#"
        INSERT INTO infra_provisioned_resources (config_id, template_id, provider_type, resource_handle, host, data, status, error_message, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(config_id) DO UPDATE SET
            template_id = excluded.template_id,
            provider_type = excluded.provider_type,
            resource_handle = excluded.resource_handle,
            host = excluded.host,
            data = excluded.data,
            status = excluded.status,
            error_message = excluded.error_message,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(&record.config_id)
    .bind(&record.template_id)
    .bind(record.provider_type.to_string())
    .bind(&record.resource_handle)
    .bind(&record.host)
    .bind(data)
    .bind(record.status)
    .bind(&record.error_message)
    .bind(record.created_at.timestamp())
    .bind(record.updated_at.timestamp())
    .execute(ex)
    .await?;

    Ok(())
}

pub async fn delete_infra<'e, E: SqliteExecutor<'e>>(ex: E, config_id: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM infra_provisioned_resources WHERE config_id = ?")
        .bind(config_id)
        .execute(ex)
        .await?;

    Ok(result.rows_affected() > 0)
}

// ---------------------------------------------------------------------------
// History

pub async fn append_history<'e, E: SqliteExecutor<'e>>(
    ex: E,
    config_id: &str,
    instance_id: Option<&str>,
    kind: HistoryKind,
    detail: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO gitspace_events (config_id, instance_id, kind, detail, created_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(config_id)
    .bind(instance_id)
    .bind(kind)
    .bind(detail)
    .bind(Utc::now().timestamp())
    .execute(ex)
    .await?;

    Ok(())
}

/// Like [`append_history`], for a row recording the bus event `event_id`.
/// Returns false when that event was already recorded.
pub async fn append_event_history<'e, E: SqliteExecutor<'e>>(
    ex: E,
    event_id: &str,
    config_id: &str,
    instance_id: Option<&str>,
    kind: HistoryKind,
    detail: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO gitspace_events (event_id, config_id, instance_id, kind, detail, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(event_id)
    .bind(config_id)
    .bind(instance_id)
    .bind(kind)
    .bind(detail)
    .bind(Utc::now().timestamp())
    .execute(ex)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn list_history<'e, E: SqliteExecutor<'e>>(ex: E, config_id: &str) -> Result<Vec<HistoryRecord>> {
    let rows = sqlx::query_as::<_, HistoryRow>(
        "SELECT * FROM gitspace_events WHERE config_id = ? ORDER BY id",
    )
    .bind(config_id)
    .fetch_all(ex)
    .await?;

    Ok(rows.into_iter().map(Into::into).collect())
}

// Internal row types for sqlx
#[derive(sqlx::FromRow)]
struct ConfigRow {
    identifier: String,
    owner: String,
    repo_ref: String,
    repo_type: CodeRepoType,
    branch: Option<String>,
    ide: IdeType,
    infra_resource_ref: String,
    secret_ref: Option<String>,
    created_at: i64,
    updated_at: i64,
    is_deleted: bool,
}

#[derive(sqlx::FromRow)]
struct InstanceRow {
    #[allow(dead_code)]
    seq: i64,
    identifier: String,
    config_id: String,
    state: InstanceState,
    stage: Option<LifecycleStage>,
    failed_stage: Option<LifecycleStage>,
    error_kind: Option<String>,
    container_id: Option<String>,
    container_name: Option<String>,
    host: Option<String>,
    port: Option<i64>,
    access_token: Option<String>,
    connection_uri: Option<String>,
    bootstrap_command: Option<String>,
    error_message: Option<String>,
    pending_event_id: Option<String>,
    created_at: i64,
    updated_at: i64,
    last_transition_at: i64,
    started_at: Option<i64>,
    stopped_at: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct InfraRow {
    config_id: String,
    template_id: String,
    provider_type: String,
    resource_handle: Option<String>,
    host: Option<String>,
    data: Option<String>,
    status: ProvisioningStatus,
    error_message: Option<String>,
    created_at: i64,
    updated_at: i64,
}

#[derive(sqlx::FromRow)]
struct HistoryRow {
    id: i64,
    config_id: String,
    instance_id: Option<String>,
    kind: HistoryKind,
    detail: Option<String>,
    created_at: i64,
}

impl From<ConfigRow> for GitspaceConfig {
    fn from(row: ConfigRow) -> Self {
        Self {
            identifier: row.identifier,
            owner: row.owner,
            repo_ref: row.repo_ref,
            repo_type: row.repo_type,
            branch: row.branch,
            ide: row.ide,
            infra_resource_ref: row.infra_resource_ref,
            secret_ref: row.secret_ref,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
            is_deleted: row.is_deleted,
        }
    }
}

impl From<InstanceRow> for GitspaceInstance {
    fn from(row: InstanceRow) -> Self {
        Self {
            identifier: row.identifier,
            config_id: row.config_id,
            state: row.state,
            stage: row.stage,
            failed_stage: row.failed_stage,
            error_kind: row.error_kind.and_then(|k| k.parse().ok()),
            container_id: row.container_id,
            container_name: row.container_name,
            host: row.host,
            port: row.port.and_then(|p| u16::try_from(p).ok()),
            access_token: row.access_token,
            connection_uri: row.connection_uri,
            bootstrap_command: row.bootstrap_command,
            error_message: row.error_message,
            pending_event_id: row.pending_event_id,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
            last_transition_at: timestamp(row.last_transition_at),
            started_at: row.started_at.map(timestamp),
            stopped_at: row.stopped_at.map(timestamp),
        }
    }
}

impl From<InfraRow> for InfraProvisionedResource {
    fn from(row: InfraRow) -> Self {
        Self {
            config_id: row.config_id,
            template_id: row.template_id,
            provider_type: row
                .provider_type
                .parse()
                .unwrap_or(InfraProviderType::Docker),
            resource_handle: row.resource_handle,
            host: row.host,
            data: row
                .data
                .and_then(|s| serde_json::from_str(&s).ok())
                .unwrap_or(serde_json::Value::Null),
            status: row.status,
            error_message: row.error_message,
            created_at: timestamp(row.created_at),
            updated_at: timestamp(row.updated_at),
        }
    }
}

impl From<HistoryRow> for HistoryRecord {
    fn from(row: HistoryRow) -> Self {
        Self {
            id: row.id,
            config_id: row.config_id,
            instance_id: row.instance_id,
            kind: row.kind,
            detail: row.detail,
            created_at: timestamp(row.created_at),
        }
    }
}
