use crate::{error::ApiResult, state::AppState};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use gitspace_core::LogLine;
use gitspace_orchestrator::service::DEFAULT_LOG_LINES;
use gitspace_orchestrator::{
    ConfigFilters, CreateConfigRequest, GitspaceConfig, GitspaceStatus, HistoryRecord,
    UpdateConfigRequest,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Upper bound on `limit` for log requests.
const MAX_LOG_LINES: usize = 5_000;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/v1/gitspaces", get(list_configs).post(create_config))
        .route(
            "/api/v1/gitspaces/{id}",
            get(get_config)
                .patch(update_config)
                .delete(delete_gitspace),
        )
        .route("/api/v1/gitspaces/{id}/start", post(start_gitspace))
        .route("/api/v1/gitspaces/{id}/stop", post(stop_gitspace))
        .route("/api/v1/gitspaces/{id}/status", get(get_status))
        .route("/api/v1/gitspaces/{id}/events", get(list_events))
        .route("/api/v1/gitspaces/{id}/logs", get(get_logs))
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ListQuery {
    /// Only configs owned by this user.
    pub owner: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct LogsQuery {
    /// Number of most recent lines to return.
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogEntry {
    /// `stdout`, `stderr` or `system`.
    pub stream: String,
    pub line: String,
    pub created_at: DateTime<Utc>,
}

impl From<LogLine> for LogEntry {
    fn from(line: LogLine) -> Self {
        Self {
            stream: line.stream.to_string(),
            line: line.line,
            created_at: line.created_at,
        }
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/gitspaces",
    params(ListQuery),
    responses((status = 200, body = Vec<GitspaceConfig>)),
    tag = "gitspaces"
)]
pub async fn list_configs(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<GitspaceConfig>>> {
    let filters = ConfigFilters { owner: query.owner };
    let configs = state.service.list_configs(&filters).await?;
    Ok(Json(configs))
}

#[utoipa::path(
    post,
    path = "/api/v1/gitspaces",
    request_body = CreateConfigRequest,
    responses(
        (status = 201, body = GitspaceConfig),
        (status = 400, description = "Invalid config"),
        (status = 409, description = "Identifier already taken")
    ),
    tag = "gitspaces"
)]
pub async fn create_config(
    State(state): State<AppState>,
    Json(req): Json<CreateConfigRequest>,
) -> ApiResult<(StatusCode, Json<GitspaceConfig>)> {
    let config = state.service.create_config(req).await?;
    Ok((StatusCode::CREATED, Json(config)))
}

#[utoipa::path(
    get,
    path = "/api/v1/gitspaces/{id}",
    params(("id" = String, Path, description = "Gitspace identifier")),
    responses((status = 200, body = GitspaceConfig), (status = 404, description = "Unknown gitspace")),
    tag = "gitspaces"
)]
pub async fn get_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<GitspaceConfig>> {
    let config = state.service.get_config(&id).await?;
    Ok(Json(config))
}

#[utoipa::path(
    patch,
    path = "/api/v1/gitspaces/{id}",
    params(("id" = String, Path, description = "Gitspace identifier")),
    request_body = UpdateConfigRequest,
    responses(
        (status = 200, body = GitspaceConfig),
        (status = 409, description = "Gitspace is active")
    ),
    tag = "gitspaces"
)]
pub async fn update_config(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<UpdateConfigRequest>,
) -> ApiResult<Json<GitspaceConfig>> {
    let config = state.service.update_config(&id, req).await?;
    Ok(Json(config))
}

#[utoipa::path(
    delete,
    path = "/api/v1/gitspaces/{id}",
    params(("id" = String, Path, description = "Gitspace identifier")),
    responses((status = 202, body = GitspaceStatus), (status = 404, description = "Unknown gitspace")),
    tag = "gitspaces"
)]
pub async fn delete_gitspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<GitspaceStatus>)> {
    let status = state.service.request_delete(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

#[utoipa::path(
    post,
    path = "/api/v1/gitspaces/{id}/start",
    params(("id" = String, Path, description = "Gitspace identifier")),
    responses(
        (status = 202, body = GitspaceStatus),
        (status = 409, description = "Another operation is in progress")
    ),
    tag = "gitspaces"
)]
pub async fn start_gitspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<GitspaceStatus>)> {
    let status = state.service.request_start(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

#[utoipa::path(
    post,
    path = "/api/v1/gitspaces/{id}/stop",
    params(("id" = String, Path, description = "Gitspace identifier")),
    responses(
        (status = 202, body = GitspaceStatus),
        (status = 409, description = "Gitspace cannot be stopped now")
    ),
    tag = "gitspaces"
)]
pub async fn stop_gitspace(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<GitspaceStatus>)> {
    let status = state.service.request_stop(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

#[utoipa::path(
    get,
    path = "/api/v1/gitspaces/{id}/status",
    params(("id" = String, Path, description = "Gitspace identifier")),
    responses((status = 200, body = GitspaceStatus), (status = 404, description = "Unknown gitspace")),
    tag = "gitspaces"
)]
pub async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<GitspaceStatus>> {
    let status = state.service.get_status(&id).await?;
    Ok(Json(status))
}

#[utoipa::path(
    get,
    path = "/api/v1/gitspaces/{id}/events",
    params(("id" = String, Path, description = "Gitspace identifier")),
    responses((status = 200, body = Vec<HistoryRecord>), (status = 404, description = "Unknown gitspace")),
    tag = "gitspaces"
)]
pub async fn list_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<HistoryRecord>>> {
    let events = state.service.list_events(&id).await?;
    Ok(Json(events))
}

#[utoipa::path(
    get,
    path = "/api/v1/gitspaces/{id}/logs",
    params(("id" = String, Path, description = "Gitspace identifier"), LogsQuery),
    responses((status = 200, body = Vec<LogEntry>), (status = 404, description = "Unknown gitspace")),
    tag = "gitspaces"
)]
pub async fn get_logs(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOG_LINES)
        .clamp(1, MAX_LOG_LINES);
    let lines = state.service.get_logs(&id, limit).await?;
    Ok(Json(lines.into_iter().map(LogEntry::from).collect()))
}
