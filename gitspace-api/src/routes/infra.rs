use crate::{error::ApiResult, state::AppState};
use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use gitspace_orchestrator::InfraCallbackRequest;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub fn routes() -> Router<AppState> {
    Router::new().route("/api/v1/infra/callback", post(infra_callback))
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CallbackAccepted {
    /// Identifier of the event published on the infra-provisioning topic.
    pub event_id: String,
}

/// Entry point for external provisioners reporting an allocation result.
#[utoipa::path(
    post,
    path = "/api/v1/infra/callback",
    request_body = InfraCallbackRequest,
    responses(
        (status = 202, body = CallbackAccepted),
        (status = 400, description = "Neither error nor handle and host given"),
        (status = 404, description = "Unknown gitspace")
    ),
    tag = "infra"
)]
pub async fn infra_callback(
    State(state): State<AppState>,
    Json(req): Json<InfraCallbackRequest>,
) -> ApiResult<(StatusCode, Json<CallbackAccepted>)> {
    let event = state.service.infra_callback(req).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(CallbackAccepted { event_id: event.id }),
    ))
}
