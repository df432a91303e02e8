use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gitspace_core::ErrorKind;
use gitspace_orchestrator::OrchestratorError;
use serde_json::json;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::Validation => ApiError::BadRequest(message),
            ErrorKind::NotFound => ApiError::NotFound(message),
            ErrorKind::Conflict => ApiError::Conflict(message),
            ErrorKind::ResourceUnavailable => ApiError::Unavailable(message),
            _ => ApiError::Internal(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gitspace_core::GitspaceError;

    #[test]
    fn test_status_follows_error_kind() {
        let cases = [
            (
                OrchestratorError::InvalidInput("bad".into()),
                StatusCode::BAD_REQUEST,
            ),
            (
                GitspaceError::UnsupportedIde("emacs".into()).into(),
                StatusCode::BAD_REQUEST,
            ),
            (
                OrchestratorError::NotFound("g1".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                OrchestratorError::InvalidState("stopping".into()),
                StatusCode::CONFLICT,
            ),
            (
                GitspaceError::ResourceUnavailable("no capacity".into()).into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GitspaceError::RuntimeFault("crashed".into()).into(),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }
}
