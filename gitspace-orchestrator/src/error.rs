use gitspace_core::{ErrorKind, GitspaceError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Gitspace not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Gitspace(#[from] GitspaceError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Taxonomy class; callers decide on this alone.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestratorError::NotFound(_) => ErrorKind::NotFound,
            OrchestratorError::InvalidInput(_) => ErrorKind::Validation,
            OrchestratorError::InvalidState(_) | OrchestratorError::Conflict(_) => {
                ErrorKind::Conflict
            }
            OrchestratorError::Gitspace(e) => e.kind(),
            OrchestratorError::Database(_)
            | OrchestratorError::Migration(_)
            | OrchestratorError::Serialization(_)
            | OrchestratorError::Io(_) => ErrorKind::Internal,
        }
    }

    /// Flatten into the backend error type, for code paths shared with
    /// adapters (retry loops, deadlines).
    pub fn into_gitspace(self) -> GitspaceError {
        match self {
            OrchestratorError::Gitspace(e) => e,
            OrchestratorError::NotFound(s) => GitspaceError::NotFound(s),
            OrchestratorError::InvalidInput(s) => GitspaceError::Validation(s),
            OrchestratorError::InvalidState(s) | OrchestratorError::Conflict(s) => {
                GitspaceError::Conflict(s)
            }
            other => GitspaceError::Internal(other.to_string()),
        }
    }

    /// A unique index rejected the write; another writer got there first.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            OrchestratorError::Database(sqlx::Error::Database(db)) => db.is_unique_violation(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_passthrough() {
        let err: OrchestratorError = GitspaceError::ImagePullFailure("busybox".into()).into();
        assert_eq!(err.kind(), ErrorKind::ImagePullFailure);
        assert_eq!(
            OrchestratorError::InvalidState("stopping".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            OrchestratorError::Database(sqlx::Error::RowNotFound).kind(),
            ErrorKind::Internal
        );
    }
}
