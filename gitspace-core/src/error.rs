use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

/// Failure classes every backend error is reduced to.
///
/// Callers above the adapters decide retry-vs-surface from the kind alone and
/// never inspect backend specific detail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Conflict,
    ResourceUnavailable,
    ImagePullFailure,
    RuntimeFault,
    Timeout,
    NotFound,
    Internal,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::ResourceUnavailable => "resource_unavailable",
            ErrorKind::ImagePullFailure => "image_pull_failure",
            ErrorKind::RuntimeFault => "runtime_fault",
            ErrorKind::Timeout => "timeout",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = GitspaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "validation" => Ok(ErrorKind::Validation),
            "conflict" => Ok(ErrorKind::Conflict),
            "resource_unavailable" => Ok(ErrorKind::ResourceUnavailable),
            "image_pull_failure" => Ok(ErrorKind::ImagePullFailure),
            "runtime_fault" => Ok(ErrorKind::RuntimeFault),
            "timeout" => Ok(ErrorKind::Timeout),
            "not_found" => Ok(ErrorKind::NotFound),
            "internal" => Ok(ErrorKind::Internal),
            other => Err(GitspaceError::Validation(format!("Unknown error kind: {}", other))),
        }
    }
}

#[derive(Error, Debug)]
pub enum GitspaceError {
    Validation(String),
    UnsupportedIde(String),
    Conflict(String),
    ResourceUnavailable(String),
    ImagePullFailure(String),
    StartTimeout(String),
    RuntimeFault(String),
    Timeout(String),
    NotFound(String),
    Network(String),
    Internal(String),
    Io(#[from] std::io::Error),
    Serialization(String),
    Other(#[from] anyhow::Error),
}

impl Display for GitspaceError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            GitspaceError::Validation(s) => write!(f, "Validation error: {}", s),
            GitspaceError::UnsupportedIde(s) => write!(f, "Unsupported IDE: {}", s),
            GitspaceError::Conflict(s) => write!(f, "Conflict: {}", s),
            GitspaceError::ResourceUnavailable(s) => write!(f, "Resource unavailable: {}", s),
            GitspaceError::ImagePullFailure(s) => write!(f, "Image pull failed: {}", s),
            GitspaceError::StartTimeout(s) => write!(f, "Container start timed out: {}", s),
            GitspaceError::RuntimeFault(s) => write!(f, "Runtime fault: {}", s),
            GitspaceError::Timeout(s) => write!(f, "Timed out: {}", s),
            GitspaceError::NotFound(s) => write!(f, "Not found: {}", s),
            GitspaceError::Network(s) => write!(f, "Network error: {}", s),
            GitspaceError::Internal(s) => write!(f, "Internal error: {}", s),
            GitspaceError::Io(e) => write!(f, "I/O error: {}", e),
            GitspaceError::Serialization(s) => write!(f, "Serialization error: {}", s),
            GitspaceError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl GitspaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GitspaceError::Validation(_)
            | GitspaceError::UnsupportedIde(_)
            | GitspaceError::Serialization(_) => ErrorKind::Validation,
            GitspaceError::Conflict(_) => ErrorKind::Conflict,
            GitspaceError::ResourceUnavailable(_) | GitspaceError::Network(_) => {
                ErrorKind::ResourceUnavailable
            }
            GitspaceError::ImagePullFailure(_) => ErrorKind::ImagePullFailure,
            GitspaceError::StartTimeout(_) | GitspaceError::Timeout(_) => ErrorKind::Timeout,
            GitspaceError::RuntimeFault(_) => ErrorKind::RuntimeFault,
            GitspaceError::NotFound(_) => ErrorKind::NotFound,
            GitspaceError::Internal(_) | GitspaceError::Io(_) | GitspaceError::Other(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Whether a stage may retry this failure with backoff before surfacing it.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GitspaceError::ResourceUnavailable(_)
                | GitspaceError::ImagePullFailure(_)
                | GitspaceError::Network(_)
        )
    }
}

impl From<serde_json::Error> for GitspaceError {
    fn from(err: serde_json::Error) -> Self {
        GitspaceError::Serialization(err.to_string())
    }
}

impl From<serde_yaml_ng::Error> for GitspaceError {
    fn from(err: serde_yaml_ng::Error) -> Self {
        GitspaceError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GitspaceError>;
