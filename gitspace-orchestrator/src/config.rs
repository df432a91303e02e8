use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{OrchestratorError, Result};
use crate::ide::IdeType;
use crate::scm::CodeRepoType;

/// Desired state of one gitspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct GitspaceConfig {
    pub identifier: String,
    pub owner: String,
    /// Repository path (internal) or URL (generic).
    pub repo_ref: String,
    pub repo_type: CodeRepoType,
    pub branch: Option<String>,
    pub ide: IdeType,
    /// Identifier of the resource template to provision.
    pub infra_resource_ref: String,
    #[serde(skip_serializing)]
    pub secret_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreateConfigRequest {
    /// Generated when omitted.
    pub identifier: Option<String>,
    pub owner: String,
    pub repo_ref: String,
    pub repo_type: CodeRepoType,
    pub branch: Option<String>,
    /// IDE type name, e.g. `vs_code_web`.
    pub ide: String,
    pub infra_resource_ref: String,
    /// `scheme:value` reference resolved when the gitspace starts.
    pub secret_ref: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateConfigRequest {
    pub ide: Option<String>,
    pub branch: Option<String>,
    pub infra_resource_ref: Option<String>,
    pub secret_ref: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigFilters {
    pub owner: Option<String>,
}

/// Lowercase letters, digits and dashes, starting with a letter or digit.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    let valid = (1..=63).contains(&identifier.len())
        && identifier
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        && identifier
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidInput(format!(
            "Invalid gitspace identifier '{}': use 1-63 lowercase letters, digits or dashes",
            identifier
        )))
    }
}

pub fn generate_identifier() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("gs-{}", &id[..12])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_format() {
        assert!(validate_identifier("c1").is_ok());
        assert!(validate_identifier("my-gitspace-2").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("-leading").is_err());
        assert!(validate_identifier("Upper").is_err());
        assert!(validate_identifier("has space").is_err());
        assert!(validate_identifier(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_generated_identifier_is_valid() {
        let id = generate_identifier();
        assert!(validate_identifier(&id).is_ok());
        assert_eq!(id.len(), 15);
    }
}
