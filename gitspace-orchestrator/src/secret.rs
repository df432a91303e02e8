//! Secret resolvers. A secret reference has the form `scheme:value`; the
//! scheme selects the resolver.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use gitspace_core::{GitspaceError, Result};

#[async_trait]
pub trait SecretResolver: Send + Sync {
    fn scheme(&self) -> &'static str;

    async fn resolve(&self, value: &str) -> Result<String>;
}

/// `password:<literal>`: the reference carries the password itself.
#[derive(Debug, Clone, Default)]
pub struct StaticPasswordResolver;

#[async_trait]
impl SecretResolver for StaticPasswordResolver {
    fn scheme(&self) -> &'static str {
        "password"
    }

    async fn resolve(&self, value: &str) -> Result<String> {
        if value.is_empty() {
            return Err(GitspaceError::Validation("Empty static password".to_string()));
        }
        Ok(value.to_string())
    }
}

/// `file:<name>`: contents of `{dir}/{name}`, trailing newline stripped.
#[derive(Debug, Clone)]
pub struct FileSecretResolver {
    dir: PathBuf,
}

impl FileSecretResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl SecretResolver for FileSecretResolver {
    fn scheme(&self) -> &'static str {
        "file"
    }

    async fn resolve(&self, value: &str) -> Result<String> {
        let valid = !value.is_empty()
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_.".contains(c))
            && !value.starts_with('.');
        if !valid {
            return Err(GitspaceError::Validation(format!(
                "Invalid secret name: {}",
                value
            )));
        }

        match tokio::fs::read_to_string(self.dir.join(value)).await {
            Ok(contents) => Ok(contents.trim_end_matches(['\n', '\r']).to_string()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(GitspaceError::NotFound(format!("secret {}", value)))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Clone, Default)]
pub struct SecretRegistry {
    resolvers: HashMap<&'static str, Arc<dyn SecretResolver>>,
}

impl SecretRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, resolver: Arc<dyn SecretResolver>) -> Self {
        self.resolvers.insert(resolver.scheme(), resolver);
        self
    }

    fn split(reference: &str) -> Result<(&str, &str)> {
        reference.split_once(':').ok_or_else(|| {
            GitspaceError::Validation("Secret reference must look like scheme:value".to_string())
        })
    }

    /// Check that a reference names a configured resolver, without resolving.
    pub fn validate(&self, reference: &str) -> Result<()> {
        let (scheme, _) = Self::split(reference)?;
        if self.resolvers.contains_key(scheme) {
            Ok(())
        } else {
            Err(GitspaceError::Validation(format!(
                "Unknown secret scheme: {}",
                scheme
            )))
        }
    }

    pub async fn resolve(&self, reference: &str) -> Result<String> {
        let (scheme, value) = Self::split(reference)?;
        let resolver = self.resolvers.get(scheme).ok_or_else(|| {
            GitspaceError::Validation(format!("Unknown secret scheme: {}", scheme))
        })?;
        resolver.resolve(value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(dir: &std::path::Path) -> SecretRegistry {
        SecretRegistry::new()
            .register(Arc::new(StaticPasswordResolver))
            .register(Arc::new(FileSecretResolver::new(dir)))
    }

    #[tokio::test]
    async fn test_static_password() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = registry(dir.path());
        assert_eq!(secrets.resolve("password:hunter2").await.unwrap(), "hunter2");
    }

    #[tokio::test]
    async fn test_file_secret() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("github-token"), "ghp_abc\n").unwrap();
        let secrets = registry(dir.path());

        assert_eq!(secrets.resolve("file:github-token").await.unwrap(), "ghp_abc");
        assert!(matches!(
            secrets.resolve("file:missing").await,
            Err(GitspaceError::NotFound(_))
        ));
        assert!(matches!(
            secrets.resolve("file:../etc/passwd").await,
            Err(GitspaceError::Validation(_))
        ));
    }

    #[test]
    fn test_validate_reference() {
        let dir = tempfile::tempdir().unwrap();
        let secrets = registry(dir.path());
        assert!(secrets.validate("file:x").is_ok());
        assert!(secrets.validate("vault:x").is_err());
        assert!(secrets.validate("no-scheme").is_err());
    }
}
