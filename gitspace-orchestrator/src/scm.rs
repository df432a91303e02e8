//! Source control adapters: resolve a repository reference into clone
//! instructions the container can execute.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use gitspace_core::{GitspaceError, Result};
use serde::{Deserialize, Serialize};
use url::Url;
use utoipa::ToSchema;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema,
)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CodeRepoType {
    /// Repository hosted by the platform's own source control.
    Internal,
    /// Any git remote reachable over HTTP(S).
    Generic,
}

impl Display for CodeRepoType {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            CodeRepoType::Internal => f.write_str("internal"),
            CodeRepoType::Generic => f.write_str("generic"),
        }
    }
}

impl FromStr for CodeRepoType {
    type Err = GitspaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "internal" => Ok(CodeRepoType::Internal),
            "generic" => Ok(CodeRepoType::Generic),
            other => Err(GitspaceError::Validation(format!(
                "Unknown code repo type: {}",
                other
            ))),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneInfo {
    pub clone_url: String,
    pub checkout_ref: Option<String>,
    /// Directory name the checkout lands in.
    pub repo_name: String,
    pub credentials: Option<Credentials>,
}

impl CloneInfo {
    /// Script cloning into `{parent}/{repo_name}` unless a checkout already
    /// exists there. Credentials are read from the environment returned by
    /// [`CloneInfo::env`].
    pub fn clone_script(&self, parent: &str) -> String {
        let target = format!("{}/{}", parent, self.repo_name);
        let mut clone = String::from("git");
        if self.credentials.is_some() {
            clone.push_str(
                " -c credential.helper='!f() { echo \"username=${GIT_USERNAME}\"; echo \"password=${GIT_PASSWORD}\"; }; f'",
            );
        }
        clone.push_str(" clone");
        if let Some(checkout_ref) = &self.checkout_ref {
            clone.push_str(" --branch ");
            clone.push_str(&shell_quote(checkout_ref));
        }
        clone.push(' ');
        clone.push_str(&shell_quote(&self.clone_url));
        clone.push(' ');
        clone.push_str(&shell_quote(&target));

        format!(
            "if [ ! -d {}/.git ]; then {}; fi",
            shell_quote(&target),
            clone
        )
    }

    pub fn env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        if let Some(credentials) = &self.credentials {
            env.insert("GIT_USERNAME".to_string(), credentials.username.clone());
            env.insert("GIT_PASSWORD".to_string(), credentials.password.clone());
        }
        env
    }
}

/// Single-quote for POSIX sh.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

fn repo_name_from_path(path: &str) -> Option<String> {
    let name = path
        .trim_end_matches('/')
        .rsplit('/')
        .next()?
        .trim_end_matches(".git");
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

#[async_trait]
pub trait ScmAdapter: Send + Sync {
    fn repo_type(&self) -> CodeRepoType;

    /// Reject references this adapter can never resolve.
    fn validate(&self, repo_ref: &str) -> Result<()>;

    async fn resolve_clone(
        &self,
        repo_ref: &str,
        branch: Option<&str>,
        credentials: Option<Credentials>,
    ) -> Result<CloneInfo>;
}

/// Repositories addressed by `space/repo` path on the platform's git server.
#[derive(Debug, Clone)]
pub struct InternalScm {
    base_url: Url,
}

impl InternalScm {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url).map_err(|e| {
            GitspaceError::Validation(format!("Invalid SCM base URL '{}': {}", base_url, e))
        })?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Ok(Self { base_url })
    }
}

#[async_trait]
impl ScmAdapter for InternalScm {
    fn repo_type(&self) -> CodeRepoType {
        CodeRepoType::Internal
    }

    fn validate(&self, repo_ref: &str) -> Result<()> {
        let valid = !repo_ref.is_empty()
            && !repo_ref.starts_with('/')
            && repo_ref
                .split('/')
                .all(|seg| !seg.is_empty() && seg != "." && seg != "..")
            && repo_ref
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "-_./".contains(c));
        if valid {
            Ok(())
        } else {
            Err(GitspaceError::Validation(format!(
                "Invalid repository path: {}",
                repo_ref
            )))
        }
    }

    async fn resolve_clone(
        &self,
        repo_ref: &str,
        branch: Option<&str>,
        credentials: Option<Credentials>,
    ) -> Result<CloneInfo> {
        self.validate(repo_ref)?;
        let path = repo_ref.trim_end_matches(".git");
        let clone_url = self
            .base_url
            .join(&format!("git/{}.git", path))
            .map_err(|e| GitspaceError::Validation(format!("Invalid repository path: {}", e)))?;
        let repo_name = repo_name_from_path(path)
            .ok_or_else(|| GitspaceError::Validation(format!("Invalid repository path: {}", repo_ref)))?;

        Ok(CloneInfo {
            clone_url: clone_url.to_string(),
            checkout_ref: branch.map(str::to_string),
            repo_name,
            credentials,
        })
    }
}

/// Any external git remote given as a full HTTP(S) URL.
#[derive(Debug, Clone, Default)]
pub struct GenericScm;

impl GenericScm {
    fn parse(repo_ref: &str) -> Result<Url> {
        let url = Url::parse(repo_ref).map_err(|e| {
            GitspaceError::Validation(format!("Invalid repository URL '{}': {}", repo_ref, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GitspaceError::Validation(format!(
                "Unsupported repository URL scheme: {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(GitspaceError::Validation(format!(
                "Repository URL has no host: {}",
                repo_ref
            )));
        }
        Ok(url)
    }
}

#[async_trait]
impl ScmAdapter for GenericScm {
    fn repo_type(&self) -> CodeRepoType {
        CodeRepoType::Generic
    }

    fn validate(&self, repo_ref: &str) -> Result<()> {
        Self::parse(repo_ref).map(|_| ())
    }

    async fn resolve_clone(
        &self,
        repo_ref: &str,
        branch: Option<&str>,
        credentials: Option<Credentials>,
    ) -> Result<CloneInfo> {
        let url = Self::parse(repo_ref)?;
        let repo_name = repo_name_from_path(url.path())
            .ok_or_else(|| GitspaceError::Validation(format!("No repository in URL: {}", repo_ref)))?;

        Ok(CloneInfo {
            clone_url: url.to_string(),
            checkout_ref: branch.map(str::to_string),
            repo_name,
            credentials,
        })
    }
}

#[derive(Clone, Default)]
pub struct ScmRegistry {
    adapters: HashMap<CodeRepoType, Arc<dyn ScmAdapter>>,
}

impl ScmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, adapter: Arc<dyn ScmAdapter>) -> Self {
        self.adapters.insert(adapter.repo_type(), adapter);
        self
    }

    pub fn get(&self, repo_type: CodeRepoType) -> Result<Arc<dyn ScmAdapter>> {
        self.adapters.get(&repo_type).cloned().ok_or_else(|| {
            GitspaceError::Validation(format!("No SCM adapter configured for {}", repo_type))
        })
    }
}
