//! Docker command abstraction and builder utilities.
//!
//! Every Docker interaction goes through [`DockerCommand`], which runs the CLI
//! asynchronously and classifies failures into the gitspace error taxonomy so
//! callers only decide what a failure means for their stage.

use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::{GitspaceError, Result};

/// Captured result of a finished Docker invocation.
#[derive(Debug, Clone)]
pub struct DockerOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl DockerOutput {
    /// Docker reports unknown containers, images and volumes with one of these.
    pub fn is_not_found(&self) -> bool {
        let stderr = self.stderr.to_lowercase();
        stderr.contains("no such object")
            || stderr.contains("no such container")
            || stderr.contains("no such volume")
            || stderr.contains("no such image")
    }

    pub fn daemon_unreachable(&self) -> bool {
        let stderr = self.stderr.to_lowercase();
        stderr.contains("cannot connect to the docker daemon")
            || stderr.contains("error during connect")
            || stderr.contains("is the docker daemon running")
    }
}

/// Builder for Docker commands with fluent interface and consistent error handling.
#[derive(Debug, Clone)]
pub struct DockerCommand {
    binary: String,
    subcommand: String,
    args: Vec<String>,
}

impl DockerCommand {
    pub fn new<B: Into<String>, S: Into<String>>(binary: B, subcommand: S) -> Self {
        Self {
            binary: binary.into(),
            subcommand: subcommand.into(),
            args: Vec::new(),
        }
    }

    /// Add a single argument to the command.
    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments to the command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec![self.subcommand.clone()];
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Run to completion and capture output. A non-zero exit is not an error
    /// here; callers inspect [`DockerOutput`] to classify it.
    pub async fn output(self) -> Result<DockerOutput> {
        let mut cmd = self.build_command();
        debug!("Executing Docker command: {} {:?}", self.binary, self.argv());

        let output = cmd.output().await.map_err(|e| {
            GitspaceError::ResourceUnavailable(format!(
                "Failed to execute '{} {}': {}",
                self.binary, self.subcommand, e
            ))
        })?;

        Ok(DockerOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    /// Run to completion and return stdout, mapping a non-zero exit through
    /// `on_failure`. An unreachable daemon is always `ResourceUnavailable`.
    pub async fn execute_with<F>(self, on_failure: F) -> Result<String>
    where
        F: FnOnce(&DockerOutput) -> GitspaceError,
    {
        let output = self.output().await?;
        if output.success {
            return Ok(output.stdout);
        }
        if output.daemon_unreachable() {
            return Err(GitspaceError::ResourceUnavailable(output.stderr));
        }
        Err(on_failure(&output))
    }

    /// Spawn with piped stdout/stderr for streaming.
    pub fn spawn_piped(self) -> Result<Child> {
        let mut cmd = self.build_command();
        debug!("Spawning Docker command: {} {:?}", self.binary, self.argv());

        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                GitspaceError::ResourceUnavailable(format!(
                    "Failed to spawn '{} {}': {}",
                    self.binary, self.subcommand, e
                ))
            })
    }

    fn build_command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg(&self.subcommand).args(&self.args);
        cmd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(stderr: &str) -> DockerOutput {
        DockerOutput {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_argv_building() {
        let cmd = DockerCommand::new("docker", "run")
            .arg("--rm")
            .args(["-e", "A=1"])
            .arg("busybox");
        assert_eq!(cmd.argv(), vec!["run", "--rm", "-e", "A=1", "busybox"]);
    }

    #[test]
    fn test_not_found_detection() {
        assert!(output("Error: No such object: gitspace-c1").is_not_found());
        assert!(output("Error response from daemon: No such container: x").is_not_found());
        assert!(output("Error: No such volume: v").is_not_found());
        assert!(!output("permission denied").is_not_found());
    }

    #[test]
    fn test_daemon_unreachable_detection() {
        assert!(output(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock. Is the docker daemon running?"
        )
        .daemon_unreachable());
        assert!(!output("No such container: x").daemon_unreachable());
    }

    #[tokio::test]
    async fn test_missing_binary_is_resource_unavailable() {
        let result = DockerCommand::new("definitely-not-a-docker-binary", "info")
            .output()
            .await;
        assert!(matches!(result, Err(GitspaceError::ResourceUnavailable(_))));
    }
}
