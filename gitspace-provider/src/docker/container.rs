// Standard library
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

// External crates
use async_trait::async_trait;
use gitspace_core::command_stream::{forward_lines, system_line};
use gitspace_core::{LogSink, LogStream};
use tracing::{info, instrument, warn};

use super::command::DockerCommand;
use super::DockerSettings;
use crate::{ContainerHandle, ContainerOrchestrator, GitspaceError, ProvisionedResource, Result, RunArgs};

#[derive(Debug, Clone, PartialEq, Eq)]
enum ContainerStatus {
    Running,
    Stopped,
    Missing,
}

/// Container orchestrator backed by the local Docker CLI.
pub struct EmbeddedDockerOrchestrator {
    settings: DockerSettings,
    sink: Arc<dyn LogSink>,
}

impl EmbeddedDockerOrchestrator {
    pub fn new(settings: DockerSettings, sink: Arc<dyn LogSink>) -> Self {
        Self { settings, sink }
    }

    fn docker(&self, subcommand: &str) -> DockerCommand {
        DockerCommand::new(&self.settings.binary, subcommand)
    }

    async fn status(&self, container_name: &str) -> Result<(ContainerStatus, String)> {
        let output = self
            .docker("inspect")
            .args(["--format", "{{.Id}} {{.State.Running}}", container_name])
            .output()
            .await?;

        if !output.success {
            if output.is_not_found() {
                return Ok((ContainerStatus::Missing, String::new()));
            }
            if output.daemon_unreachable() {
                return Err(GitspaceError::ResourceUnavailable(output.stderr));
            }
            return Err(GitspaceError::RuntimeFault(format!(
                "Failed to inspect {}: {}",
                container_name, output.stderr
            )));
        }

        let mut parts = output.stdout.split_whitespace();
        let id = parts.next().unwrap_or_default().to_string();
        let status = match parts.next() {
            Some("true") => ContainerStatus::Running,
            _ => ContainerStatus::Stopped,
        };
        Ok((status, id))
    }

    async fn ensure_image(&self, gitspace_id: &str, image: &str) -> Result<()> {
        let present = self
            .docker("image")
            .args(["inspect", image])
            .output()
            .await?;
        if present.success {
            return Ok(());
        }

        system_line(self.sink.as_ref(), gitspace_id, &format!("Pulling image {}", image)).await;
        self.docker("pull")
            .arg(image)
            .execute_with(|out| {
                GitspaceError::ImagePullFailure(format!("{}: {}", image, out.stderr))
            })
            .await?;
        Ok(())
    }

    async fn create(&self, args: &RunArgs) -> Result<()> {
        let mut cmd = self
            .docker("create")
            .args(["--name", args.container_name.as_str()])
            .args(["--user", args.user.as_str()])
            .args(["--workdir", args.working_dir.as_str()]);

        for (key, value) in &args.labels {
            cmd = cmd.arg("--label").arg(format!("{}={}", key, value));
        }
        for (key, value) in &args.env {
            cmd = cmd.arg("--env").arg(format!("{}={}", key, value));
        }
        for mount in &args.mounts {
            let mut spec = format!("{}:{}", mount.source, mount.target);
            if mount.read_only {
                spec.push_str(":ro");
            }
            cmd = cmd.arg("--volume").arg(spec);
        }
        for port in &args.ports {
            cmd = cmd
                .arg("--publish")
                .arg(format!("{}::{}", self.settings.publish_address, port));
        }
        if let Some(network) = &args.network {
            cmd = cmd.args(["--network", network.as_str()]);
        }
        if let Some(cpus) = &args.cpus {
            cmd = cmd.args(["--cpus", cpus.as_str()]);
        }
        if let Some(memory) = &args.memory {
            cmd = cmd.args(["--memory", memory.as_str()]);
        }
        if let Some(shm_size) = &args.shm_size {
            cmd = cmd.args(["--shm-size", shm_size.as_str()]);
        }

        let output = cmd.arg(&args.image).args(args.command.clone()).output().await?;
        if output.success {
            return Ok(());
        }
        // Lost a race with a concurrent create; the caller starts whatever exists.
        if output.stderr.contains("is already in use") {
            warn!("Container {} already exists", args.container_name);
            return Ok(());
        }
        if output.daemon_unreachable() {
            return Err(GitspaceError::ResourceUnavailable(output.stderr));
        }
        Err(GitspaceError::RuntimeFault(format!(
            "Failed to create {}: {}",
            args.container_name, output.stderr
        )))
    }

    async fn start(&self, container_name: &str) -> Result<()> {
        self.docker("start")
            .arg(container_name)
            .execute_with(|out| {
                GitspaceError::RuntimeFault(format!(
                    "Failed to start {}: {}",
                    container_name, out.stderr
                ))
            })
            .await
            .map(|_| ())
    }

    async fn wait_running(&self, container_name: &str) -> Result<String> {
        let deadline = Instant::now() + Duration::from_secs(self.settings.start_timeout_secs);
        loop {
            if let (ContainerStatus::Running, id) = self.status(container_name).await? {
                return Ok(id);
            }
            if Instant::now() >= deadline {
                return Err(GitspaceError::StartTimeout(format!(
                    "{} not running after {}s",
                    container_name, self.settings.start_timeout_secs
                )));
            }
            tokio::time::sleep(Duration::from_millis(self.settings.poll_interval_ms)).await;
        }
    }

    async fn published_ports(&self, args: &RunArgs) -> Result<BTreeMap<u16, u16>> {
        let mut ports = BTreeMap::new();
        for port in &args.ports {
            let stdout = self
                .docker("port")
                .args([args.container_name.clone(), format!("{}/tcp", port)])
                .execute_with(|out| {
                    GitspaceError::RuntimeFault(format!("Port {} not published: {}", port, out.stderr))
                })
                .await?;
            if let Some(host_port) = parse_host_port(&stdout) {
                ports.insert(*port, host_port);
            }
        }
        Ok(ports)
    }

    /// Follow the container's output into the log sink until it exits.
    fn follow_logs(&self, gitspace_id: &str, container_name: &str) {
        let child = self
            .docker("logs")
            .args(["--follow", container_name])
            .spawn_piped();

        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!("Not following logs for {}: {}", container_name, e);
                return;
            }
        };

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, gitspace_id.to_string(), LogStream::Stdout, self.sink.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, gitspace_id.to_string(), LogStream::Stderr, self.sink.clone());
        }
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
    }
}

/// Parse `docker port` output such as `127.0.0.1:49153` or `[::]:49153`.
fn parse_host_port(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|line| line.rsplit(':').next())
        .find_map(|port| port.trim().parse().ok())
}

#[async_trait]
impl ContainerOrchestrator for EmbeddedDockerOrchestrator {
    fn name(&self) -> &'static str {
        "embedded-docker"
    }

    #[instrument(skip(self, gitspace_id, resource, args), fields(gitspace_id = %gitspace_id))]
    async fn create_and_start(
        &self,
        gitspace_id: &str,
        resource: &ProvisionedResource,
        args: &RunArgs,
    ) -> Result<ContainerHandle> {
        let (status, _) = self.status(&args.container_name).await?;
        match status {
            ContainerStatus::Running => {
                info!("Container {} already running", args.container_name);
            }
            ContainerStatus::Stopped => {
                info!("Starting existing container {}", args.container_name);
                self.start(&args.container_name).await?;
            }
            ContainerStatus::Missing => {
                self.ensure_image(gitspace_id, &args.image).await?;
                system_line(
                    self.sink.as_ref(),
                    gitspace_id,
                    &format!("Creating container {}", args.container_name),
                )
                .await;
                self.create(args).await?;
                self.start(&args.container_name).await?;
            }
        }

        let container_id = self.wait_running(&args.container_name).await?;
        if status != ContainerStatus::Running {
            self.follow_logs(gitspace_id, &args.container_name);
        }

        Ok(ContainerHandle {
            gitspace_id: gitspace_id.to_string(),
            container_id,
            container_name: args.container_name.clone(),
            host: resource.host.clone(),
            ports: self.published_ports(args).await?,
        })
    }

    #[instrument(skip(self, handle, script, env), fields(gitspace_id = %handle.gitspace_id))]
    async fn exec(
        &self,
        handle: &ContainerHandle,
        script: &str,
        env: &BTreeMap<String, String>,
    ) -> Result<()> {
        let mut cmd = self.docker("exec");
        for (key, value) in env {
            cmd = cmd.arg("--env").arg(format!("{}={}", key, value));
        }
        let mut child = cmd
            .args([handle.container_name.as_str(), "/bin/sh", "-c", script])
            .spawn_piped()?;

        let stdout = child.stdout.take().map(|out| {
            forward_lines(out, handle.gitspace_id.clone(), LogStream::Stdout, self.sink.clone())
        });
        let stderr = child.stderr.take().map(|err| {
            forward_lines(err, handle.gitspace_id.clone(), LogStream::Stderr, self.sink.clone())
        });

        let status = child.wait().await?;
        for forwarder in [stdout, stderr].into_iter().flatten() {
            let _ = forwarder.await;
        }

        if status.success() {
            Ok(())
        } else {
            Err(GitspaceError::RuntimeFault(format!(
                "Script in {} exited with {:?}",
                handle.container_name,
                status.code()
            )))
        }
    }

    #[instrument(skip(self, handle), fields(gitspace_id = %handle.gitspace_id))]
    async fn stop(&self, handle: &ContainerHandle) -> Result<()> {
        let (status, _) = self.status(&handle.container_name).await?;
        if status != ContainerStatus::Running {
            info!("Container {} already stopped", handle.container_name);
            return Ok(());
        }

        self.docker("stop")
            .arg(&handle.container_name)
            .execute_with(|out| {
                GitspaceError::RuntimeFault(format!(
                    "Failed to stop {}: {}",
                    handle.container_name, out.stderr
                ))
            })
            .await?;
        info!("Stopped container {}", handle.container_name);
        Ok(())
    }

    #[instrument(skip(self, handle), fields(gitspace_id = %handle.gitspace_id))]
    async fn remove(&self, handle: &ContainerHandle) -> Result<()> {
        let output = self
            .docker("rm")
            .args(["--force", "--volumes", handle.container_name.as_str()])
            .output()
            .await?;

        if output.success || output.is_not_found() {
            info!("Removed container {}", handle.container_name);
            return Ok(());
        }
        if output.daemon_unreachable() {
            return Err(GitspaceError::ResourceUnavailable(output.stderr));
        }
        Err(GitspaceError::RuntimeFault(format!(
            "Failed to remove {}: {}",
            handle.container_name, output.stderr
        )))
    }
}
