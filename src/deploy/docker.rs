//! Docker-backed build sandbox.
//!
//! Each build gets a throwaway container: the fetched source tree is bind
//! mounted at `/work`, npm's home and cache are pointed inside it, and the
//! configured memory/CPU ceilings are applied through the host config.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use bollard::Docker;
use bollard::errors::Error as DockerError;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, InspectContainerOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use futures::{StreamExt, TryStreamExt};
use tokio::task::JoinHandle;

use super::models::DeploymentId;
use super::sandbox::{BuildExit, BuildHandle, BuildRequest, Sandbox, SandboxConfig, log_build_line};
use crate::errors::DeployError;

const WORKDIR: &str = "/work";
const DEPLOYMENT_LABEL: &str = "shipyard.deployment";

pub struct DockerSandbox {
    docker: Docker,
    config: SandboxConfig,
    memory_bytes: i64,
}

impl DockerSandbox {
    /// Create a client for the local Docker daemon. No connection is made
    /// until the first build.
    pub fn connect(config: SandboxConfig) -> anyhow::Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to create Docker client")?;
        let memory_bytes = config.memory_bytes()?;
        Ok(Self {
            docker,
            config,
            memory_bytes,
        })
    }

    async fn ensure_image(&self) -> Result<(), DeployError> {
        let image = &self.config.image;
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        if !self.config.pull_missing_image {
            return Err(DeployError::SpawnFailure(format!(
                "image {} is not present and pulling is disabled",
                image
            )));
        }
        tracing::info!(image = %image, "pulling build image");
        let options = CreateImageOptions {
            from_image: Some(image.clone()),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| DeployError::SpawnFailure(format!("failed to pull {}: {}", image, e)))?;
        Ok(())
    }
}

/// Container definition for one build: source bind-mounted at `/work`, npm state
/// kept inside it, resource ceilings and privileges locked down.
fn container_body(
    config: &SandboxConfig,
    memory_bytes: i64,
    id: &DeploymentId,
    host_dir: &str,
) -> ContainerCreateBody {
    let mut env = vec![
        format!("HOME={}", WORKDIR),
        format!("npm_config_cache={}/.npm", WORKDIR),
    ];
    env.extend(config.env.iter().map(|(k, v)| format!("{}={}", k, v)));

    let host_config = HostConfig {
        binds: Some(vec![format!("{}:{}", host_dir, WORKDIR)]),
        memory: Some(memory_bytes),
        // swap capped at the memory limit: no extra swap beyond the ceiling
        memory_swap: Some(memory_bytes),
        nano_cpus: Some((config.cpus * 1_000_000_000.0) as i64),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(vec!["no-new-privileges".to_string()]),
        ..Default::default()
    };

    ContainerCreateBody {
        image: Some(config.image.clone()),
        cmd: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            config.shell_command(),
        ]),
        env: Some(env),
        working_dir: Some(WORKDIR.to_string()),
        user: Some(config.effective_user()),
        labels: Some(HashMap::from([(
            DEPLOYMENT_LABEL.to_string(),
            id.to_string(),
        )])),
        host_config: Some(host_config),
        ..Default::default()
    }
}

/// Docker reports a container killed by signal `n` as exit code `128 + n`.
/// The OOM killer's SIGKILL is read from the container state instead, since
/// the code alone cannot tell it apart from `docker kill`.
fn exit_from_status(code: i64, oom_killed: bool) -> BuildExit {
    if oom_killed {
        return BuildExit::Signal(libc::SIGKILL);
    }
    match code {
        129..=192 => BuildExit::Signal((code - 128) as i32),
        _ => BuildExit::Code(code),
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    async fn launch(&self, request: &BuildRequest) -> Result<Box<dyn BuildHandle>, DeployError> {
        self.docker
            .ping()
            .await
            .map_err(|e| DeployError::SpawnFailure(format!("Docker daemon unavailable: {}", e)))?;
        self.ensure_image().await?;

        let host_dir = request
            .source_dir
            .canonicalize()
            .map_err(|e| {
                DeployError::SpawnFailure(format!(
                    "source directory {} unusable: {}",
                    request.source_dir.display(),
                    e
                ))
            })?
            .to_string_lossy()
            .to_string();

        let created = self
            .docker
            .create_container(
                None::<CreateContainerOptions>,
                container_body(&self.config, self.memory_bytes, &request.id, &host_dir),
            )
            .await
            .map_err(|e| DeployError::SpawnFailure(format!("failed to create container: {}", e)))?;

        let mut handle = DockerBuild {
            docker: self.docker.clone(),
            container_id: created.id,
            id: request.id.clone(),
            log_task: None,
            removed: false,
        };

        if let Err(e) = self
            .docker
            .start_container(&handle.container_id, None::<StartContainerOptions>)
            .await
        {
            let _ = handle.cancel().await;
            return Err(DeployError::SpawnFailure(format!(
                "failed to start container: {}",
                e
            )));
        }

        handle.log_task = Some(handle.follow_logs());
        Ok(Box::new(handle))
    }
}

struct DockerBuild {
    docker: Docker,
    container_id: String,
    id: DeploymentId,
    log_task: Option<JoinHandle<()>>,
    removed: bool,
}

impl DockerBuild {
    fn follow_logs(&self) -> JoinHandle<()> {
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        let id = self.id.clone();
        tokio::spawn(async move {
            let options = LogsOptions {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            };
            let mut logs = Box::pin(docker.logs(&container_id, Some(options)));
            while let Some(item) = logs.next().await {
                match item {
                    Ok(bollard::container::LogOutput::StdOut { message })
                    | Ok(bollard::container::LogOutput::Console { message }) => {
                        for line in String::from_utf8_lossy(&message).lines() {
                            log_build_line(&id, "stdout", line);
                        }
                    }
                    Ok(bollard::container::LogOutput::StdErr { message }) => {
                        for line in String::from_utf8_lossy(&message).lines() {
                            log_build_line(&id, "stderr", line);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(deployment = %id, error = %e, "container log stream ended");
                        break;
                    }
                }
            }
        })
    }

    async fn oom_killed(&self) -> bool {
        match self
            .docker
            .inspect_container(&self.container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect
                .state
                .and_then(|s| s.oom_killed)
                .unwrap_or(false),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl BuildHandle for DockerBuild {
    async fn wait(&mut self) -> Result<BuildExit, DeployError> {
        let mut waiter = Box::pin(
            self.docker
                .wait_container(&self.container_id, None::<WaitContainerOptions>),
        );
        let code = match waiter.next().await {
            Some(Ok(resp)) => resp.status_code,
            // bollard reports non-zero exits through this error variant
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => {
                return Err(DeployError::Other(
                    anyhow::Error::new(e).context("Failed to wait for build container"),
                ));
            }
            None => {
                return Err(DeployError::Other(anyhow::anyhow!(
                    "Container wait stream ended without a status"
                )));
            }
        };

        if let Some(task) = self.log_task.take() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(2), task).await;
        }

        let oom_killed = code != 0 && self.oom_killed().await;
        if oom_killed {
            tracing::warn!(deployment = %self.id, "build container was OOM-killed");
        }
        Ok(exit_from_status(code, oom_killed))
    }

    async fn cancel(&mut self) -> Result<(), DeployError> {
        if let Some(task) = self.log_task.take() {
            task.abort();
        }
        if self.removed {
            return Ok(());
        }
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(&self.container_id, Some(options))
            .await
        {
            Ok(()) => {}
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => {
                return Err(DeployError::Other(
                    anyhow::Error::new(e).context(format!(
                        "Failed to remove build container {}",
                        self.container_id
                    )),
                ));
            }
        }
        self.removed = true;
        Ok(())
    }
}
