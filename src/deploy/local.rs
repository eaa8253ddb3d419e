//! Host-process build sandbox.
//!
//! Runs the build in its own process group so the whole tree can be killed
//! at once. Home and npm cache are scoped to the source directory, which keeps
//! concurrent builds from sharing state; there are no memory or CPU ceilings.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::models::DeploymentId;
use super::sandbox::{
    BuildExit, BuildHandle, BuildRequest, Sandbox, SandboxConfig, spawn_line_logger,
};
use crate::errors::DeployError;

pub struct LocalSandbox {
    config: SandboxConfig,
}

impl LocalSandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn launch(&self, request: &BuildRequest) -> Result<Box<dyn BuildHandle>, DeployError> {
        let dir = &request.source_dir;
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(self.config.shell_command())
            .current_dir(dir)
            .env("HOME", dir)
            .env("npm_config_cache", dir.join(".npm"))
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            DeployError::SpawnFailure(format!(
                "failed to spawn build in {}: {}",
                dir.display(),
                e
            ))
        })?;

        let pgid = child.id().map(|pid| pid as i32);
        let mut loggers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            loggers.push(spawn_line_logger(stdout, request.id.clone(), "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            loggers.push(spawn_line_logger(stderr, request.id.clone(), "stderr"));
        }

        Ok(Box::new(LocalBuild {
            child,
            pgid,
            id: request.id.clone(),
            loggers,
            exited: false,
        }))
    }
}

struct LocalBuild {
    child: Child,
    /// Process group id, taken once the group has been killed.
    pgid: Option<i32>,
    id: DeploymentId,
    loggers: Vec<JoinHandle<()>>,
    exited: bool,
}

impl LocalBuild {
    fn kill_group(&mut self) -> std::io::Result<()> {
        let Some(pgid) = self.pgid.take() else {
            return Ok(());
        };
        // SAFETY: killpg only sends a signal; pgid is the group this handle created.
        let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            // ESRCH: every member already exited
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BuildHandle for LocalBuild {
    async fn wait(&mut self) -> Result<BuildExit, DeployError> {
        let status = self.child.wait().await.map_err(|e| {
            DeployError::Other(anyhow::Error::new(e).context("Failed to wait for build process"))
        })?;
        self.exited = true;

        // Output pipes can outlive the shell if it left background jobs behind.
        for logger in self.loggers.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(2), logger).await;
        }

        match (status.code(), status.signal()) {
            (Some(code), _) => Ok(BuildExit::Code(code as i64)),
            (None, Some(signal)) => Ok(BuildExit::Signal(signal)),
            (None, None) => Err(DeployError::Other(anyhow::anyhow!(
                "Build process ended without exit code or signal"
            ))),
        }
    }

    async fn cancel(&mut self) -> Result<(), DeployError> {
        self.kill_group().map_err(|e| {
            DeployError::Other(
                anyhow::Error::new(e).context(format!("Failed to kill build for {}", self.id)),
            )
        })?;
        if !self.exited {
            // reap the leader so it does not linger as a zombie
            let _ = self.child.wait().await;
            self.exited = true;
        }
        for logger in self.loggers.drain(..) {
            logger.abort();
        }
        Ok(())
    }
}

impl Drop for LocalBuild {
    fn drop(&mut self) {
        let _ = self.kill_group();
    }
}
