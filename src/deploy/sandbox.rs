use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use super::docker::DockerSandbox;
use super::local::LocalSandbox;
use super::models::DeploymentId;
use crate::errors::DeployError;

/// Which isolation backend runs builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    /// One throwaway container per build (the production backend).
    #[default]
    Docker,
    /// A host process group. No memory/CPU ceilings; for hosts without Docker.
    Local,
}

impl FromStr for SandboxBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "docker" => Ok(SandboxBackend::Docker),
            "local" => Ok(SandboxBackend::Local),
            _ => anyhow::bail!("Invalid sandbox backend '{}'. Valid values: docker, local", s),
        }
    }
}

/// Configuration for the build sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    pub image: String,
    /// Docker-style size, e.g. `512m`, `1g`.
    pub memory: String,
    pub cpus: f64,
    pub timeout_secs: u64,
    /// `uid:gid` the build runs as; defaults to the worker's own ids.
    pub run_as_user: Option<String>,
    pub install_command: String,
    pub build_command: String,
    pub pull_missing_image: bool,
    pub env: HashMap<String, String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Docker,
            image: "node:20-alpine".to_string(),
            memory: "1g".to_string(),
            cpus: 0.5,
            timeout_secs: 300,
            run_as_user: None,
            install_command: "npm install --include=dev".to_string(),
            build_command: "npm run build".to_string(),
            pull_missing_image: true,
            env: HashMap::new(),
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Install dependencies (dev ones included), then build.
    pub fn shell_command(&self) -> String {
        format!("{} && {}", self.install_command, self.build_command)
    }

    pub fn memory_bytes(&self) -> Result<i64> {
        parse_memory_limit(&self.memory)
    }

    pub fn effective_user(&self) -> String {
        match &self.run_as_user {
            Some(user) => user.clone(),
            // SAFETY: getuid/getgid have no preconditions and cannot fail.
            None => unsafe { format!("{}:{}", libc::getuid(), libc::getgid()) },
        }
    }
}

/// Parse a Docker-style memory size (`1g`, `512m`, `64k`, `1048576`) into bytes.
pub fn parse_memory_limit(raw: &str) -> Result<i64> {
    let s = raw.trim().to_lowercase();
    let (digits, multiplier) = match s.chars().last() {
        Some('b') => (&s[..s.len() - 1], 1),
        Some('k') => (&s[..s.len() - 1], 1024),
        Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.is_ascii_digit() => (s.as_str(), 1),
        _ => anyhow::bail!("Invalid memory limit '{}'", raw),
    };
    let value: i64 = digits
        .parse()
        .map_err(|_| anyhow::anyhow!("Invalid memory limit '{}'", raw))?;
    if value <= 0 {
        anyhow::bail!("Memory limit must be positive, got '{}'", raw);
    }
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("Memory limit '{}' overflows", raw))
}

/// One build to run: which deployment, and where its source tree lives.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub id: DeploymentId,
    pub source_dir: PathBuf,
}

/// How a finished build process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildExit {
    Code(i64),
    Signal(i32),
}

/// A launched build. `cancel` tears down the process or container and may be
/// called any number of times, before or after it exits.
#[async_trait]
pub trait BuildHandle: Send {
    async fn wait(&mut self) -> Result<BuildExit, DeployError>;

    async fn cancel(&mut self) -> Result<(), DeployError>;
}

/// Abstraction over isolated build execution for testability.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Start the install+build command. Failure to start at all is
    /// `DeployError::SpawnFailure`.
    async fn launch(&self, request: &BuildRequest) -> Result<Box<dyn BuildHandle>, DeployError>;
}

/// Map a finished build onto the pipeline's outcome.
pub fn outcome_of(exit: BuildExit) -> Result<(), DeployError> {
    match exit {
        BuildExit::Code(0) => Ok(()),
        BuildExit::Code(code) => Err(DeployError::BuildNonZeroExit { code }),
        BuildExit::Signal(signal) => Err(DeployError::BuildSignaled { signal }),
    }
}

/// Runs one build under a wall-clock limit.
pub struct BuildExecutor {
    sandbox: Arc<dyn Sandbox>,
    timeout: Duration,
}

impl BuildExecutor {
    pub fn new(sandbox: Arc<dyn Sandbox>, timeout: Duration) -> Self {
        Self { sandbox, timeout }
    }

    /// Build the sandbox named by `config.backend`.
    pub fn from_config(config: &SandboxConfig) -> Result<Self> {
        let sandbox: Arc<dyn Sandbox> = match config.backend {
            SandboxBackend::Docker => Arc::new(DockerSandbox::connect(config.clone())?),
            SandboxBackend::Local => {
                tracing::warn!(
                    "local sandbox backend does not enforce memory or CPU limits ({} / {} cpus ignored)",
                    config.memory,
                    config.cpus
                );
                Arc::new(LocalSandbox::new(config.clone()))
            }
        };
        Ok(Self::new(sandbox, config.timeout()))
    }

    /// Launch the build and race it against the timeout. Whichever side
    /// loses is cleaned up: the handle is cancelled on every path.
    pub async fn execute(&self, request: &BuildRequest) -> Result<(), DeployError> {
        let mut handle = self.sandbox.launch(request).await?;
        tracing::info!(
            deployment = %request.id,
            timeout_secs = self.timeout.as_secs(),
            "build started"
        );

        let raced = tokio::time::timeout(self.timeout, handle.wait()).await;
        let cleanup = handle.cancel().await;

        match raced {
            Ok(waited) => {
                if let Err(e) = cleanup {
                    tracing::warn!(deployment = %request.id, error = %e, "build cleanup failed");
                }
                let exit = waited?;
                tracing::info!(deployment = %request.id, ?exit, "build finished");
                outcome_of(exit)
            }
            Err(_) => {
                tracing::warn!(deployment = %request.id, "build timed out, killed");
                // A failed kill must not be reported as a plain timeout.
                cleanup?;
                Err(DeployError::BuildTimeout {
                    timeout_secs: self.timeout.as_secs(),
                })
            }
        }
    }
}

/// Forward a child stream to the log line by line, tagged with the deployment.
pub(crate) fn spawn_line_logger<R>(
    reader: R,
    id: DeploymentId,
    stream: &'static str,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => log_build_line(&id, stream, &line),
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(deployment = %id, stream, error = %e, "build log stream closed");
                    break;
                }
            }
        }
    })
}

pub(crate) fn log_build_line(id: &DeploymentId, stream: &'static str, line: &str) {
    let line = line.trim_end();
    if !line.is_empty() {
        tracing::info!(target: "shipyard::build", deployment = %id, stream, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.backend, SandboxBackend::Docker);
        assert_eq!(config.image, "node:20-alpine");
        assert_eq!(config.memory, "1g");
        assert_eq!(config.cpus, 0.5);
        assert_eq!(config.timeout(), Duration::from_secs(300));
        assert!(config.run_as_user.is_none());
        assert!(config.env.is_empty());
    }

    #[test]
    fn test_shell_command_installs_then_builds() {
        let config = SandboxConfig::default();
        assert_eq!(
            config.shell_command(),
            "npm install --include=dev && npm run build"
        );
    }

    #[test]
    fn test_parse_memory_limit() {
        assert_eq!(parse_memory_limit("1g").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory_limit("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory_limit("64K").unwrap(), 64 * 1024);
        assert_eq!(parse_memory_limit("100b").unwrap(), 100);
        assert_eq!(parse_memory_limit("2048").unwrap(), 2048);
    }

    #[test]
    fn test_parse_memory_limit_rejects_garbage() {
        for bad in ["", "g", "1x", "-1g", "0m", "1.5g", "99999999999999g"] {
            assert!(parse_memory_limit(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_effective_user_prefers_configured() {
        let config = SandboxConfig {
            run_as_user: Some("1000:1000".into()),
            ..Default::default()
        };
        assert_eq!(config.effective_user(), "1000:1000");
        let derived = SandboxConfig::default().effective_user();
        assert!(derived.contains(':'));
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("docker".parse::<SandboxBackend>().unwrap(), SandboxBackend::Docker);
        assert_eq!("LOCAL".parse::<SandboxBackend>().unwrap(), SandboxBackend::Local);
        assert!("podman".parse::<SandboxBackend>().is_err());
    }

    #[test]
    fn test_outcome_of_exit() {
        assert!(outcome_of(BuildExit::Code(0)).is_ok());
        assert!(matches!(
            outcome_of(BuildExit::Code(1)),
            Err(DeployError::BuildNonZeroExit { code: 1 })
        ));
        assert!(matches!(
            outcome_of(BuildExit::Signal(9)),
            Err(DeployError::BuildSignaled { signal: 9 })
        ));
    }

    struct StuckHandle {
        cancels: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl BuildHandle for StuckHandle {
        async fn wait(&mut self) -> Result<BuildExit, DeployError> {
            std::future::pending().await
        }

        async fn cancel(&mut self) -> Result<(), DeployError> {
            self.cancels.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    struct StuckSandbox {
        cancels: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl Sandbox for StuckSandbox {
        async fn launch(
            &self,
            _request: &BuildRequest,
        ) -> Result<Box<dyn BuildHandle>, DeployError> {
            Ok(Box::new(StuckHandle {
                cancels: self.cancels.clone(),
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_cancels_handle_on_timeout() {
        let cancels = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let executor = BuildExecutor::new(
            Arc::new(StuckSandbox {
                cancels: cancels.clone(),
            }),
            Duration::from_secs(5),
        );
        let request = BuildRequest {
            id: DeploymentId::parse("abc12").unwrap(),
            source_dir: PathBuf::from("/nonexistent"),
        };
        let err = executor.execute(&request).await.unwrap_err();
        assert!(matches!(err, DeployError::BuildTimeout { timeout_secs: 5 }));
        assert_eq!(cancels.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
