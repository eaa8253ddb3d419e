//! Runtime configuration, loaded once in `main` and passed to each component.
//!
//! Sources, lowest precedence first: built-in defaults, `shipyard.toml`,
//! `SHIPYARD_*` environment variables (a `.env` file is loaded into the
//! environment by `main`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::deploy::sandbox::{SandboxConfig, parse_memory_limit};

pub const DEFAULT_CONFIG_FILE: &str = "shipyard.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShipyardConfig {
    pub sandbox: SandboxConfig,
    pub queue: QueueSection,
    pub store: StoreSection,
    pub worker: WorkerSection,
    pub publish: PublishSection,
    pub router: RouterSection,
    pub status_retry: RetryPolicy,
}

/// Job queue and status map location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueSection {
    /// SQLite database shared by every worker on the host.
    pub database: PathBuf,
    pub poll_interval_ms: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            database: PathBuf::from(".shipyard/broker.db"),
            poll_interval_ms: 1000,
        }
    }
}

impl QueueSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Which object store backend holds sources and artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// A directory tree on local disk.
    #[default]
    Fs,
    /// An S3-compatible bucket (AWS, R2, MinIO).
    S3,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fs" => Ok(StoreBackend::Fs),
            "s3" => Ok(StoreBackend::S3),
            _ => anyhow::bail!("Invalid store backend '{}'. Valid values: fs, s3", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackend,
    /// Root directory of the `fs` backend.
    pub root: PathBuf,
    /// Bucket endpoint of the `s3` backend; AWS itself when unset.
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    /// `auto` suits R2; AWS buckets need their real region.
    pub region: String,
    pub access_key_id: Option<String>,
    #[serde(skip_serializing)]
    pub secret_access_key: Option<String>,
    /// Allow a plain `http://` endpoint, e.g. a local MinIO.
    pub allow_http: bool,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Fs,
            root: PathBuf::from(".shipyard/objects"),
            endpoint: None,
            bucket: None,
            region: "auto".to_string(),
            access_key_id: None,
            secret_access_key: None,
            allow_http: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerSection {
    /// Scratch directory source trees are fetched into.
    pub work_dir: PathBuf,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from(".shipyard/work"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublishSection {
    pub upload_concurrency: usize,
}

impl Default for PublishSection {
    fn default() -> Self {
        Self {
            upload_concurrency: 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RouterSection {
    pub bind: String,
    pub port: u16,
}

impl Default for RouterSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3001,
        }
    }
}

impl RouterSection {
    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .with_context(|| format!("Invalid router address {}:{}", self.bind, self.port))
    }
}

/// Exponential backoff for status-map writes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }
        let delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

impl ShipyardConfig {
    /// Load `path` if it exists (defaults otherwise), apply `SHIPYARD_*`
    /// overrides from the process environment and validate the result.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::parse(&content)
                .with_context(|| format!("Failed to parse {}", path.display()))?
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.apply_env(|name| std::env::var(name).ok())?;

        let problems = config.validate();
        if !problems.is_empty() {
            anyhow::bail!("Invalid configuration:\n  - {}", problems.join("\n  - "));
        }
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse shipyard.toml")
    }

    /// Override file values from environment variables. `lookup` is
    /// `std::env::var` in production and a map in tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(name: &str, raw: String) -> Result<T>
        where
            T::Err: std::fmt::Display,
        {
            raw.trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid value for {}: {} ({})", name, raw, e))
        }

        if let Some(v) = lookup("SHIPYARD_SANDBOX_BACKEND") {
            self.sandbox.backend = v.parse()?;
        }
        if let Some(v) = lookup("SHIPYARD_SANDBOX_IMAGE") {
            self.sandbox.image = v;
        }
        if let Some(v) = lookup("SHIPYARD_SANDBOX_MEMORY") {
            self.sandbox.memory = v;
        }
        if let Some(v) = lookup("SHIPYARD_SANDBOX_CPUS") {
            self.sandbox.cpus = parsed("SHIPYARD_SANDBOX_CPUS", v)?;
        }
        if let Some(v) = lookup("SHIPYARD_SANDBOX_TIMEOUT_SECS") {
            self.sandbox.timeout_secs = parsed("SHIPYARD_SANDBOX_TIMEOUT_SECS", v)?;
        }
        if let Some(v) = lookup("SHIPYARD_SANDBOX_RUN_AS_USER") {
            self.sandbox.run_as_user = Some(v);
        }
        if let Some(v) = lookup("SHIPYARD_QUEUE_DATABASE") {
            self.queue.database = PathBuf::from(v);
        }
        if let Some(v) = lookup("SHIPYARD_QUEUE_POLL_INTERVAL_MS") {
            self.queue.poll_interval_ms = parsed("SHIPYARD_QUEUE_POLL_INTERVAL_MS", v)?;
        }
        if let Some(v) = lookup("SHIPYARD_STORE_BACKEND") {
            self.store.backend = v.parse()?;
        }
        if let Some(v) = lookup("SHIPYARD_STORE_ROOT") {
            self.store.root = PathBuf::from(v);
        }
        if let Some(v) = lookup("SHIPYARD_STORE_ENDPOINT") {
            self.store.endpoint = Some(v);
        }
        if let Some(v) = lookup("SHIPYARD_STORE_BUCKET") {
            self.store.bucket = Some(v);
        }
        if let Some(v) = lookup("SHIPYARD_STORE_REGION") {
            self.store.region = v;
        }
        if let Some(v) = lookup("SHIPYARD_STORE_ACCESS_KEY_ID") {
            self.store.access_key_id = Some(v);
        }
        if let Some(v) = lookup("SHIPYARD_STORE_SECRET_ACCESS_KEY") {
            self.store.secret_access_key = Some(v);
        }
        if let Some(v) = lookup("SHIPYARD_STORE_ALLOW_HTTP") {
            self.store.allow_http = parsed("SHIPYARD_STORE_ALLOW_HTTP", v)?;
        }
        if let Some(v) = lookup("SHIPYARD_WORK_DIR") {
            self.worker.work_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SHIPYARD_UPLOAD_CONCURRENCY") {
            self.publish.upload_concurrency = parsed("SHIPYARD_UPLOAD_CONCURRENCY", v)?;
        }
        if let Some(v) = lookup("SHIPYARD_ROUTER_BIND") {
            self.router.bind = v;
        }
        if let Some(v) = lookup("SHIPYARD_ROUTER_PORT") {
            self.router.port = parsed("SHIPYARD_ROUTER_PORT", v)?;
        }
        Ok(())
    }

    /// Every problem found, empty when the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if let Err(e) = parse_memory_limit(&self.sandbox.memory) {
            problems.push(format!("sandbox.memory: {}", e));
        }
        if self.sandbox.cpus.is_nan() || self.sandbox.cpus <= 0.0 {
            problems.push(format!(
                "sandbox.cpus must be positive, got {}",
                self.sandbox.cpus
            ));
        }
        if self.sandbox.timeout_secs == 0 {
            problems.push("sandbox.timeout_secs must be positive".to_string());
        }
        if self.sandbox.image.trim().is_empty() {
            problems.push("sandbox.image must not be empty".to_string());
        }
        if self.store.backend == StoreBackend::S3 {
            if self.store.bucket.as_deref().is_none_or(|b| b.trim().is_empty()) {
                problems.push("store.bucket is required for the s3 backend".to_string());
            }
            if self.store.access_key_id.is_some() != self.store.secret_access_key.is_some() {
                problems.push(
                    "store.access_key_id and store.secret_access_key must be set together"
                        .to_string(),
                );
            }
        }
        if self.queue.poll_interval_ms == 0 {
            problems.push("queue.poll_interval_ms must be positive".to_string());
        }
        if self.publish.upload_concurrency == 0 {
            problems.push("publish.upload_concurrency must be at least 1".to_string());
        }
        if self.status_retry.max_attempts == 0 {
            problems.push("status_retry.max_attempts must be at least 1".to_string());
        }
        if self.status_retry.backoff_multiplier < 1.0 {
            problems.push(format!(
                "status_retry.backoff_multiplier must be >= 1.0, got {}",
                self.status_retry.backoff_multiplier
            ));
        }
        if let Err(e) = self.router.addr() {
            problems.push(format!("router: {}", e));
        }

        problems
    }
}
