//! Build Worker: pops deployment ids off the job queue and drives each one
//! through fetch → build → publish, recording status as it goes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use super::broker::{JobQueue, StatusMap};
use super::fetcher::SourceFetcher;
use super::models::{DeploymentId, DeploymentStatus};
use super::publisher::ArtifactPublisher;
use super::sandbox::{BuildExecutor, BuildRequest};
use super::store::ObjectStore;
use crate::config::{RetryPolicy, ShipyardConfig};
use crate::errors::DeployError;

pub struct BuildWorker {
    queue: Arc<dyn JobQueue>,
    status: Arc<dyn StatusMap>,
    fetcher: Arc<SourceFetcher>,
    executor: Arc<BuildExecutor>,
    publisher: Arc<ArtifactPublisher>,
    poll_interval: Duration,
    retry: RetryPolicy,
}

impl BuildWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        status: Arc<dyn StatusMap>,
        store: Arc<dyn ObjectStore>,
        executor: BuildExecutor,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        let defaults = ShipyardConfig::default();
        Self {
            queue,
            status,
            fetcher: Arc::new(SourceFetcher::new(store.clone(), work_dir)),
            executor: Arc::new(executor),
            publisher: Arc::new(ArtifactPublisher::new(
                store,
                defaults.publish.upload_concurrency,
            )),
            poll_interval: defaults.queue.poll_interval(),
            retry: defaults.status_retry,
        }
    }

    /// Wire a worker from configuration, connecting the configured sandbox.
    pub fn from_config(
        config: &ShipyardConfig,
        queue: Arc<dyn JobQueue>,
        status: Arc<dyn StatusMap>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        let executor = BuildExecutor::from_config(&config.sandbox)?;
        Ok(
            Self::new(queue, status, store.clone(), executor, &config.worker.work_dir)
                .with_poll_interval(config.queue.poll_interval())
                .with_retry(config.status_retry.clone())
                .with_publisher(ArtifactPublisher::new(
                    store,
                    config.publish.upload_concurrency,
                )),
        )
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_publisher(mut self, publisher: ArtifactPublisher) -> Self {
        self.publisher = Arc::new(publisher);
        self
    }

    /// Process jobs until `shutdown` fires. A job that is already running
    /// when it fires is finished first.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(poll_ms = self.poll_interval.as_millis() as u64, "build worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.queue.pop().await {
                Ok(Some(raw)) => match DeploymentId::parse(raw.trim()) {
                    Ok(id) => {
                        let _ = self.process(&id, &shutdown).await;
                    }
                    Err(e) => tracing::warn!(entry = %raw, error = %e, "dropping malformed queue entry"),
                },
                Ok(None) => {
                    if self.idle(&shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to pop build queue");
                    if self.idle(&shutdown).await {
                        break;
                    }
                }
            }
        }
        tracing::info!("build worker stopped");
    }

    /// Sleep one poll interval. Returns true when shutdown was requested.
    async fn idle(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.poll_interval) => false,
        }
    }

    /// Run one deployment end to end. The outcome is recorded in the status
    /// map; the returned value is the published keys or the pipeline error.
    /// `shutdown` only cuts short retries of the final status write.
    pub async fn process(
        &self,
        id: &DeploymentId,
        shutdown: &CancellationToken,
    ) -> Result<Vec<String>, DeployError> {
        tracing::info!(deployment = %id, "build job started");
        self.write_status(id, DeploymentStatus::Building, shutdown).await;

        let result = self.run_pipeline(id).await;
        match &result {
            Ok(keys) => {
                tracing::info!(deployment = %id, objects = keys.len(), "deployment published");
                self.write_status(id, DeploymentStatus::Deployed, shutdown).await;
            }
            Err(e) => {
                tracing::error!(deployment = %id, stage = e.stage(), error = %e, "build job failed");
                self.write_status(id, DeploymentStatus::Failed, shutdown).await;
            }
        }

        let dir = self.fetcher.project_dir(id);
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(deployment = %id, dir = %dir.display(), error = %e, "failed to clean work dir");
        }
        result
    }

    /// Fetch, build and publish on a separate task, so a panic anywhere in
    /// the pipeline surfaces here as an error instead of ending the worker.
    async fn run_pipeline(&self, id: &DeploymentId) -> Result<Vec<String>, DeployError> {
        let fetcher = self.fetcher.clone();
        let executor = self.executor.clone();
        let publisher = self.publisher.clone();
        let job = id.clone();

        let task = tokio::spawn(async move {
            let source_dir = fetcher.fetch(&job).await?;
            executor
                .execute(&BuildRequest {
                    id: job.clone(),
                    source_dir: source_dir.clone(),
                })
                .await?;
            publisher.publish(&job, &source_dir).await
        });

        match task.await {
            Ok(result) => result,
            Err(e) => Err(DeployError::Other(anyhow::anyhow!(
                "build pipeline aborted: {}",
                e
            ))),
        }
    }

    /// Write a status with backoff. Rejected transitions are not retried.
    ///
    /// `building` gives up after `retry.max_attempts`. `deployed` and
    /// `failed` keep retrying at the capped delay until the write lands or
    /// `shutdown` fires; otherwise the deployment would stay `building`.
    async fn write_status(
        &self,
        id: &DeploymentId,
        status: DeploymentStatus,
        shutdown: &CancellationToken,
    ) {
        let mut attempt = 1;
        loop {
            match self.status.set(id, status).await {
                Ok(_) => return,
                Err(e @ DeployError::InvalidStatusTransition { .. }) => {
                    tracing::error!(deployment = %id, error = %e, "status write rejected");
                    return;
                }
                Err(e) if status.is_terminal() || self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        deployment = %id,
                        %status,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "status write failed, retrying"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            tracing::error!(
                                deployment = %id,
                                %status,
                                attempts = attempt,
                                "shutdown before status write landed"
                            );
                            return;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => {
                    tracing::error!(
                        deployment = %id,
                        %status,
                        attempts = attempt,
                        error = %e,
                        "giving up on status write"
                    );
                    return;
                }
            }
        }
    }
}
