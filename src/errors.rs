//! Typed error hierarchy for shipyard.
//!
//! - `StoreError`: object-store reads and writes
//! - `DeployError`: one build job's pipeline
//! - `RouterError`: edge-router request resolution, always rendered as 404

use std::path::PathBuf;

use thiserror::Error;

/// Errors from an `ObjectStore` backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Object {key} not found")]
    NotFound { key: String },

    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Object store I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            key: key.into(),
            source,
        }
    }
}

/// Errors from a single build job. Every variant is caught at the worker's
/// job boundary and turned into a `failed` status write.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("Failed to fetch source for {id}: {source}")]
    SourceFetch {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to start build sandbox: {0}")]
    SpawnFailure(String),

    #[error("Build exceeded time limit ({timeout_secs}s)")]
    BuildTimeout { timeout_secs: u64 },

    #[error("Build exited with non-zero code {code}")]
    BuildNonZeroExit { code: i64 },

    #[error("Build terminated by signal {signal}")]
    BuildSignaled { signal: i32 },

    #[error(
        "No build output found in {project_dir}. Checked: {}. Directory contains: [{}]",
        .candidates.join(", "),
        .contents.join(", ")
    )]
    NoOutputDirectoryFound {
        project_dir: PathBuf,
        candidates: Vec<String>,
        contents: Vec<String>,
    },

    #[error("Failed to upload {file}: {source}")]
    PublishUpload {
        file: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error("Invalid deployment id '{0}'")]
    InvalidDeploymentId(String),

    #[error("Refusing status transition for {id}: {from} -> {to}")]
    InvalidStatusTransition { id: String, from: String, to: String },

    #[error("Status map error: {0}")]
    Status(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeployError {
    /// Pipeline stage the error belongs to, used as a structured log field.
    pub fn stage(&self) -> &'static str {
        match self {
            DeployError::SourceFetch { .. } => "fetch",
            DeployError::SpawnFailure(_)
            | DeployError::BuildTimeout { .. }
            | DeployError::BuildNonZeroExit { .. }
            | DeployError::BuildSignaled { .. } => "build",
            DeployError::NoOutputDirectoryFound { .. } | DeployError::PublishUpload { .. } => {
                "publish"
            }
            DeployError::InvalidDeploymentId(_)
            | DeployError::InvalidStatusTransition { .. }
            | DeployError::Status(_) => "status",
            DeployError::Other(_) => "internal",
        }
    }
}

/// Errors from resolving an inbound request to an artifact.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Host '{0}' does not name a deployment")]
    InvalidHost(String),

    #[error("Artifact {key} not found")]
    ObjectNotFound { key: String },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for RouterError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { key } => RouterError::ObjectNotFound { key },
            other => RouterError::Store(other),
        }
    }
}
