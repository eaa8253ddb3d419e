use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::DeployError;

/// Name of the FIFO the ingestion side pushes to and the worker pops from.
pub const BUILD_QUEUE: &str = "build-queue";
/// Name of the status hash. Field = deployment id, value = status string.
pub const STATUS_MAP: &str = "status";

/// Object-store prefix holding uploaded source trees.
pub const SOURCE_PREFIX: &str = "repos";
/// Object-store prefix holding published build artifacts.
pub const ARTIFACT_PREFIX: &str = "builds";

pub const ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
pub const ID_LENGTH: usize = 5;

/// Short random token identifying one deployment end to end.
///
/// Ids are drawn uniformly from [`ID_ALPHABET`]; collisions follow the
/// birthday bound for 36^5 values and are not ruled out.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeploymentId(String);

impl DeploymentId {
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let id = (0..ID_LENGTH)
            .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    pub fn parse(raw: &str) -> Result<Self, DeployError> {
        let valid = raw.len() == ID_LENGTH && raw.bytes().all(|b| ID_ALPHABET.contains(&b));
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(DeployError::InvalidDeploymentId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `repos/{id}/`
    pub fn source_prefix(&self) -> String {
        format!("{}/{}/", SOURCE_PREFIX, self.0)
    }

    /// `builds/{id}/`
    pub fn artifact_prefix(&self) -> String {
        format!("{}/{}/", ARTIFACT_PREFIX, self.0)
    }
}

impl fmt::Display for DeploymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeploymentId {
    type Err = DeployError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DeploymentId {
    type Error = DeployError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DeploymentId> for String {
    fn from(id: DeploymentId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Uploaded,
    Building,
    Deployed,
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Uploaded => "uploaded",
            Self::Building => "building",
            Self::Deployed => "deployed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deployed | Self::Failed)
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(Self::Uploaded),
            "building" => Ok(Self::Building),
            "deployed" => Ok(Self::Deployed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid deployment status: {}", s)),
        }
    }
}

/// Whether a status write may replace `from` with `to`.
///
/// Terminal states only move back to `building` through an explicit rebuild;
/// nothing ever returns to `uploaded`.
pub fn is_valid_transition(from: DeploymentStatus, to: DeploymentStatus) -> bool {
    use DeploymentStatus::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (_, Failed) | (Uploaded, Building) | (Building, Deployed) | (Deployed, Building) | (Failed, Building)
    )
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusRecord {
    pub id: DeploymentId,
    pub status: DeploymentStatus,
    pub updated_at: DateTime<Utc>,
}

/// One accepted status write, kept as the deployment's stage timeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusTransition {
    pub status: DeploymentStatus,
    pub at: DateTime<Utc>,
}
