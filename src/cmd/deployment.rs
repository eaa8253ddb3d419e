//! One-shot deployment commands: `submit`, `enqueue`, `status`.

use std::path::Path;

use anyhow::{Context, Result};

use shipyard::config::ShipyardConfig;
use shipyard::deploy::broker::StatusMap;
use shipyard::deploy::ingest;
use shipyard::deploy::models::DeploymentId;

use super::open_backends;

pub async fn cmd_submit(config: &ShipyardConfig, dir: &Path) -> Result<()> {
    let (store, broker) = open_backends(config)?;
    let submission = ingest::submit(dir, store.as_ref(), &broker, &broker)
        .await
        .with_context(|| format!("Failed to submit {}", dir.display()))?;
    println!(
        "deployment {} queued ({} files)",
        submission.id, submission.files
    );
    Ok(())
}

pub async fn cmd_enqueue(config: &ShipyardConfig, raw_id: &str) -> Result<()> {
    let id = DeploymentId::parse(raw_id)?;
    let (store, broker) = open_backends(config)?;
    ingest::enqueue(&id, store.as_ref(), &broker).await?;
    println!("deployment {} queued", id);
    Ok(())
}

pub async fn cmd_status(config: &ShipyardConfig, raw_id: &str, json: bool) -> Result<()> {
    let id = DeploymentId::parse(raw_id)?;
    let (_store, broker) = open_backends(config)?;
    let record = broker
        .get(&id)
        .await?
        .with_context(|| format!("No status recorded for deployment {}", id))?;
    let history = broker.history(&id).await?;

    if json {
        let report = serde_json::json!({
            "id": record.id,
            "status": record.status,
            "updated_at": record.updated_at,
            "history": history,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("{}", record.status);
    for transition in history {
        println!(
            "  {:<9} {}",
            transition.status.as_str(),
            transition.at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}
