//! Long-running services: `shipyard worker` and `shipyard router`.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use shipyard::config::ShipyardConfig;
use shipyard::deploy::router;
use shipyard::deploy::worker::BuildWorker;

use super::open_backends;

/// Token cancelled on the first Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("shutdown requested"),
            Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl-C"),
        }
        trigger.cancel();
    });
    token
}

pub async fn cmd_worker(config: &ShipyardConfig) -> Result<()> {
    let (store, broker) = open_backends(config)?;
    tokio::fs::create_dir_all(&config.worker.work_dir).await?;

    let broker = Arc::new(broker);
    let worker = BuildWorker::from_config(config, broker.clone(), broker, store)?;
    worker.run(shutdown_on_ctrl_c()).await;
    Ok(())
}

pub async fn cmd_router(config: &ShipyardConfig, port: Option<u16>) -> Result<()> {
    let (store, _broker) = open_backends(config)?;
    let mut section = config.router.clone();
    if let Some(port) = port {
        section.port = port;
    }
    router::serve(&section, store, shutdown_on_ctrl_c()).await
}
