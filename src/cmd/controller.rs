//! `conveyor controller`: run the reconcile loops against the local engine.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use conveyor::config::OrchestratorConfig;
use conveyor::controller::Controller;
use conveyor::engine::{LocalEngine, PipelineEngine};
use conveyor::notify::HttpMessageSender;

use super::open_stores;

pub async fn cmd_controller(config: &OrchestratorConfig) -> Result<()> {
    let stores = open_stores(config)?;
    let engine: Arc<dyn PipelineEngine> = Arc::new(LocalEngine::new(config.engine.workspace_dir.clone()));
    let sender = Arc::new(HttpMessageSender::new().context("Failed to build HTTP client")?);
    let controller = Arc::new(
        Controller::assemble(stores, engine, sender, config)
            .context("Failed to set up the controller")?,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
            }
            cancel.cancel();
        });
    }

    println!(
        "Controller running for cluster {} (Ctrl-C to stop)",
        console::style(&config.controller.cluster_name).cyan()
    );
    controller.run(cancel).await?;
    Ok(())
}
