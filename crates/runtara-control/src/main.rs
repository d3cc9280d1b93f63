// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtara Control - Environment Lifecycle Control Plane
//!
//! Runs the control plane against the bundled mock task controller and
//! resource manager, with workflow templates read from the configured
//! directory. Useful to exercise workflows end to end without a cluster.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use runtara_control::config::Config;
use runtara_control::coordinator::MockTaskController;
use runtara_control::hooks::MockCallHandler;
use runtara_control::offers::{MockResourceManager, Offer, Ranges};
use runtara_control::runtime::ControlRuntime;
use runtara_control::workflow::JsonWorkflowLoader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "runtara_control=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        workflow_dir = %config.workflow_dir.display(),
        deployment_timeout = ?config.deployment_timeout,
        "Starting Runtara Control"
    );

    let loader = Arc::new(JsonWorkflowLoader::new(&config.workflow_dir));

    // Start the runtime
    let runtime = ControlRuntime::builder()
        .task_controller(Arc::new(MockTaskController::new()))
        .resource_manager(Arc::new(MockResourceManager::new()))
        .workflow_loader(loader)
        .call_handler(Arc::new(MockCallHandler::new()))
        .config(config)
        .build()?
        .start()
        .await?;

    // Offer one local host until shutdown
    let offers = runtime.offer_sender();
    let feeder = tokio::spawn(feed_local_offers(offers));

    info!("Control plane ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    feeder.abort();
    for id in runtime.manager().ids() {
        if let Err(e) = runtime.manager().destroy_environment(id, true, false).await {
            warn!(env_id = %id, error = %e, "Failed to destroy environment");
        }
    }

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Runtara Control shut down");

    Ok(())
}

async fn feed_local_offers(offers: mpsc::Sender<Vec<Offer>>) {
    let hostname = "localhost".to_string();
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    let mut sequence = 0u64;
    loop {
        interval.tick().await;
        sequence += 1;
        let offer = Offer::new(
            format!("local-{sequence}"),
            hostname.clone(),
            8.0,
            16384.0,
            Ranges::span(1024, 65535),
        );
        if offers.send(vec![offer]).await.is_err() {
            break;
        }
    }
}
