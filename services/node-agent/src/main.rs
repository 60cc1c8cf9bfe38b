//! wtp Node Agent
//!
//! Runs one service node: rebuilds allocator state from the local instance
//! registry, restarts recorded instances and announces capacity to the
//! control plane until shut down.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wtp_node_agent::announcer::{self, AnnouncementSink};
use wtp_node_agent::{Config, ControlPlaneClient, InstanceRegistry, MockBackend, NodeController};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration before logging so the level can come from it.
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting wtp node agent");
    info!(
        node_id = %config.node_id,
        host = %config.host,
        ports = config.port_range.len(),
        max_capacity = config.max_capacity,
        local_db = %config.local_db,
        control_plane_url = %config.control_plane_url,
        "Configuration loaded"
    );

    let registry = match InstanceRegistry::open(&config.local_db, config.store_timeout) {
        Ok(registry) => registry,
        Err(e) => {
            error!(local_db = %config.local_db, error = %e, "Failed to open instance registry");
            return Err(e.into());
        }
    };

    // Process supervision is external; the mock backend only hands out pids.
    let backend = Arc::new(MockBackend::new());
    let controller = Arc::new(NodeController::new(&config, registry, backend)?);

    let report = controller.start().await?;
    if report.violations.is_empty() {
        info!(instances = report.instances, "Node ready");
    } else {
        warn!(
            instances = report.instances,
            violations = report.violations.len(),
            "Node ready with inconsistent registry records"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sink: Arc<dyn AnnouncementSink> = Arc::new(ControlPlaneClient::new(&config)?);
    let announcer_handle = tokio::spawn({
        let controller = Arc::clone(&controller);
        let interval = Duration::from_secs(config.announce_interval_secs);
        async move { announcer::run_announcement_loop(controller, sink, interval, shutdown_rx).await }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    match announcer_handle.await {
        Ok(Ok(())) => info!("Announcement loop exited normally"),
        Ok(Err(e)) => error!(error = %e, "Announcement loop error"),
        Err(e) => error!(error = %e, "Announcement task panicked"),
    }

    info!("Node agent shutdown complete");
    Ok(())
}
