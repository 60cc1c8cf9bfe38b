//! Capacity announcement loop.
//!
//! The node publishes its remaining capacity so the control plane can stop
//! routing work here once it is exhausted:
//! - periodically, as a liveness signal
//! - immediately whenever capacity changes

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::controller::NodeController;
use crate::node::{Announcement, ServiceNode};

/// Destination for capacity announcements.
#[async_trait]
pub trait AnnouncementSink: Send + Sync {
    async fn publish(&self, announcement: &Announcement) -> Result<()>;
}

/// Run the announcement loop until shutdown.
pub async fn run_announcement_loop(
    controller: Arc<NodeController>,
    sink: Arc<dyn AnnouncementSink>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    info!(
        interval_secs = interval.as_secs(),
        "Starting announcement loop"
    );

    let mut changes = controller.subscribe_announcements();
    let mut consecutive_failures = 0u32;
    let mut interval_timer = tokio::time::interval(interval);

    loop {
        let announcement = tokio::select! {
            _ = interval_timer.tick() => controller.announcement(),
            Ok(()) = changes.changed() => changes.borrow_and_update().clone(),
            changed = shutdown.changed() => {
                // A dropped sender also means shutdown.
                if changed.is_err() || *shutdown.borrow() {
                    info!("Announcement loop shutting down");
                    break;
                }
                continue;
            }
        };

        match sink.publish(&announcement).await {
            Ok(()) => {
                consecutive_failures = 0;
                debug!(
                    available_capacity = announcement.available_capacity,
                    capacity_unit = %announcement.capacity_unit,
                    "Announcement published"
                );
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures <= 3 {
                    warn!(
                        error = %e,
                        consecutive_failures,
                        "Announcement failed"
                    );
                } else {
                    error!(
                        error = %e,
                        consecutive_failures,
                        "Announcement failed repeatedly"
                    );
                }
            }
        }
    }

    Ok(())
}
