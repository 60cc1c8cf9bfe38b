//! Control plane API client for the node agent.
//!
//! Publishes capacity announcements to the control plane over HTTP.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, error};

use crate::announcer::AnnouncementSink;
use crate::config::Config;
use crate::node::Announcement;

/// Control plane API client.
pub struct ControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
    node_id: String,
}

impl ControlPlaneClient {
    /// Create a new control plane client.
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.control_plane_url.trim_end_matches('/').to_string(),
            node_id: config.node_id.to_string(),
        })
    }

    fn announcement_url(&self) -> String {
        format!("{}/v1/nodes/{}/announcement", self.base_url, self.node_id)
    }

    /// Publish the node's current capacity.
    pub async fn send_announcement(&self, announcement: &Announcement) -> Result<()> {
        let url = self.announcement_url();
        debug!(
            url = %url,
            available_capacity = announcement.available_capacity,
            "Sending announcement"
        );

        let response = self.client.post(&url).json(announcement).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to send announcement");
            anyhow::bail!("Failed to send announcement: {} - {}", status, body);
        }

        Ok(())
    }
}

#[async_trait]
impl AnnouncementSink for ControlPlaneClient {
    async fn publish(&self, announcement: &Announcement) -> Result<()> {
        self.send_announcement(announcement).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announcement_url() {
        let mut config = Config::from_lookup(|_| None).unwrap();
        config.control_plane_url = "http://cp.internal:8080/".to_string();

        let client = ControlPlaneClient::new(&config).unwrap();
        assert_eq!(
            client.announcement_url(),
            format!("http://cp.internal:8080/v1/nodes/{}/announcement", config.node_id)
        );
    }
}
