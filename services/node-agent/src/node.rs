//! The service-node contract and its wire types.
//!
//! The control plane talks to any service node through [`ServiceNode`]; the
//! transport that carries these calls lives outside this crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use wtp_id::InstanceName;

use crate::error::NodeError;

/// Connection metadata returned by provision and bind.
///
/// The control plane stores this as the instance (or binding) credential and
/// hands it back on unprovision and unbind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub hostname: String,
    pub host: String,
    pub port: u16,
    pub name: InstanceName,
}

impl ConnectionInfo {
    pub fn new(host: &str, port: u16, name: InstanceName) -> Self {
        Self {
            hostname: host.to_string(),
            host: host.to_string(),
            port,
            name,
        }
    }
}

/// A provision request from the control plane.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub plan: u32,

    /// Backend software version to record on the instance.
    #[serde(default)]
    pub version: Option<String>,

    /// Credential of a previous incarnation. Accepted for compatibility with
    /// the control plane's request shape; names are always node-generated.
    #[serde(default)]
    pub credential: Option<ConnectionInfo>,
}

impl ProvisionRequest {
    pub fn plan(plan: u32) -> Self {
        Self {
            plan,
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Capacity advertised to the control plane for placement decisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub available_capacity: u32,
    pub capacity_unit: String,
}

/// Lifecycle operations every service node exposes to the control plane.
#[async_trait]
pub trait ServiceNode: Send + Sync {
    /// Create an instance and return how to reach it.
    async fn provision(&self, request: ProvisionRequest) -> Result<ConnectionInfo, NodeError>;

    /// Destroy an instance. Unknown names succeed.
    async fn unprovision(
        &self,
        name: InstanceName,
        bindings: &[ConnectionInfo],
    ) -> Result<(), NodeError>;

    /// Issue connection metadata for an existing instance.
    async fn bind(
        &self,
        name: InstanceName,
        bind_opts: &serde_json::Value,
        credential: Option<&ConnectionInfo>,
    ) -> Result<ConnectionInfo, NodeError>;

    /// Revoke a binding.
    async fn unbind(&self, credential: &ConnectionInfo) -> Result<(), NodeError>;

    /// Current capacity. Never blocks beyond a short critical section.
    fn announcement(&self) -> Announcement;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_info_shape() {
        let name = InstanceName::new();
        let info = ConnectionInfo::new("10.0.0.5", 9001, name);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["hostname"], "10.0.0.5");
        assert_eq!(json["host"], "10.0.0.5");
        assert_eq!(json["port"], 9001);
        assert_eq!(json["name"], name.to_string());
    }

    #[test]
    fn test_provision_request_defaults() {
        let request: ProvisionRequest = serde_json::from_str(r#"{"plan": 1}"#).unwrap();
        assert_eq!(request.plan, 1);
        assert!(request.version.is_none());
        assert!(request.credential.is_none());
    }

    #[test]
    fn test_announcement_serialization() {
        let announcement = Announcement {
            available_capacity: 3,
            capacity_unit: "instance".to_string(),
        };
        let json = serde_json::to_string(&announcement).unwrap();
        assert!(json.contains("\"available_capacity\":3"));
        assert!(json.contains("\"capacity_unit\":\"instance\""));
    }
}
