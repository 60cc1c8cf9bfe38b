//! Configuration for the node agent.

use std::collections::BTreeSet;
use std::time::Duration;

use wtp_id::NodeId;
use wtp_ports::parse_port_range;

use crate::error::NodeError;

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unique identifier for this node.
    pub node_id: NodeId,

    /// Host returned to clients in connection metadata.
    pub host: String,

    /// Ports this node may hand to instances.
    pub port_range: BTreeSet<u16>,

    /// Maximum number of capacity units.
    pub max_capacity: u32,

    /// Unit name reported in announcements.
    pub capacity_unit: String,

    /// Plans this node accepts.
    pub plans: BTreeSet<u32>,

    /// Path of the local SQLite registry (`:memory:` for ephemeral).
    pub local_db: String,

    /// Bound on each registry call.
    pub store_timeout: Duration,

    /// Announcement interval in seconds.
    pub announce_interval_secs: u64,

    /// Consecutive store failures before the node reports itself unhealthy.
    pub unhealthy_after: u32,

    /// Control plane API URL.
    pub control_plane_url: String,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, NodeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, NodeError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Node ID can be provided or auto-generated
        let node_id = match lookup("WTP_NODE_ID") {
            Some(s) => s
                .parse()
                .map_err(|e| NodeError::Config(format!("WTP_NODE_ID: {}", e)))?,
            None => NodeId::new(),
        };

        let host = lookup("WTP_HOST").unwrap_or_else(|| "127.0.0.1".to_string());

        let port_range = parse_port_range(
            &lookup("WTP_PORT_RANGE").unwrap_or_else(|| "9000-9099".to_string()),
        )
        .map_err(|e| NodeError::Config(format!("WTP_PORT_RANGE: {}", e)))?;

        let max_capacity = parse_or(&lookup, "WTP_CAPACITY", 100)?;

        let capacity_unit =
            lookup("WTP_CAPACITY_UNIT").unwrap_or_else(|| "instance".to_string());

        let plans = parse_plans(&lookup("WTP_PLANS").unwrap_or_else(|| "1".to_string()))?;

        let local_db = lookup("WTP_LOCAL_DB")
            .unwrap_or_else(|| "/var/vcap/services/wtp/wtp_node.db".to_string());

        let store_timeout =
            Duration::from_millis(parse_or(&lookup, "WTP_STORE_TIMEOUT_MS", 5000)?);

        let announce_interval_secs = parse_or(&lookup, "WTP_ANNOUNCE_INTERVAL", 30)?;

        let unhealthy_after = parse_or(&lookup, "WTP_UNHEALTHY_AFTER", 3)?;

        let control_plane_url = lookup("WTP_CONTROL_PLANE_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8080".to_string());

        let log_level = lookup("WTP_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        let config = Self {
            node_id,
            host,
            port_range,
            max_capacity,
            capacity_unit,
            plans,
            local_db,
            store_timeout,
            announce_interval_secs,
            unhealthy_after,
            control_plane_url,
            log_level,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the node relies on at startup.
    pub fn validate(&self) -> Result<(), NodeError> {
        if self.port_range.is_empty() {
            return Err(NodeError::Config("port range is empty".to_string()));
        }
        if self.plans.is_empty() {
            return Err(NodeError::Config("plan set is empty".to_string()));
        }
        if self.max_capacity == 0 {
            return Err(NodeError::Config("capacity must be positive".to_string()));
        }
        if self.store_timeout.is_zero() {
            return Err(NodeError::Config("store timeout must be positive".to_string()));
        }
        if self.announce_interval_secs == 0 {
            return Err(NodeError::Config(
                "announce interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, NodeError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(s) => s
            .trim()
            .parse()
            .map_err(|e| NodeError::Config(format!("{}: {}", key, e))),
        None => Ok(default),
    }
}

fn parse_plans(spec: &str) -> Result<BTreeSet<u32>, NodeError> {
    spec.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            p.parse()
                .map_err(|_| NodeError::Config(format!("WTP_PLANS: invalid plan '{}'", p)))
        })
        .collect()
}
