//! Node error taxonomy.
//!
//! Every failure the node returns to the control plane carries a
//! [`Disposition`] telling the caller whether to route elsewhere, retry here,
//! or page an operator, plus the node's numeric error code.

use thiserror::Error;
use wtp_id::InstanceName;
use wtp_ports::PoolError;

use crate::registry::RegistryError;

/// What the caller should do about a failed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// This node is out of resources; place the work on another node.
    TryAnotherNode,
    /// Transient failure on this node; the same request may succeed later.
    RetrySameNode,
    /// Broken configuration or state that needs a human.
    OperatorIntervention,
    /// The request itself is invalid.
    Rejected,
}

/// Errors returned by node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Invalid node configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid plan {0}")]
    InvalidPlan(u32),

    #[error("node capacity exhausted")]
    CapacityExhausted,

    #[error("no free ports: {0}")]
    PortsExhausted(#[source] PoolError),

    #[error("failed to persist instance {name}: {source}")]
    PersistFailed {
        name: InstanceName,
        #[source]
        source: RegistryError,
    },

    #[error("instance name {0} is already registered")]
    DuplicateName(InstanceName),

    #[error("port {0} is already registered to another instance")]
    DuplicatePort(u16),

    /// Local store failure outside of provisioning.
    #[error("local db error: {0}")]
    Store(#[source] RegistryError),

    #[error("instance {0} not found")]
    NotFound(InstanceName),

    #[error("backend failed for instance {name}: {source}")]
    BackendFailed {
        name: InstanceName,
        #[source]
        source: anyhow::Error,
    },
}

impl NodeError {
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::CapacityExhausted | Self::PortsExhausted(_) => Disposition::TryAnotherNode,
            Self::PersistFailed { .. } | Self::Store(_) | Self::BackendFailed { .. } => {
                Disposition::RetrySameNode
            }
            Self::Config(_) | Self::DuplicateName(_) | Self::DuplicatePort(_) => {
                Disposition::OperatorIntervention
            }
            Self::InvalidPlan(_) | Self::NotFound(_) => Disposition::Rejected,
        }
    }

    /// Numeric error code reported to the control plane.
    pub fn code(&self) -> u32 {
        match self {
            Self::PersistFailed { source, .. } | Self::Store(source) if source.is_disk_full() => {
                31201
            }
            Self::NotFound(_) => 31202,
            Self::PersistFailed { .. } | Self::Store(_) => 31204,
            Self::InvalidPlan(_) => 31205,
            Self::Config(_) => 31206,
            Self::CapacityExhausted => 31208,
            Self::PortsExhausted(_) => 31209,
            Self::DuplicateName(_) | Self::DuplicatePort(_) => 31210,
            Self::BackendFailed { .. } => 31211,
        }
    }

    /// Whether the failure means this node cannot take new work right now.
    pub fn is_exhaustion(&self) -> bool {
        self.disposition() == Disposition::TryAnotherNode
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_dispositions() {
        assert_eq!(
            NodeError::CapacityExhausted.disposition(),
            Disposition::TryAnotherNode
        );
        assert_eq!(
            NodeError::PortsExhausted(PoolError::Exhausted { size: 2 }).disposition(),
            Disposition::TryAnotherNode
        );
        assert_eq!(
            NodeError::PersistFailed {
                name: InstanceName::new(),
                source: RegistryError::Timeout {
                    op: "insert",
                    after: Duration::from_secs(5),
                },
            }
            .disposition(),
            Disposition::RetrySameNode
        );
        assert_eq!(
            NodeError::DuplicatePort(9000).disposition(),
            Disposition::OperatorIntervention
        );
        assert_eq!(
            NodeError::Config("empty port range".into()).disposition(),
            Disposition::OperatorIntervention
        );
        assert_eq!(NodeError::InvalidPlan(7).disposition(), Disposition::Rejected);
    }

    #[test]
    fn test_codes() {
        assert_eq!(NodeError::InvalidPlan(2).code(), 31205);
        assert_eq!(NodeError::NotFound(InstanceName::new()).code(), 31202);
        assert_eq!(
            NodeError::Store(RegistryError::Corrupt("row".into())).code(),
            31204
        );
        assert_eq!(NodeError::CapacityExhausted.code(), 31208);
    }

    #[test]
    fn test_disk_full_code() {
        let full = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
            None,
        );
        let err = NodeError::PersistFailed {
            name: InstanceName::new(),
            source: RegistryError::Store(full),
        };
        assert_eq!(err.code(), 31201);
    }

    #[test]
    fn test_is_exhaustion() {
        assert!(NodeError::CapacityExhausted.is_exhaustion());
        assert!(!NodeError::InvalidPlan(3).is_exhaustion());
    }
}
