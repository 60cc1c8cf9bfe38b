//! wtp Node Agent Library
//!
//! The node agent runs on each service host and owns the host-local
//! resources of the wtp service: a pool of TCP ports, a durable registry of
//! provisioned instances and a capacity counter. It answers provision,
//! unprovision, bind and unbind requests and announces its remaining
//! capacity to the control plane.
//!
//! ## Architecture
//!
//! ```text
//! NodeController
//! ├── PortPool          (wtp-ports, in memory)
//! ├── CapacityTracker   (in memory)
//! ├── InstanceRegistry  (SQLite, source of truth)
//! └── Backend           (service process start/stop)
//! ```
//!
//! The in-memory pieces are rebuilt from the registry by the reconciler
//! before the node serves requests.
//!
//! ## Modules
//!
//! - `controller`: Provision/unprovision/bind/unbind workflows
//! - `registry`: Durable instance records
//! - `reconciler`: Startup rebuild of pool and capacity
//! - `announcer`: Capacity announcement loop

pub mod announcer;
pub mod backend;
pub mod capacity;
pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod health;
pub mod node;
pub mod reconciler;
pub mod registry;

// Re-export commonly used types
pub use backend::{Backend, MockBackend};
pub use client::ControlPlaneClient;
pub use config::Config;
pub use controller::{NodeController, NodeVarz};
pub use error::{Disposition, NodeError};
pub use node::{Announcement, ConnectionInfo, ProvisionRequest, ServiceNode};
pub use registry::{InstanceRegistry, ProvisionedInstance, RegistryError};
