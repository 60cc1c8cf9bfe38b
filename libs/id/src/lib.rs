//! # wtp-id
//!
//! Typed identifiers for wtp service nodes.
//!
//! Instance names are the primary key of a node's provisioned-instance
//! registry and are handed to the control plane verbatim, so they keep the
//! plain hyphenated UUID form the fleet has always used:
//!
//! - `3f2b8c1e-9d4a-4c7e-8a51-0b6f2d9e7c13`
//!
//! Wrapping them in distinct types keeps an instance name from being passed
//! where a node id is expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export uuid for consumers that need raw UUID operations
pub use uuid::Uuid;
