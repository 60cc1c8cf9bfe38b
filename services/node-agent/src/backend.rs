//! Backend process interface and mock implementation.
//!
//! The backend interface abstracts the workload process behind an instance:
//! - Starting the service process for a provisioned instance
//! - Stopping it on unprovision
//!
//! Process supervision itself lives outside the node core. A mock
//! implementation is provided for testing and development.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::registry::ProvisionedInstance;

/// Backend process interface.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Start the service process for an instance and return its pid.
    async fn start(&self, instance: &ProvisionedInstance) -> Result<u32>;

    /// Stop the service process for an instance.
    async fn stop(&self, instance: &ProvisionedInstance) -> Result<()>;
}

/// Mock backend for testing and development.
pub struct MockBackend {
    /// Counter for generating pids.
    next_pid: AtomicU32,

    /// Whether starts should "fail".
    fail_starts: bool,

    /// Whether stops should "fail".
    fail_stops: bool,

    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        Self::with_failures(false, false)
    }

    /// Create a mock backend that fails all starts.
    pub fn failing_starts() -> Self {
        Self::with_failures(true, false)
    }

    /// Create a mock backend that fails all stops.
    pub fn failing_stops() -> Self {
        Self::with_failures(false, true)
    }

    fn with_failures(fail_starts: bool, fail_stops: bool) -> Self {
        Self {
            next_pid: AtomicU32::new(10_000),
            fail_starts,
            fail_stops,
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        }
    }

    /// Number of start calls seen.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of stop calls seen.
    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn start(&self, instance: &ProvisionedInstance) -> Result<u32> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_starts {
            anyhow::bail!("Mock backend configured to fail starts");
        }

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        info!(
            name = %instance.name,
            port = instance.port,
            pid,
            "[MOCK] Started backend"
        );
        Ok(pid)
    }

    async fn stop(&self, instance: &ProvisionedInstance) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stops {
            anyhow::bail!("Mock backend configured to fail stops");
        }

        debug!(
            name = %instance.name,
            pid = ?instance.pid,
            "[MOCK] Stopped backend"
        );
        Ok(())
    }
}
