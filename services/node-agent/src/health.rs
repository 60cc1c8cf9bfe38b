//! Store health tracking.
//!
//! One failed write is a retryable request error. A run of them means the
//! local database is degraded, and the node reports itself unhealthy until a
//! store operation succeeds again.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tracing::{error, info};

use crate::registry::RegistryError;

#[derive(Debug)]
pub struct StoreHealth {
    /// Consecutive store failures that mark the node unhealthy.
    threshold: u32,
    consecutive_failures: AtomicU32,
    unhealthy: AtomicBool,
}

impl StoreHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
            unhealthy: AtomicBool::new(false),
        }
    }

    /// Observe the outcome of a registry call.
    ///
    /// Lookup and uniqueness outcomes (`NotFound`, duplicates) say nothing
    /// about the store and are ignored.
    pub fn observe<T>(&self, result: &Result<T, RegistryError>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) if e.is_store_failure() => self.record_failure(e),
            Err(_) => {}
        }
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.unhealthy.swap(false, Ordering::SeqCst) {
            info!("Local store recovered, node healthy again");
        }
    }

    pub fn record_failure(&self, err: &RegistryError) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.threshold && !self.unhealthy.swap(true, Ordering::SeqCst) {
            error!(
                error = %err,
                consecutive_failures = failures,
                "Local store failing repeatedly, marking node unhealthy"
            );
        }
    }

    pub fn is_healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::SeqCst)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }
}
