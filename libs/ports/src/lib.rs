//! Port pool for service nodes.
//!
//! A node owns a fixed, statically configured set of port numbers and hands
//! one to every instance it provisions. This library provides:
//! - Parsing of configured port ranges (`9000-9099`, `9000,9002,9010-9012`)
//! - A thread-safe pool that allocates the lowest free port
//! - Release and reservation, used by cleanup and startup reconciliation
//!
//! The pool is derived state. It is not persisted; a node rebuilds it at
//! startup from its instance registry.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use thiserror::Error;

/// Port pool errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The configured range is empty or malformed.
    #[error("port range configuration error: {0}")]
    Config(String),

    /// Every configured port is in use.
    #[error("port pool exhausted ({size} ports configured)")]
    Exhausted { size: usize },

    /// The port is not part of the configured range.
    #[error("port {0} is outside the configured range")]
    InvalidRelease(u16),
}

// ============================================================================
// Range parsing
// ============================================================================

/// Parse a port range specification.
///
/// Accepts comma-separated entries, each either a single port (`9000`) or an
/// inclusive range (`9000-9099`). Whitespace around entries is ignored.
pub fn parse_port_range(spec: &str) -> Result<BTreeSet<u16>, PoolError> {
    let mut ports = BTreeSet::new();

    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once('-') {
            Some((start, end)) => {
                let start = parse_port(start.trim())?;
                let end = parse_port(end.trim())?;
                if start > end {
                    return Err(PoolError::Config(format!(
                        "range start {} is greater than end {}",
                        start, end
                    )));
                }
                ports.extend(start..=end);
            }
            None => {
                ports.insert(parse_port(entry)?);
            }
        }
    }

    if ports.is_empty() {
        return Err(PoolError::Config(format!(
            "no ports in range specification '{}'",
            spec
        )));
    }

    Ok(ports)
}

fn parse_port(s: &str) -> Result<u16, PoolError> {
    match s.parse::<u16>() {
        Ok(0) | Err(_) => Err(PoolError::Config(format!("invalid port '{}'", s))),
        Ok(port) => Ok(port),
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Thread-safe pool of available ports.
///
/// Every operation runs inside a single critical section, so concurrent
/// callers never observe an intermediate state and two concurrent
/// [`PortPool::allocate`] calls never return the same port.
#[derive(Debug)]
pub struct PortPool {
    /// The configured range. Immutable after construction.
    configured: BTreeSet<u16>,

    /// Ports not currently bound to an instance.
    available: Mutex<BTreeSet<u16>>,
}

impl PortPool {
    /// Create a pool with every port in `range` available.
    pub fn new(range: impl IntoIterator<Item = u16>) -> Result<Self, PoolError> {
        let configured: BTreeSet<u16> = range.into_iter().collect();
        if configured.is_empty() {
            return Err(PoolError::Config("port range is empty".to_string()));
        }

        Ok(Self {
            available: Mutex::new(configured.clone()),
            configured,
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        // A set of integers has no invariant a panicking holder could break.
        self.available.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove and return the lowest-numbered available port.
    pub fn allocate(&self) -> Result<u16, PoolError> {
        self.lock().pop_first().ok_or(PoolError::Exhausted {
            size: self.configured.len(),
        })
    }

    /// Return a port to the pool.
    ///
    /// Releasing a port that is already available is a no-op, so retried
    /// cleanup cannot corrupt the pool.
    pub fn release(&self, port: u16) -> Result<(), PoolError> {
        if !self.configured.contains(&port) {
            return Err(PoolError::InvalidRelease(port));
        }
        self.lock().insert(port);
        Ok(())
    }

    /// Mark a port unavailable without allocating it.
    ///
    /// Returns `Ok(true)` if the port was available and is now reserved, or
    /// `Ok(false)` if it was already taken.
    pub fn reserve(&self, port: u16) -> Result<bool, PoolError> {
        if !self.configured.contains(&port) {
            return Err(PoolError::InvalidRelease(port));
        }
        Ok(self.lock().remove(&port))
    }

    /// Sorted snapshot of the available ports.
    pub fn available(&self) -> Vec<u16> {
        self.lock().iter().copied().collect()
    }

    /// Number of available ports.
    pub fn available_count(&self) -> usize {
        self.lock().len()
    }

    /// Whether `port` is currently available.
    pub fn is_available(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    /// Whether `port` belongs to the configured range.
    pub fn contains(&self, port: u16) -> bool {
        self.configured.contains(&port)
    }

    /// Size of the configured range.
    pub fn size(&self) -> usize {
        self.configured.len()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_parse_port_range() {
        let ports = parse_port_range("9000-9003").unwrap();
        assert_eq!(ports.len(), 4);
        assert!(ports.contains(&9000));
        assert!(ports.contains(&9003));

        let ports = parse_port_range("9000, 9002,9010-9011").unwrap();
        assert_eq!(ports.into_iter().collect::<Vec<_>>(), vec![9000, 9002, 9010, 9011]);
    }

    #[test]
    fn test_parse_port_range_invalid() {
        assert!(parse_port_range("").is_err());
        assert!(parse_port_range(" , ").is_err());
        assert!(parse_port_range("9010-9000").is_err());
        assert!(parse_port_range("0").is_err());
        assert!(parse_port_range("70000").is_err());
        assert!(parse_port_range("abc-9000").is_err());
    }

    #[test]
    fn test_empty_range_is_config_error() {
        let err = PortPool::new(Vec::new()).unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[test]
    fn test_allocate_lowest_first() {
        let pool = PortPool::new([9002, 9000, 9001]).unwrap();
        assert_eq!(pool.allocate().unwrap(), 9000);
        assert_eq!(pool.allocate().unwrap(), 9001);
        assert_eq!(pool.allocate().unwrap(), 9002);
        assert_eq!(pool.allocate(), Err(PoolError::Exhausted { size: 3 }));
    }

    #[test]
    fn test_release_returns_port() {
        let pool = PortPool::new(9000..=9001).unwrap();
        let port = pool.allocate().unwrap();
        assert!(!pool.is_available(port));

        pool.release(port).unwrap();
        assert!(pool.is_available(port));
        assert_eq!(pool.allocate().unwrap(), port);
    }

    #[test]
    fn test_release_is_idempotent() {
        let pool = PortPool::new(9000..=9001).unwrap();
        let port = pool.allocate().unwrap();
        pool.release(port).unwrap();
        pool.release(port).unwrap();
        assert_eq!(pool.available_count(), 2);
    }

    #[test]
    fn test_release_outside_range() {
        let pool = PortPool::new(9000..=9001).unwrap();
        assert_eq!(pool.release(8080), Err(PoolError::InvalidRelease(8080)));
        assert_eq!(pool.available_count(), 2);
    }

    #[test]
    fn test_reserve() {
        let pool = PortPool::new(9000..=9002).unwrap();
        assert_eq!(pool.reserve(9000), Ok(true));
        assert_eq!(pool.reserve(9000), Ok(false));
        assert_eq!(pool.reserve(9999), Err(PoolError::InvalidRelease(9999)));
        assert_eq!(pool.available(), vec![9001, 9002]);
        assert_eq!(pool.allocate().unwrap(), 9001);
    }

    #[test]
    fn test_concurrent_allocate_never_duplicates() {
        let pool = Arc::new(PortPool::new(10000..=10199).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Ok(port) = pool.allocate() {
                        got.push(port);
                    }
                    got
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!(seen.insert(port), "port {} allocated twice", port);
            }
        }
        assert_eq!(seen.len(), 200);
        assert_eq!(pool.available_count(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate,
        Release(u16),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Allocate), (9000u16..9012).prop_map(Op::Release)]
    }

    proptest! {
        #[test]
        fn prop_in_use_ports_are_unique_and_bounded(ops in proptest::collection::vec(op(), 0..64)) {
            let pool = PortPool::new(9000..=9007).unwrap();
            let mut in_use = BTreeSet::new();

            for op in ops {
                match op {
                    Op::Allocate => {
                        if let Ok(port) = pool.allocate() {
                            prop_assert!(in_use.insert(port));
                        }
                    }
                    Op::Release(port) => {
                        if pool.release(port).is_ok() {
                            in_use.remove(&port);
                        }
                    }
                }

                prop_assert!(in_use.len() <= pool.size());
                prop_assert_eq!(in_use.len() + pool.available_count(), pool.size());
                for port in &in_use {
                    prop_assert!(!pool.is_available(*port));
                }
            }
        }
    }
}
