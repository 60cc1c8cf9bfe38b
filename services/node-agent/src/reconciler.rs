//! Startup reconciliation.
//!
//! The port pool and capacity counter are not persisted. Before the node
//! accepts requests, the reconciler rebuilds them from the registry:
//! - every recorded instance's port is reserved in the pool
//! - remaining capacity is recomputed as `max - instances`
//!
//! Inconsistent records (a port outside the configured range, two records
//! claiming one port, or a row that cannot be decoded) do not stop startup.
//! They are logged and counted, every row counts against capacity, and
//! contested ports are never handed out again.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{info, warn};
use wtp_id::InstanceName;
use wtp_ports::PortPool;

use crate::capacity::CapacityTracker;
use crate::registry::{CorruptRecord, Snapshot};

/// A registry record that disagrees with the configured port pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsistencyViolation {
    /// The record's port is not part of the configured range.
    PortOutOfRange { name: InstanceName, port: u16 },

    /// Another record already claimed this port.
    DuplicatePort { name: InstanceName, port: u16 },

    /// The row does not decode. It can never be unprovisioned, so a port it
    /// holds stays reserved.
    CorruptRecord { name: String, port: i64 },
}

/// Outcome of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Records found in the registry.
    pub instances: usize,

    /// Ports reserved in the pool.
    pub reserved: usize,

    /// Capacity left after accounting for inherited instances.
    pub remaining_capacity: u32,

    pub violations: Vec<ConsistencyViolation>,
}

impl ReconcileReport {
    /// Ports claimed by more than one record or by an undecodable row.
    /// These must stay out of the pool for as long as the node runs.
    pub fn contested_ports(&self) -> BTreeSet<u16> {
        self.violations
            .iter()
            .filter_map(|v| match v {
                ConsistencyViolation::DuplicatePort { port, .. } => Some(*port),
                ConsistencyViolation::CorruptRecord { port, .. } => u16::try_from(*port).ok(),
                ConsistencyViolation::PortOutOfRange { .. } => None,
            })
            .collect()
    }
}

/// Prime `pool` and `capacity` from a registry snapshot.
pub fn reconcile(
    snapshot: &Snapshot,
    pool: &PortPool,
    capacity: &CapacityTracker,
) -> ReconcileReport {
    let mut report = ReconcileReport {
        instances: snapshot.len(),
        ..Default::default()
    };

    for record in &snapshot.records {
        match pool.reserve(record.port) {
            Ok(true) => report.reserved += 1,
            Ok(false) => {
                warn!(
                    name = %record.name,
                    port = record.port,
                    "Consistency violation: port claimed by more than one instance"
                );
                report.violations.push(ConsistencyViolation::DuplicatePort {
                    name: record.name,
                    port: record.port,
                });
            }
            Err(e) => {
                warn!(
                    name = %record.name,
                    port = record.port,
                    error = %e,
                    "Consistency violation: instance port outside configured range"
                );
                report.violations.push(ConsistencyViolation::PortOutOfRange {
                    name: record.name,
                    port: record.port,
                });
            }
        }
    }

    for corrupt in &snapshot.corrupt {
        reserve_corrupt(corrupt, pool, &mut report);
    }

    report.remaining_capacity = capacity.reseed(snapshot.len());

    info!(
        instances = report.instances,
        reserved = report.reserved,
        free_ports = pool.available_count(),
        remaining_capacity = report.remaining_capacity,
        violations = report.violations.len(),
        "Reconciled allocator state from registry"
    );

    report
}

fn reserve_corrupt(corrupt: &CorruptRecord, pool: &PortPool, report: &mut ReconcileReport) {
    warn!(
        name = %corrupt.name,
        port = corrupt.port,
        reason = %corrupt.reason,
        "Consistency violation: undecodable registry row"
    );

    let in_range = u16::try_from(corrupt.port)
        .ok()
        .filter(|port| pool.contains(*port));
    if let Some(port) = in_range {
        if pool.reserve(port) == Ok(true) {
            report.reserved += 1;
        }
    }

    report.violations.push(ConsistencyViolation::CorruptRecord {
        name: corrupt.name.clone(),
        port: corrupt.port,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::registry::ProvisionedInstance;

    fn record(port: u16) -> ProvisionedInstance {
        ProvisionedInstance::new(InstanceName::new(), port, 1, None)
    }

    fn snapshot(records: Vec<ProvisionedInstance>) -> Snapshot {
        Snapshot {
            records,
            corrupt: Vec::new(),
        }
    }

    #[test]
    fn test_reconcile_empty_registry() {
        let pool = PortPool::new(9000..=9004).unwrap();
        let capacity = CapacityTracker::new(5);

        let report = reconcile(&Snapshot::default(), &pool, &capacity);
        assert_eq!(
            report,
            ReconcileReport {
                remaining_capacity: 5,
                ..Default::default()
            }
        );
        assert_eq!(pool.available_count(), 5);
    }

    #[test]
    fn test_reconcile_reserves_recorded_ports() {
        let pool = PortPool::new(9000..=9009).unwrap();
        let capacity = CapacityTracker::new(10);
        let records = vec![record(9001), record(9004), record(9009)];

        let report = reconcile(&snapshot(records.clone()), &pool, &capacity);
        assert_eq!(report.reserved, 3);
        assert!(report.violations.is_empty());
        assert_eq!(pool.available_count(), 7);
        for r in &records {
            assert!(!pool.is_available(r.port));
        }
        assert_eq!(capacity.remaining(), 7);
    }

    #[test]
    fn test_reconcile_reports_violations() {
        let pool = PortPool::new(9000..=9003).unwrap();
        let capacity = CapacityTracker::new(4);
        let first = record(9001);
        let dup = record(9001);
        let outside = record(8080);

        let report = reconcile(
            &snapshot(vec![first, dup.clone(), outside.clone()]),
            &pool,
            &capacity,
        );

        assert_eq!(report.instances, 3);
        assert_eq!(report.reserved, 1);
        assert_eq!(
            report.violations,
            vec![
                ConsistencyViolation::DuplicatePort {
                    name: dup.name,
                    port: 9001
                },
                ConsistencyViolation::PortOutOfRange {
                    name: outside.name,
                    port: 8080
                },
            ]
        );
        assert_eq!(report.contested_ports(), BTreeSet::from([9001]));
        assert_eq!(pool.available(), vec![9000, 9002, 9003]);
        // Every record counts against capacity, consistent or not.
        assert_eq!(capacity.remaining(), 1);
    }

    #[test]
    fn test_reconcile_corrupt_rows() {
        let pool = PortPool::new(9000..=9003).unwrap();
        let capacity = CapacityTracker::new(4);
        let snapshot = Snapshot {
            records: vec![record(9000)],
            corrupt: vec![
                CorruptRecord {
                    name: "bogus".to_string(),
                    port: 9002,
                    reason: "invalid instance name: 'bogus'".to_string(),
                },
                CorruptRecord {
                    name: InstanceName::new().to_string(),
                    port: 70000,
                    reason: "invalid port 70000".to_string(),
                },
            ],
        };

        let report = reconcile(&snapshot, &pool, &capacity);

        assert_eq!(report.instances, 3);
        assert_eq!(report.reserved, 2);
        assert_eq!(report.violations.len(), 2);
        assert_eq!(report.contested_ports(), BTreeSet::from([9002]));
        assert_eq!(pool.available(), vec![9001, 9003]);
        assert_eq!(capacity.remaining(), 1);
    }
}
