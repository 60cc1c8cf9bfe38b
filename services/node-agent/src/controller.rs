//! Node controller.
//!
//! The controller owns the node's resources and runs the lifecycle workflows:
//! - provision: capacity, then port, then registry row, then backend start
//! - unprovision: backend stop, then registry row, then port and capacity
//! - bind / unbind: connection metadata for existing instances
//!
//! The pool, counter and registry are each atomic on their own. There is no
//! transaction across them; a failed step undoes the steps before it, in
//! reverse order, before the error is returned.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use wtp_id::InstanceName;
use wtp_ports::PortPool;

use crate::backend::Backend;
use crate::capacity::CapacityTracker;
use crate::config::Config;
use crate::error::NodeError;
use crate::health::StoreHealth;
use crate::node::{Announcement, ConnectionInfo, ProvisionRequest, ServiceNode};
use crate::reconciler::{self, ReconcileReport};
use crate::registry::{InstanceRegistry, ProvisionedInstance, RegistryError};

/// Point-in-time node statistics.
#[derive(Debug, Clone, Serialize)]
pub struct NodeVarz {
    pub provisioned_instances_num: usize,
    pub provisioned_instances: Vec<InstanceName>,
    pub max_capacity: u32,
    pub available_capacity: u32,
    pub free_ports: usize,
    pub consistency_violations: usize,
    pub healthy: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn persist_error(name: InstanceName, err: RegistryError) -> NodeError {
    match err {
        RegistryError::DuplicateName(name) => {
            error!(name = %name, "Generated instance name already registered");
            NodeError::DuplicateName(name)
        }
        RegistryError::DuplicatePort(port) => {
            error!(port, "Allocated port already registered to another instance");
            NodeError::DuplicatePort(port)
        }
        source => {
            error!(name = %name, error = %source, "Failed to persist instance");
            NodeError::PersistFailed { name, source }
        }
    }
}

/// In-memory allocation state. Shared with cleanup that finishes after the
/// request that started it has returned.
struct Allocations {
    pool: PortPool,
    capacity: CapacityTracker,
    capacity_unit: String,

    /// Ports claimed by several rows at startup. Kept out of the pool.
    contested_ports: Mutex<BTreeSet<u16>>,

    announcements: watch::Sender<Announcement>,
}

impl Allocations {
    fn announcement(&self) -> Announcement {
        Announcement {
            available_capacity: self.capacity.remaining(),
            capacity_unit: self.capacity_unit.clone(),
        }
    }

    fn publish(&self) {
        // Read under the channel lock so the last publisher always sends the
        // latest capacity.
        self.announcements.send_if_modified(|announced| {
            let current = self.announcement();
            if *announced == current {
                return false;
            }
            *announced = current;
            true
        });
    }

    fn release_port(&self, port: u16) {
        if lock(&self.contested_ports).contains(&port) {
            warn!(port, "Port is contested by several records, keeping it out of the pool");
            return;
        }
        if let Err(e) = self.pool.release(port) {
            error!(port, error = %e, "Failed to release port");
        }
    }

    /// Give back the port and capacity unit held by a removed instance.
    fn reclaim(&self, port: u16) {
        self.release_port(port);
        self.capacity.increment();
    }
}

/// Orchestrates provisioning over the pool, registry and capacity counter.
pub struct NodeController {
    host: String,
    plans: BTreeSet<u32>,

    allocations: Arc<Allocations>,
    registry: InstanceRegistry,
    backend: Arc<dyn Backend>,
    health: StoreHealth,

    last_reconcile: Mutex<Option<ReconcileReport>>,
}

impl NodeController {
    /// Create a controller. Call [`NodeController::start`] before serving.
    pub fn new(
        config: &Config,
        registry: InstanceRegistry,
        backend: Arc<dyn Backend>,
    ) -> Result<Self, NodeError> {
        config.validate()?;

        let pool = PortPool::new(config.port_range.iter().copied())
            .map_err(|e| NodeError::Config(e.to_string()))?;
        let capacity = CapacityTracker::new(config.max_capacity);
        let (announcements, _) = watch::channel(Announcement {
            available_capacity: capacity.remaining(),
            capacity_unit: config.capacity_unit.clone(),
        });

        Ok(Self {
            host: config.host.clone(),
            plans: config.plans.clone(),
            allocations: Arc::new(Allocations {
                pool,
                capacity,
                capacity_unit: config.capacity_unit.clone(),
                contested_ports: Mutex::new(BTreeSet::new()),
                announcements,
            }),
            registry,
            backend,
            health: StoreHealth::new(config.unhealthy_after),
            last_reconcile: Mutex::new(None),
        })
    }

    /// Rebuild allocator state from the registry and restart recorded
    /// instances.
    ///
    /// An unreadable registry is fatal. Inconsistent or undecodable rows are
    /// not; they are returned in the report.
    pub async fn start(&self) -> Result<ReconcileReport, NodeError> {
        info!("Starting node controller");

        let snapshot = self.registry.scan().await;
        self.health.observe(&snapshot);
        let snapshot = snapshot.map_err(|e| {
            error!(error = %e, "Failed to load instance registry");
            NodeError::Store(e)
        })?;

        let allocations = &self.allocations;
        let report = reconciler::reconcile(&snapshot, &allocations.pool, &allocations.capacity);
        *lock(&allocations.contested_ports) = report.contested_ports();
        *lock(&self.last_reconcile) = Some(report.clone());

        self.start_provisioned_instances(&snapshot.records).await;
        allocations.publish();

        Ok(report)
    }

    async fn start_provisioned_instances(&self, records: &[ProvisionedInstance]) {
        for record in records {
            match self.backend.start(record).await {
                Ok(pid) => self.record_pid(record.name, pid).await,
                Err(e) => warn!(
                    name = %record.name,
                    port = record.port,
                    error = %e,
                    "Failed to restart instance backend"
                ),
            }
        }
    }

    async fn record_pid(&self, name: InstanceName, pid: u32) {
        let result = self.registry.set_pid(name, Some(pid)).await;
        self.health.observe(&result);
        if let Err(e) = result {
            warn!(name = %name, pid, error = %e, "Failed to record backend pid");
        }
    }

    /// Delete a row, reclaiming `port` and a capacity unit when it is gone.
    ///
    /// Returns whether the row was removed in time. If the delete times out
    /// it keeps running, and the reclaim happens when it commits.
    async fn delete_and_reclaim(
        &self,
        name: InstanceName,
        port: u16,
    ) -> Result<bool, RegistryError> {
        let late = {
            let allocations = Arc::clone(&self.allocations);
            move || {
                warn!(
                    name = %name,
                    port,
                    "Timed-out delete completed, reclaiming port and capacity"
                );
                allocations.reclaim(port);
                allocations.publish();
            }
        };

        let removed = self.registry.delete_and_then(name, late).await;
        self.health.observe(&removed);
        if let Ok(true) = removed {
            self.allocations.reclaim(port);
        }
        removed
    }

    /// Subscribe to capacity changes.
    pub fn subscribe_announcements(&self) -> watch::Receiver<Announcement> {
        self.allocations.announcements.subscribe()
    }

    pub fn pool(&self) -> &PortPool {
        &self.allocations.pool
    }

    pub fn capacity(&self) -> &CapacityTracker {
        &self.allocations.capacity
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// Report from the last [`NodeController::start`], if any.
    pub fn reconcile_report(&self) -> Option<ReconcileReport> {
        lock(&self.last_reconcile).clone()
    }

    /// Names of every registered instance.
    pub async fn all_instances_list(&self) -> Result<Vec<InstanceName>, NodeError> {
        let records = self.registry.list_all().await;
        self.health.observe(&records);
        Ok(records
            .map_err(NodeError::Store)?
            .into_iter()
            .map(|r| r.name)
            .collect())
    }

    /// Bindings are not tracked by this node.
    pub fn all_bindings_list(&self) -> Vec<ConnectionInfo> {
        Vec::new()
    }

    pub async fn varz(&self) -> Result<NodeVarz, NodeError> {
        let provisioned_instances = self.all_instances_list().await?;
        let consistency_violations = lock(&self.last_reconcile)
            .as_ref()
            .map_or(0, |r| r.violations.len());

        Ok(NodeVarz {
            provisioned_instances_num: provisioned_instances.len(),
            provisioned_instances,
            max_capacity: self.capacity().max(),
            available_capacity: self.capacity().remaining(),
            free_ports: self.pool().available_count(),
            consistency_violations,
            healthy: self.health.is_healthy(),
        })
    }
}

#[async_trait]
impl ServiceNode for NodeController {
    async fn provision(&self, request: ProvisionRequest) -> Result<ConnectionInfo, NodeError> {
        let ProvisionRequest { plan, version, .. } = request;
        info!(plan, "Provision request");

        if !self.plans.contains(&plan) {
            warn!(plan, "Rejecting provision for unknown plan");
            return Err(NodeError::InvalidPlan(plan));
        }

        let allocations = &self.allocations;
        if !allocations.capacity.try_decrement() {
            warn!(plan, "Rejecting provision, node capacity exhausted");
            return Err(NodeError::CapacityExhausted);
        }

        let name = InstanceName::new();

        let port = match allocations.pool.allocate() {
            Ok(port) => port,
            Err(e) => {
                allocations.capacity.increment();
                warn!(plan, error = %e, "Rejecting provision, no free ports");
                return Err(NodeError::PortsExhausted(e));
            }
        };

        let record = ProvisionedInstance::new(name, port, plan, version);

        let inserted = self.registry.insert(record.clone()).await;
        self.health.observe(&inserted);
        if let Err(e) = inserted {
            allocations.reclaim(port);
            return Err(persist_error(name, e));
        }

        match self.backend.start(&record).await {
            Ok(pid) => self.record_pid(name, pid).await,
            Err(e) => {
                error!(name = %name, port, error = %e, "Backend failed to start, rolling back");

                // A false result means a concurrent unprovision removed the
                // row and reclaimed the allocation itself.
                if let Err(del) = self.delete_and_reclaim(name, port).await {
                    error!(
                        name = %name,
                        port,
                        error = %del,
                        "Failed to remove instance after backend failure, keeping its port reserved"
                    );
                }
                return Err(NodeError::BackendFailed { name, source: e });
            }
        }

        allocations.publish();

        let response = ConnectionInfo::new(&self.host, port, name);
        info!(name = %name, port, plan, "Provisioned instance");
        debug!(response = ?response, "Provision response");
        Ok(response)
    }

    async fn unprovision(
        &self,
        name: InstanceName,
        bindings: &[ConnectionInfo],
    ) -> Result<(), NodeError> {
        info!(name = %name, bindings = bindings.len(), "Unprovision request");

        let fetched = self.registry.get(name).await;
        self.health.observe(&fetched);
        let record = match fetched {
            Ok(record) => record,
            Err(RegistryError::NotFound(_)) => {
                debug!(name = %name, "Instance already removed");
                return Ok(());
            }
            Err(e) => return Err(NodeError::Store(e)),
        };

        if let Err(e) = self.backend.stop(&record).await {
            warn!(
                name = %name,
                error = %e,
                "Backend teardown failed, reclaiming resources anyway"
            );
        }

        let removed = self.delete_and_reclaim(name, record.port).await;
        if !removed.map_err(NodeError::Store)? {
            // A concurrent unprovision got there first and owns the cleanup.
            debug!(name = %name, "Instance removed concurrently");
            return Ok(());
        }
        self.allocations.publish();

        info!(name = %name, port = record.port, "Unprovisioned instance");
        Ok(())
    }

    async fn bind(
        &self,
        name: InstanceName,
        bind_opts: &serde_json::Value,
        _credential: Option<&ConnectionInfo>,
    ) -> Result<ConnectionInfo, NodeError> {
        debug!(name = %name, bind_opts = %bind_opts, "Bind request");

        let fetched = self.registry.get(name).await;
        self.health.observe(&fetched);
        let record = fetched.map_err(|e| match e {
            RegistryError::NotFound(name) => NodeError::NotFound(name),
            e => NodeError::Store(e),
        })?;

        let response = ConnectionInfo::new(&self.host, record.port, record.name);
        debug!(response = ?response, "Bind response");
        Ok(response)
    }

    async fn unbind(&self, credential: &ConnectionInfo) -> Result<(), NodeError> {
        debug!(name = %credential.name, "Unbind request");
        Ok(())
    }

    fn announcement(&self) -> Announcement {
        self.allocations.announcement()
    }
}
