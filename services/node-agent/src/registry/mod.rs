//! Durable registry of provisioned instances.
//!
//! The registry wraps a synchronous [`InstanceStore`] and exposes it to the
//! async controller:
//! - every call runs on the blocking pool, one at a time
//! - every call is bounded by a timeout, reported as [`RegistryError::Timeout`]
//! - an insert that times out is abandoned and can never leave a row behind
//! - a delete that times out keeps running, and its caller can be told when
//!   it removes the row after all

mod store;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, warn};
use wtp_id::InstanceName;

pub use store::{
    CorruptRecord, InstanceStore, ProvisionedInstance, RegistryError, Snapshot, SqliteStore,
};

/// Default bound on a single registry call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(5);

type SharedStore = Arc<Mutex<Box<dyn InstanceStore>>>;
type StoreTask<T> = JoinHandle<Result<T, RegistryError>>;

fn lock_store(store: &SharedStore) -> MutexGuard<'_, Box<dyn InstanceStore>> {
    // SQLite rolls back an unfinished transaction on drop, so a poisoned
    // guard still points at a consistent store.
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Async, timeout-bounded front for an [`InstanceStore`].
pub struct InstanceRegistry {
    store: SharedStore,
    timeout: Duration,
}

impl InstanceRegistry {
    /// Wrap an existing store.
    pub fn new(store: impl InstanceStore + 'static, timeout: Duration) -> Self {
        Self {
            store: Arc::new(Mutex::new(Box::new(store))),
            timeout,
        }
    }

    /// Open the SQLite registry at `path` (`:memory:` for an ephemeral one).
    pub fn open(path: &str, timeout: Duration) -> Result<Self, RegistryError> {
        let store = if path == ":memory:" {
            SqliteStore::open_in_memory()?
        } else {
            SqliteStore::open(path)?
        };
        Ok(Self::new(store, timeout))
    }

    /// Open an in-memory registry (for testing).
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Ok(Self::new(SqliteStore::open_in_memory()?, DEFAULT_STORE_TIMEOUT))
    }

    fn spawn<T, F>(&self, f: F) -> StoreTask<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn InstanceStore) -> Result<T, RegistryError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let mut guard = lock_store(&store);
            f(&mut **guard)
        })
    }

    /// Wait for `task` up to the timeout. On timeout the task keeps running.
    async fn bounded<T>(
        &self,
        op: &'static str,
        task: &mut StoreTask<T>,
    ) -> Result<T, RegistryError> {
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(RegistryError::Join(e.to_string())),
            Err(_) => Err(RegistryError::Timeout {
                op,
                after: self.timeout,
            }),
        }
    }

    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T, RegistryError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn InstanceStore) -> Result<T, RegistryError> + Send + 'static,
    {
        let mut task = self.spawn(f);
        self.bounded(op, &mut task).await
    }

    /// Persist a new record.
    ///
    /// On timeout the insert is abandoned: if it has not reached the store yet
    /// it is skipped, and if it is already running a delete is queued behind
    /// it. Either way no row survives for a provision the caller rolled back.
    pub async fn insert(&self, record: ProvisionedInstance) -> Result<(), RegistryError> {
        let name = record.name;
        let abandoned = Arc::new(AtomicBool::new(false));

        let result = self
            .run("insert", {
                let abandoned = Arc::clone(&abandoned);
                move |store| {
                    // Checked under the store lock, so it is ordered against
                    // the compensating delete below.
                    if abandoned.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    store.insert(&record)
                }
            })
            .await;

        if matches!(result, Err(RegistryError::Timeout { .. })) {
            abandoned.store(true, Ordering::SeqCst);

            let store = Arc::clone(&self.store);
            tokio::task::spawn_blocking(move || match lock_store(&store).delete(&name) {
                Ok(true) => warn!(name = %name, "Removed row left by timed-out insert"),
                Ok(false) => {}
                Err(e) => error!(
                    name = %name,
                    error = %e,
                    "Failed to remove row left by timed-out insert"
                ),
            });
        }

        result
    }

    /// Fetch a record by name.
    pub async fn get(&self, name: InstanceName) -> Result<ProvisionedInstance, RegistryError> {
        self.run("get", move |store| {
            store.get(&name)?.ok_or(RegistryError::NotFound(name))
        })
        .await
    }

    /// Remove a record. Absent records are not an error; the return value
    /// says whether this call removed a row.
    pub async fn delete(&self, name: InstanceName) -> Result<bool, RegistryError> {
        self.run("delete", move |store| store.delete(&name)).await
    }

    /// Like [`InstanceRegistry::delete`], for callers that own resources
    /// tied to the row.
    ///
    /// If the delete times out it is left to finish, and `on_late_removal`
    /// runs once it has removed the row. The timeout is still returned, so
    /// exactly one of "`Ok(true)` returned" and "`on_late_removal` ran" holds
    /// for each removed row.
    pub async fn delete_and_then<F>(
        &self,
        name: InstanceName,
        on_late_removal: F,
    ) -> Result<bool, RegistryError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task = self.spawn(move |store| store.delete(&name));
        let result = self.bounded("delete", &mut task).await;

        if matches!(result, Err(RegistryError::Timeout { .. })) {
            tokio::spawn(async move {
                match task.await {
                    Ok(Ok(true)) => on_late_removal(),
                    Ok(Ok(false)) => {}
                    Ok(Err(e)) => error!(name = %name, error = %e, "Timed-out delete failed"),
                    Err(e) => error!(name = %name, error = %e, "Timed-out delete task failed"),
                }
            });
        }

        result
    }

    /// Every row, including ones that cannot be decoded.
    pub async fn scan(&self) -> Result<Snapshot, RegistryError> {
        self.run("scan", |store| store.scan()).await
    }

    /// Snapshot of every decodable record, in no particular order.
    pub async fn list_all(&self) -> Result<Vec<ProvisionedInstance>, RegistryError> {
        self.run("list_all", |store| store.list_all()).await
    }

    pub async fn count(&self) -> Result<usize, RegistryError> {
        self.run("count", |store| store.count()).await
    }

    /// Record the backend pid for an instance. Returns whether it exists.
    pub async fn set_pid(
        &self,
        name: InstanceName,
        pid: Option<u32>,
    ) -> Result<bool, RegistryError> {
        self.run("set_pid", move |store| store.set_pid(&name, pid)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Store whose writes block for a while before delegating.
    struct SlowStore {
        inner: SqliteStore,
        insert_delay: Duration,
        delete_delay: Duration,
    }

    impl SlowStore {
        fn new(insert_delay: Duration, delete_delay: Duration) -> Self {
            Self {
                inner: SqliteStore::open_in_memory().unwrap(),
                insert_delay,
                delete_delay,
            }
        }
    }

    impl InstanceStore for SlowStore {
        fn insert(&mut self, record: &ProvisionedInstance) -> Result<(), RegistryError> {
            std::thread::sleep(self.insert_delay);
            self.inner.insert(record)
        }

        fn get(&self, name: &InstanceName) -> Result<Option<ProvisionedInstance>, RegistryError> {
            self.inner.get(name)
        }

        fn delete(&mut self, name: &InstanceName) -> Result<bool, RegistryError> {
            std::thread::sleep(self.delete_delay);
            self.inner.delete(name)
        }

        fn scan(&self) -> Result<Snapshot, RegistryError> {
            self.inner.scan()
        }

        fn count(&self) -> Result<usize, RegistryError> {
            self.inner.count()
        }

        fn set_pid(
            &mut self,
            name: &InstanceName,
            pid: Option<u32>,
        ) -> Result<bool, RegistryError> {
            self.inner.set_pid(name, pid)
        }
    }

    #[tokio::test]
    async fn test_registry_roundtrip() {
        let registry = InstanceRegistry::open_in_memory().unwrap();
        let record = ProvisionedInstance::new(InstanceName::new(), 9000, 1, None);

        registry.insert(record.clone()).await.unwrap();
        assert_eq!(registry.get(record.name).await.unwrap(), record);
        assert_eq!(registry.count().await.unwrap(), 1);

        assert!(registry.delete(record.name).await.unwrap());
        assert!(!registry.delete(record.name).await.unwrap());
        assert!(matches!(
            registry.get(record.name).await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_open_memory_path() {
        let registry = InstanceRegistry::open(":memory:", Duration::from_secs(1)).unwrap();
        assert_eq!(registry.list_all().await.unwrap(), vec![]);
    }

    #[tokio::test]
    async fn test_timed_out_insert_leaves_no_row() {
        let store = SlowStore::new(Duration::from_millis(200), Duration::ZERO);
        let registry = InstanceRegistry::new(store, Duration::from_millis(20));
        let record = ProvisionedInstance::new(InstanceName::new(), 9000, 1, None);

        let err = registry.insert(record.clone()).await.unwrap_err();
        assert!(matches!(err, RegistryError::Timeout { op: "insert", .. }));
        assert!(err.is_store_failure());

        // Let the slow insert and the queued delete drain.
        tokio::time::sleep(Duration::from_millis(400)).await;

        let registry_count = {
            let store = Arc::clone(&registry.store);
            tokio::task::spawn_blocking(move || lock_store(&store).count())
                .await
                .unwrap()
                .unwrap()
        };
        assert_eq!(registry_count, 0);
    }

    #[tokio::test]
    async fn test_timed_out_delete_reports_late_removal() {
        let store = SlowStore::new(Duration::ZERO, Duration::from_millis(200));
        let registry = InstanceRegistry::new(store, Duration::from_millis(50));
        let record = ProvisionedInstance::new(InstanceName::new(), 9000, 1, None);
        registry.insert(record.clone()).await.unwrap();

        let removed_late = Arc::new(AtomicBool::new(false));
        let err = registry
            .delete_and_then(record.name, {
                let removed_late = Arc::clone(&removed_late);
                move || removed_late.store(true, Ordering::SeqCst)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Timeout { op: "delete", .. }));
        assert!(!removed_late.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(removed_late.load(Ordering::SeqCst));
        assert_eq!(registry.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prompt_delete_skips_late_hook() {
        let registry = InstanceRegistry::open_in_memory().unwrap();
        let record = ProvisionedInstance::new(InstanceName::new(), 9000, 1, None);
        registry.insert(record.clone()).await.unwrap();

        let removed_late = Arc::new(AtomicBool::new(false));
        let removed = registry
            .delete_and_then(record.name, {
                let removed_late = Arc::clone(&removed_late);
                move || removed_late.store(true, Ordering::SeqCst)
            })
            .await
            .unwrap();
        assert!(removed);

        tokio::task::yield_now().await;
        assert!(!removed_late.load(Ordering::SeqCst));
    }
}
