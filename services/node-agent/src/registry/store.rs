//! SQLite-backed instance store.
//!
//! One row per provisioned instance. The table enforces the same uniqueness
//! the node relies on (name primary key, unique port) and survives restarts,
//! so it is the source of truth the port pool is rebuilt from.

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use wtp_id::InstanceName;

/// Errors from registry operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("instance name {0} is already registered")]
    DuplicateName(InstanceName),

    #[error("port {0} is already registered to another instance")]
    DuplicatePort(u16),

    #[error("instance {0} not found")]
    NotFound(InstanceName),

    #[error("SQLite error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("registry {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    #[error("corrupt registry row: {0}")]
    Corrupt(String),

    #[error("registry task failed: {0}")]
    Join(String),
}

impl RegistryError {
    /// Whether this error comes from the persistence backend itself, as
    /// opposed to a uniqueness or lookup outcome.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Timeout { .. } | Self::Corrupt(_) | Self::Join(_)
        )
    }

    /// Whether the backend reported a full disk.
    pub fn is_disk_full(&self) -> bool {
        matches!(
            self,
            Self::Store(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::DiskFull
        )
    }
}

/// A provisioned instance as recorded in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedInstance {
    /// Unique instance name (primary key).
    pub name: InstanceName,
    /// Port allocated from the node's pool.
    pub port: u16,
    /// Service plan at creation time.
    pub plan: u32,
    /// Backend process id, once started.
    pub pid: Option<u32>,
    /// Memory budget in megabytes.
    pub memory: Option<i64>,
    /// Backend software version at creation time.
    pub version: Option<String>,
    /// Created timestamp (Unix seconds).
    pub created_at: i64,
}

impl ProvisionedInstance {
    /// Build a fresh record for a newly allocated port.
    pub fn new(name: InstanceName, port: u16, plan: u32, version: Option<String>) -> Self {
        Self {
            name,
            port,
            plan,
            pid: None,
            memory: None,
            version,
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Synchronous persistence backend for instance records.
///
/// Implementations only need to be `Send`: the registry serialises all calls
/// and runs them on the blocking pool.
pub trait InstanceStore: Send {
    /// Persist a new record, rejecting a duplicate name or port.
    fn insert(&mut self, record: &ProvisionedInstance) -> Result<(), RegistryError>;

    fn get(&self, name: &InstanceName) -> Result<Option<ProvisionedInstance>, RegistryError>;

    /// Remove a record. Returns whether a row existed.
    fn delete(&mut self, name: &InstanceName) -> Result<bool, RegistryError>;

    /// Every row, with the ones that cannot be decoded set apart.
    fn scan(&self) -> Result<Snapshot, RegistryError>;

    /// Every decodable record.
    fn list_all(&self) -> Result<Vec<ProvisionedInstance>, RegistryError> {
        Ok(self.scan()?.records)
    }

    fn count(&self) -> Result<usize, RegistryError>;

    /// Record the backend pid. Returns whether the instance exists.
    fn set_pid(&mut self, name: &InstanceName, pid: Option<u32>) -> Result<bool, RegistryError>;
}

/// A row whose columns do not decode into a [`ProvisionedInstance`], such as
/// a name that is not an instance name or a port beyond `u16`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorruptRecord {
    /// The name column as stored.
    pub name: String,
    /// The port column as stored.
    pub port: i64,
    pub reason: String,
}

/// Full contents of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub records: Vec<ProvisionedInstance>,
    pub corrupt: Vec<CorruptRecord>,
}

impl Snapshot {
    /// Rows of either kind.
    pub fn len(&self) -> usize {
        self.records.len() + self.corrupt.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Columns read without narrowing, so a bad value is reported per row
/// instead of failing the whole query.
struct RawRow {
    name: Option<String>,
    port: i64,
    plan: i64,
    pid: Option<i64>,
    memory: Option<i64>,
    version: Option<String>,
    created_at: i64,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        name: row.get(0)?,
        port: row.get(1)?,
        plan: row.get(2)?,
        pid: row.get(3)?,
        memory: row.get(4)?,
        version: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn decode_row(raw: RawRow) -> Result<ProvisionedInstance, CorruptRecord> {
    let stored_name = raw.name.unwrap_or_default();
    let corrupt = |reason: String| CorruptRecord {
        name: stored_name.clone(),
        port: raw.port,
        reason,
    };

    let name = InstanceName::parse(&stored_name).map_err(|e| corrupt(e.to_string()))?;
    let port = u16::try_from(raw.port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| corrupt(format!("invalid port {}", raw.port)))?;
    let plan =
        u32::try_from(raw.plan).map_err(|_| corrupt(format!("invalid plan {}", raw.plan)))?;
    let pid = raw
        .pid
        .map(u32::try_from)
        .transpose()
        .map_err(|_| corrupt(format!("invalid pid {:?}", raw.pid)))?;

    Ok(ProvisionedInstance {
        name,
        port,
        plan,
        pid,
        memory: raw.memory,
        version: raw.version,
        created_at: raw.created_at,
    })
}

const SELECT_COLUMNS: &str =
    "SELECT name, port, plan, pid, memory, version, created_at FROM provisioned_instances";

/// SQLite instance store.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let conn = Connection::open(path)?;

        // WAL keeps committed inserts durable across a crash without
        // blocking readers during writes.
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), RegistryError> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS provisioned_instances (
                name TEXT PRIMARY KEY,
                port INTEGER NOT NULL UNIQUE,
                plan INTEGER NOT NULL,
                pid INTEGER,
                memory INTEGER,
                version TEXT,
                created_at INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Instance registry schema initialized");
        Ok(())
    }
}

impl InstanceStore for SqliteStore {
    fn insert(&mut self, record: &ProvisionedInstance) -> Result<(), RegistryError> {
        let tx = self.conn.transaction()?;

        let name = record.name.to_string();
        let name_taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM provisioned_instances WHERE name = ?1)",
            params![name],
            |row| row.get(0),
        )?;
        if name_taken {
            return Err(RegistryError::DuplicateName(record.name));
        }

        let port_taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM provisioned_instances WHERE port = ?1)",
            params![record.port],
            |row| row.get(0),
        )?;
        if port_taken {
            return Err(RegistryError::DuplicatePort(record.port));
        }

        tx.execute(
            r#"
            INSERT INTO provisioned_instances (name, port, plan, pid, memory, version, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                name,
                record.port,
                record.plan,
                record.pid,
                record.memory,
                record.version,
                record.created_at,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get(&self, name: &InstanceName) -> Result<Option<ProvisionedInstance>, RegistryError> {
        let mut stmt = self
            .conn
            .prepare(&format!("{} WHERE name = ?1", SELECT_COLUMNS))?;

        stmt.query_row(params![name.to_string()], read_row)
            .optional()?
            .map(|raw| {
                decode_row(raw).map_err(|c| {
                    RegistryError::Corrupt(format!("row '{}': {}", c.name, c.reason))
                })
            })
            .transpose()
    }

    fn delete(&mut self, name: &InstanceName) -> Result<bool, RegistryError> {
        let removed = self.conn.execute(
            "DELETE FROM provisioned_instances WHERE name = ?1",
            params![name.to_string()],
        )?;
        Ok(removed > 0)
    }

    fn scan(&self) -> Result<Snapshot, RegistryError> {
        let mut stmt = self.conn.prepare(SELECT_COLUMNS)?;

        let rows = stmt
            .query_map([], read_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut snapshot = Snapshot::default();
        for raw in rows {
            match decode_row(raw) {
                Ok(record) => snapshot.records.push(record),
                Err(corrupt) => snapshot.corrupt.push(corrupt),
            }
        }
        Ok(snapshot)
    }

    fn count(&self) -> Result<usize, RegistryError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM provisioned_instances", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn set_pid(&mut self, name: &InstanceName, pid: Option<u32>) -> Result<bool, RegistryError> {
        let updated = self.conn.execute(
            "UPDATE provisioned_instances SET pid = ?1 WHERE name = ?2",
            params![pid, name.to_string()],
        )?;
        Ok(updated > 0)
    }
}
