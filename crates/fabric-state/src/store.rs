//! StateStore: redb-backed registry of controller instances.
//!
//! Records are JSON-serialized into redb's `&[u8]` value column, keyed by
//! instance name. The store supports both on-disk and in-memory backends
//! (the latter for tests and single-process simulations).

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use fabric_core::ControllerInstance;
use redb::{Database, ReadableDatabase, ReadableTable, WriteTransaction};
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::watch::{InstanceEvent, InstanceWatch};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Buffered events per watch subscriber before it must resync.
const WATCH_CAPACITY: usize = 256;

/// Thread-safe registry backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    events: broadcast::Sender<InstanceEvent>,
    /// Held across commit + publish so events go out in commit order.
    write_lock: Arc<Mutex<()>>,
}

impl StateStore {
    /// Open (or create) a persistent registry at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "registry opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory registry.
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory registry opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            db: Arc::new(db),
            events,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Replace the watch buffer size. Only affects subscriptions made afterwards.
    pub fn with_watch_capacity(mut self, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        self.events = events;
        self
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CONTROLLER_INSTANCES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: InstanceEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Get a controller instance by name.
    pub fn get_instance(&self, name: &str) -> StateResult<Option<ControllerInstance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(CONTROLLER_INSTANCES)
            .map_err(map_err!(Table))?;
        match table.get(name).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// List the instances of one controller type.
    pub fn list_instances(&self, controller_type: &str) -> StateResult<Vec<ControllerInstance>> {
        Ok(self
            .list_all_instances()?
            .into_iter()
            .filter(|r| r.controller_type == controller_type)
            .collect())
    }

    /// List every instance regardless of type.
    pub fn list_all_instances(&self) -> StateResult<Vec<ControllerInstance>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(CONTROLLER_INSTANCES)
            .map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(decode(value.value())?);
        }
        Ok(results)
    }

    /// Subscribe to committed changes of one controller type.
    pub fn watch_instances(&self, controller_type: &str) -> InstanceWatch {
        InstanceWatch::new(controller_type, self.events.subscribe())
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Insert a new record, assigning its resource version.
    pub fn create_instance(&self, record: &ControllerInstance) -> StateResult<ControllerInstance> {
        let _writes = self.lock_writes();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut stored = record.clone();
        {
            let mut table = txn
                .open_table(CONTROLLER_INSTANCES)
                .map_err(map_err!(Table))?;
            if table
                .get(record.name.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(StateError::Conflict(format!(
                    "controller instance {} already exists",
                    record.name
                )));
            }
            for entry in table.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let existing = decode(value.value())?;
                if existing.controller_type == record.controller_type
                    && existing.controller_key == record.controller_key
                {
                    return Err(StateError::Conflict(format!(
                        "controller key {} of type {} already held by {}",
                        record.controller_key, record.controller_type, existing.name
                    )));
                }
            }
            stored.resource_version = bump_version(&txn)?;
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(stored.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            name = %stored.name,
            controller_type = %stored.controller_type,
            key = stored.controller_key,
            version = stored.resource_version,
            "controller instance created"
        );
        self.publish(InstanceEvent::Added(stored.clone()));
        Ok(stored)
    }

    /// Replace a record if nobody wrote it since `expected_version`.
    ///
    /// The controller type and key of a record are immutable.
    pub fn update_instance(
        &self,
        record: &ControllerInstance,
        expected_version: u64,
    ) -> StateResult<ControllerInstance> {
        let _writes = self.lock_writes();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut stored = record.clone();
        {
            let mut table = txn
                .open_table(CONTROLLER_INSTANCES)
                .map_err(map_err!(Table))?;
            let existing = match table.get(record.name.as_str()).map_err(map_err!(Read))? {
                Some(guard) => decode(guard.value())?,
                None => return Err(StateError::NotFound(record.name.clone())),
            };
            if existing.resource_version != expected_version {
                return Err(StateError::Conflict(format!(
                    "controller instance {} is at version {}, expected {}",
                    record.name, existing.resource_version, expected_version
                )));
            }
            if existing.controller_type != record.controller_type
                || existing.controller_key != record.controller_key
            {
                return Err(StateError::Conflict(format!(
                    "controller type and key of {} are immutable",
                    record.name
                )));
            }
            stored.resource_version = bump_version(&txn)?;
            let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            table
                .insert(stored.name.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            name = %stored.name,
            locked = stored.is_locked,
            serving = %stored.serving,
            version = stored.resource_version,
            "controller instance updated"
        );
        self.publish(InstanceEvent::Modified(stored.clone()));
        Ok(stored)
    }

    /// Delete a record by name. Returns true if it existed.
    pub fn delete_instance(&self, name: &str) -> StateResult<bool> {
        self.remove_instance(name, None)
    }

    /// Delete a record only if nobody wrote it since `expected_version`.
    ///
    /// Returns false if it is already gone, `Conflict` if it changed.
    pub fn delete_instance_at_version(
        &self,
        name: &str,
        expected_version: u64,
    ) -> StateResult<bool> {
        self.remove_instance(name, Some(expected_version))
    }

    fn remove_instance(&self, name: &str, expected_version: Option<u64>) -> StateResult<bool> {
        let _writes = self.lock_writes();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut table = txn
                .open_table(CONTROLLER_INSTANCES)
                .map_err(map_err!(Table))?;
            if let Some(expected) = expected_version {
                let current = match table.get(name).map_err(map_err!(Read))? {
                    Some(guard) => Some(decode(guard.value())?.resource_version),
                    None => None,
                };
                if let Some(current) = current.filter(|v| *v != expected) {
                    return Err(StateError::Conflict(format!(
                        "controller instance {name} is at version {current}, expected {expected}"
                    )));
                }
            }
            removed = match table.remove(name).map_err(map_err!(Write))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            if removed.is_some() {
                bump_version(&txn)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%name, existed = removed.is_some(), "controller instance deleted");
        match removed {
            Some(record) => {
                self.publish(InstanceEvent::Deleted(record));
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

fn decode(bytes: &[u8]) -> StateResult<ControllerInstance> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

/// Increment and return the store-wide resource version.
fn bump_version(txn: &WriteTransaction) -> StateResult<u64> {
    let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
    let current = meta
        .get(RESOURCE_VERSION)
        .map_err(map_err!(Read))?
        .map(|guard| guard.value())
        .unwrap_or(0);
    let next = current + 1;
    meta.insert(RESOURCE_VERSION, next)
        .map_err(map_err!(Write))?;
    Ok(next)
}
