//! StateStore — redb-backed key/value persistence for controller state.
//!
//! Values are plain strings keyed by hierarchical paths. A missing key reads
//! as `None` rather than an error, so first-use defaults are handled by the
//! caller. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, trace};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

pub(crate) use map_err;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CONTROLLER_STATE).map_err(map_err!(Table))?;
        txn.open_table(LOCKS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read the value stored at `path`, if any.
    pub fn read(&self, path: &str) -> StateResult<Option<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONTROLLER_STATE).map_err(map_err!(Table))?;
        let value = table
            .get(path)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value().to_string());
        Ok(value)
    }

    /// Insert or overwrite the value at `path`.
    pub fn write(&self, path: &str, value: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(CONTROLLER_STATE).map_err(map_err!(Table))?;
            table.insert(path, value).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        trace!(%path, %value, "controller state written");
        Ok(())
    }

    /// Delete the value at `path`. Returns true if it existed.
    pub fn delete(&self, path: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(CONTROLLER_STATE).map_err(map_err!(Table))?;
            existed = table.remove(path).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%path, existed, "controller state deleted");
        Ok(existed)
    }

    /// List every `(path, value)` pair whose path starts with `prefix`.
    pub fn list_prefix(&self, prefix: &str) -> StateResult<Vec<(String, String)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CONTROLLER_STATE).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if key.value().starts_with(prefix) {
                results.push((key.value().to_string(), value.value().to_string()));
            }
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_and_read() {
        let store = StateStore::open_in_memory().unwrap();
        store.write("/autoscaling/web/main/pid_iterm", "1.5").unwrap();

        let value = store.read("/autoscaling/web/main/pid_iterm").unwrap();
        assert_eq!(value.as_deref(), Some("1.5"));
    }

    #[test]
    fn read_missing_returns_none() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.read("/autoscaling/nope").unwrap().is_none());
    }

    #[test]
    fn write_overwrites_in_place() {
        let store = StateStore::open_in_memory().unwrap();
        store.write("/a/b", "1").unwrap();
        store.write("/a/b", "2").unwrap();

        assert_eq!(store.read("/a/b").unwrap().as_deref(), Some("2"));
        assert_eq!(store.list_prefix("/a").unwrap().len(), 1);
    }

    #[test]
    fn delete_reports_existence() {
        let store = StateStore::open_in_memory().unwrap();
        store.write("/a/b", "1").unwrap();

        assert!(store.delete("/a/b").unwrap());
        assert!(!store.delete("/a/b").unwrap());
        assert!(store.read("/a/b").unwrap().is_none());
    }

    #[test]
    fn list_prefix_filters_other_services() {
        let store = StateStore::open_in_memory().unwrap();
        store.write("/autoscaling/web/main/cpu_data", "").unwrap();
        store.write("/autoscaling/web/main/cpu_last_time", "10").unwrap();
        store.write("/autoscaling/batch/main/cpu_last_time", "10").unwrap();

        let entries = store.list_prefix("/autoscaling/web/").unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|(k, _)| k.starts_with("/autoscaling/web/")));
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("state.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.write("/autoscaling/web/main/pid_last_time", "1700000000").unwrap();
        }

        // Reopen the same database file.
        let store = StateStore::open(&db_path).unwrap();
        let value = store.read("/autoscaling/web/main/pid_last_time").unwrap();
        assert_eq!(value.as_deref(), Some("1700000000"));
    }
}
