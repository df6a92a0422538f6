//! Global key-value state
//!
//! Backs the host's global state contract. Values are JSON; `update` with
//! `None` deletes the key.

use crate::error::{AgentError, Result};
use crate::sync::{lock, read, write};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Bumped whenever the stored value format changes
pub const SCHEMA_VERSION: i64 = 1;

pub trait GlobalStateStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn update(&self, key: &str, value: Option<Value>) -> Result<()>;

    fn keys(&self) -> Vec<String>;

    /// Remove every key
    fn reset(&self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryGlobalState {
    values: RwLock<BTreeMap<String, Value>>,
}

impl MemoryGlobalState {
    pub fn new() -> Self {
        Self::default()
    }
}

impl GlobalStateStore for MemoryGlobalState {
    fn get(&self, key: &str) -> Option<Value> {
        read(&self.values).get(key).cloned()
    }

    fn update(&self, key: &str, value: Option<Value>) -> Result<()> {
        let mut values = write(&self.values);
        match value {
            Some(value) => values.insert(key.to_string(), value),
            None => values.remove(key),
        };
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        read(&self.values).keys().cloned().collect()
    }

    fn reset(&self) -> Result<()> {
        write(&self.values).clear();
        Ok(())
    }
}

/// Whole-map JSON file, rewritten on every update
#[derive(Debug)]
pub struct JsonFileGlobalState {
    path: PathBuf,
    values: Mutex<BTreeMap<String, Value>>,
}

impl JsonFileGlobalState {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let values = match std::fs::read_to_string(&path) {
            Ok(text) if !text.trim().is_empty() => serde_json::from_str(&text).map_err(|e| {
                AgentError::Storage(format!("Corrupt global state file {}: {e}", path.display()))
            })?,
            Ok(_) => BTreeMap::new(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Global state loaded from {}", path.display());
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    fn persist(&self, values: &BTreeMap<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp = self.path.with_extension("tmp");
        std::fs::write(&temp, serde_json::to_vec_pretty(values)?)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }
}

impl GlobalStateStore for JsonFileGlobalState {
    fn get(&self, key: &str) -> Option<Value> {
        lock(&self.values).get(key).cloned()
    }

    fn update(&self, key: &str, value: Option<Value>) -> Result<()> {
        let mut values = lock(&self.values);
        match value {
            Some(value) => values.insert(key.to_string(), value),
            None => values.remove(key),
        };
        self.persist(&values)
    }

    fn keys(&self) -> Vec<String> {
        lock(&self.values).keys().cloned().collect()
    }

    fn reset(&self) -> Result<()> {
        let mut values = lock(&self.values);
        values.clear();
        self.persist(&values)
    }
}

/// Single-file database keyed by `(key, ide, version)`
pub struct SqliteGlobalState {
    connection: Mutex<rusqlite::Connection>,
    ide: String,
}

fn storage_error(e: rusqlite::Error) -> AgentError {
    AgentError::Storage(e.to_string())
}

impl SqliteGlobalState {
    pub fn open(path: impl AsRef<Path>, ide: &str) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let connection = rusqlite::Connection::open(path).map_err(storage_error)?;
        info!("Global state database at {}", path.display());
        Self::with_connection(connection, ide)
    }

    pub fn in_memory(ide: &str) -> Result<Self> {
        Self::with_connection(
            rusqlite::Connection::open_in_memory().map_err(storage_error)?,
            ide,
        )
    }

    fn with_connection(connection: rusqlite::Connection, ide: &str) -> Result<Self> {
        connection
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS global_state (
                    key TEXT NOT NULL,
                    ide TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    value TEXT NOT NULL,
                    PRIMARY KEY (key, ide, version)
                );",
            )
            .map_err(storage_error)?;
        Ok(Self {
            connection: Mutex::new(connection),
            ide: ide.to_string(),
        })
    }

    fn list_keys(&self) -> rusqlite::Result<Vec<String>> {
        let connection = lock(&self.connection);
        let mut statement = connection
            .prepare("SELECT key FROM global_state WHERE ide = ?1 AND version = ?2 ORDER BY key")?;
        let keys = statement
            .query_map(rusqlite::params![self.ide, SCHEMA_VERSION], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }
}

impl GlobalStateStore for SqliteGlobalState {
    fn get(&self, key: &str) -> Option<Value> {
        let connection = lock(&self.connection);
        let text: Option<String> = connection
            .query_row(
                "SELECT value FROM global_state WHERE key = ?1 AND ide = ?2 AND version = ?3",
                rusqlite::params![key, self.ide, SCHEMA_VERSION],
                |row| row.get(0),
            )
            .ok();
        text.and_then(|text| match serde_json::from_str(&text) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Ignoring unreadable global state value for {}: {}", key, e);
                None
            }
        })
    }

    fn update(&self, key: &str, value: Option<Value>) -> Result<()> {
        let connection = lock(&self.connection);
        match value {
            Some(value) => connection.execute(
                "INSERT INTO global_state (key, ide, version, value) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (key, ide, version) DO UPDATE SET value = excluded.value",
                rusqlite::params![key, self.ide, SCHEMA_VERSION, serde_json::to_string(&value)?],
            ),
            None => connection.execute(
                "DELETE FROM global_state WHERE key = ?1 AND ide = ?2 AND version = ?3",
                rusqlite::params![key, self.ide, SCHEMA_VERSION],
            ),
        }
        .map_err(storage_error)?;
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.list_keys().unwrap_or_else(|e| {
            debug!("Failed to list global state keys: {}", e);
            Vec::new()
        })
    }

    fn reset(&self) -> Result<()> {
        lock(&self.connection)
            .execute(
                "DELETE FROM global_state WHERE ide = ?1 AND version = ?2",
                rusqlite::params![self.ide, SCHEMA_VERSION],
            )
            .map_err(storage_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exercise(store: &dyn GlobalStateStore) {
        assert_eq!(store.get("missing"), None);
        store.update("b", Some(json!({"nested": [1, 2]}))).unwrap();
        store.update("a", Some(json!("first"))).unwrap();
        store.update("a", Some(json!("second"))).unwrap();
        assert_eq!(store.get("a"), Some(json!("second")));
        assert_eq!(store.keys(), vec!["a".to_string(), "b".to_string()]);

        store.update("a", None).unwrap();
        assert_eq!(store.get("a"), None);
        assert_eq!(store.keys(), vec!["b".to_string()]);

        store.reset().unwrap();
        assert!(store.keys().is_empty());
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryGlobalState::new());
    }

    #[test]
    fn test_json_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("global.json");
        exercise(&JsonFileGlobalState::open(&path).unwrap());

        let store = JsonFileGlobalState::open(&path).unwrap();
        store.update("kept", Some(json!(true))).unwrap();
        drop(store);
        let reopened = JsonFileGlobalState::open(&path).unwrap();
        assert_eq!(reopened.get("kept"), Some(json!(true)));
    }

    #[test]
    fn test_sqlite_store() {
        exercise(&SqliteGlobalState::in_memory("headless").unwrap());
    }

    #[test]
    fn test_sqlite_separates_ides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        let first = SqliteGlobalState::open(&path, "vscode").unwrap();
        let second = SqliteGlobalState::open(&path, "jetbrains").unwrap();

        first.update("key", Some(json!(1))).unwrap();
        assert_eq!(second.get("key"), None);
        second.update("key", Some(json!(2))).unwrap();
        assert_eq!(first.get("key"), Some(json!(1)));

        first.reset().unwrap();
        assert_eq!(second.get("key"), Some(json!(2)));
    }
}
