//! Cache storage trait and its implementations.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

/// Trait for cache storage backends.
///
/// Backends store opaque bytes under string keys. Calls are synchronous and
/// expected to touch local resources only.
pub trait CacheStorage: Send + Sync {
  /// Get the bytes stored under a key.
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  /// Store bytes under a key, replacing any previous value.
  fn set(&self, key: &str, value: &[u8]) -> Result<()>;

  /// Delete a key. Deleting a missing key is not an error.
  fn delete(&self, key: &str) -> Result<()>;

  /// Delete every key starting with `prefix`, returning how many were removed.
  fn clear_by_prefix(&self, prefix: &str) -> Result<usize>;
}

/// Read and deserialize a JSON value from storage.
pub fn read_json<T: DeserializeOwned>(storage: &dyn CacheStorage, key: &str) -> Result<Option<T>> {
  match storage.get(key)? {
    Some(bytes) => {
      let value = serde_json::from_slice(&bytes)
        .map_err(|e| eyre!("Failed to deserialize cache entry {}: {}", key, e))?;
      Ok(Some(value))
    }
    None => Ok(None),
  }
}

/// Serialize a value as JSON and write it to storage.
pub fn write_json<T: Serialize>(storage: &dyn CacheStorage, key: &str, value: &T) -> Result<()> {
  let bytes =
    serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize cache entry {}: {}", key, e))?;
  storage.set(key, &bytes)
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _value: &[u8]) -> Result<()> {
    Ok(()) // Discard
  }

  fn delete(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn clear_by_prefix(&self, _prefix: &str) -> Result<usize> {
    Ok(0)
  }
}

/// Process-local storage backed by a hash map.
#[derive(Default)]
pub struct MemoryStorage {
  entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStorage for MemoryStorage {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let entries = self
      .entries
      .read()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(entries.get(key).cloned())
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    let mut entries = self
      .entries
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    let mut entries = self
      .entries
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    entries.remove(key);
    Ok(())
  }

  fn clear_by_prefix(&self, prefix: &str) -> Result<usize> {
    let mut entries = self
      .entries
      .write()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let before = entries.len();
    entries.retain(|key, _| !key.starts_with(prefix));
    Ok(before - entries.len())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> Result<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Create a new SQLite storage at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Create a storage that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("ledger-mirror").join("cache.db"))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per cache entry (serialized JSON)
CREATE TABLE IF NOT EXISTS cache_entries (
    key TEXT PRIMARY KEY,
    data BLOB NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl CacheStorage for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT data FROM cache_entries WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key, e))
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_entries (key, data, stored_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to store cache entry {}: {}", key, e))?;

    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM cache_entries WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete cache entry {}: {}", key, e))?;

    Ok(())
  }

  fn clear_by_prefix(&self, prefix: &str) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // substr avoids LIKE wildcard escaping for keys containing '%' or '_'
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE substr(key, 1, length(?1)) = ?1",
        params![prefix],
      )
      .map_err(|e| eyre!("Failed to clear cache entries under {}: {}", prefix, e))?;

    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn exercise(storage: &dyn CacheStorage) {
    assert_eq!(storage.get("b1:payees").unwrap(), None);

    storage.set("b1:payees", b"one").unwrap();
    storage.set("b1:payees", b"two").unwrap();
    storage.set("b1:accounts", b"acc").unwrap();
    storage.set("b2:accounts", b"other").unwrap();

    assert_eq!(storage.get("b1:payees").unwrap(), Some(b"two".to_vec()));

    storage.delete("b1:payees").unwrap();
    storage.delete("b1:payees").unwrap();
    assert_eq!(storage.get("b1:payees").unwrap(), None);

    assert_eq!(storage.clear_by_prefix("b1:").unwrap(), 1);
    assert_eq!(storage.get("b1:accounts").unwrap(), None);
    assert_eq!(storage.get("b2:accounts").unwrap(), Some(b"other".to_vec()));
  }

  #[test]
  fn test_memory_storage() {
    exercise(&MemoryStorage::new());
  }

  #[test]
  fn test_sqlite_storage() {
    exercise(&SqliteStorage::open_in_memory().unwrap());
  }

  #[test]
  fn test_sqlite_prefix_is_literal() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.set("b_1:payees", b"x").unwrap();
    storage.set("bx1:payees", b"y").unwrap();

    assert_eq!(storage.clear_by_prefix("b_1:").unwrap(), 1);
    assert!(storage.get("bx1:payees").unwrap().is_some());
  }

  #[test]
  fn test_sqlite_persists_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    SqliteStorage::open_at(&path).unwrap().set("k", b"v").unwrap();
    let reopened = SqliteStorage::open_at(&path).unwrap();

    assert_eq!(reopened.get("k").unwrap(), Some(b"v".to_vec()));
  }

  #[test]
  fn test_noop_storage_always_misses() {
    let storage = NoopStorage;
    storage.set("k", b"v").unwrap();
    assert_eq!(storage.get("k").unwrap(), None);
    assert_eq!(storage.clear_by_prefix("").unwrap(), 0);
  }

  #[test]
  fn test_json_helpers() {
    let storage = MemoryStorage::new();
    write_json(&storage, "k", &vec![1, 2, 3]).unwrap();
    let value: Option<Vec<u32>> = read_json(&storage, "k").unwrap();
    assert_eq!(value, Some(vec![1, 2, 3]));

    storage.set("bad", b"not json").unwrap();
    assert!(read_json::<Vec<u32>>(&storage, "bad").is_err());
  }
}
