//! Durable key-value storage trait and its SQLite and in-memory backends.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default per-value size limit, matching common browser storage quotas.
pub const DEFAULT_MAX_VALUE_BYTES: usize = 5 * 1024 * 1024;

/// How long a writer waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Synchronous byte storage shared by every component of the cache.
///
/// Values above the backend's size limit are rejected with
/// [`Error::QuotaExceeded`]. Backends are last-writer-wins.
pub trait DurableStore: Send + Sync {
  /// A short backend name for logging (e.g. "sqlite", "memory").
  fn name(&self) -> &'static str;

  fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

  fn set(&self, key: &str, value: &[u8]) -> Result<()>;

  /// Removing a missing key is not an error.
  fn delete(&self, key: &str) -> Result<()>;

  /// All stored keys beginning with `prefix`.
  fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

fn check_quota(key: &str, value: &[u8], limit: usize) -> Result<()> {
  if value.len() > limit {
    return Err(Error::QuotaExceeded {
      key: key.to_string(),
      size: value.len(),
      limit,
    });
  }
  Ok(())
}

/// Process-local storage. Nothing survives the process.
#[derive(Debug)]
pub struct MemoryStorage {
  values: Mutex<HashMap<String, Vec<u8>>>,
  max_value_bytes: usize,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::with_limit(DEFAULT_MAX_VALUE_BYTES)
  }

  pub fn with_limit(max_value_bytes: usize) -> Self {
    Self {
      values: Mutex::new(HashMap::new()),
      max_value_bytes,
    }
  }

  fn values(&self) -> MutexGuard<'_, HashMap<String, Vec<u8>>> {
    self.values.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl Default for MemoryStorage {
  fn default() -> Self {
    Self::new()
  }
}

impl DurableStore for MemoryStorage {
  fn name(&self) -> &'static str {
    "memory"
  }

  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.values().get(key).cloned())
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    check_quota(key, value, self.max_value_bytes)?;
    self.values().insert(key.to_string(), value.to_vec());
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    self.values().remove(key);
    Ok(())
  }

  fn keys(&self, prefix: &str) -> Result<Vec<String>> {
    let mut keys: Vec<String> = self
      .values()
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect();
    keys.sort();
    Ok(keys)
  }
}

/// SQLite-based storage. Several processes opening the same file share
/// one store, which is how peer contexts see each other's writes.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  max_value_bytes: usize,
}

/// Schema for the key-value table.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SqliteStorage {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open or create the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        Error::Storage(format!(
          "Failed to create cache directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // WAL lets readers in other processes proceed during a write
    let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
    tracing::debug!(path = %path.display(), journal_mode = %mode, "Opened cache database");

    Self::from_connection(conn)
  }

  /// A private in-memory database, mostly for tests.
  pub fn open_in_memory() -> Result<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn.execute_batch(STORE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
      max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
    })
  }

  pub fn with_limit(mut self, max_value_bytes: usize) -> Self {
    self.max_value_bytes = max_value_bytes;
    self
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Storage("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("casecache").join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
  }
}

impl DurableStore for SqliteStorage {
  fn name(&self) -> &'static str {
    "sqlite"
  }

  fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self.conn()?;
    let value = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(value)
  }

  fn set(&self, key: &str, value: &[u8]) -> Result<()> {
    check_quota(key, value, self.max_value_bytes)?;
    let conn = self.conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
       VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    let conn = self.conn()?;
    conn.execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
    Ok(())
  }

  fn keys(&self, prefix: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(
      "SELECT key FROM kv_store
       WHERE substr(key, 1, length(?1)) = ?1
       ORDER BY key",
    )?;
    let keys = stmt
      .query_map(params![prefix], |row| row.get(0))?
      .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(keys)
  }
}
