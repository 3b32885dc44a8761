use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{
  CacheEntryStore, DurableStore, MemoryStorage, SqliteStorage, DEFAULT_MAX_VALUE_BYTES,
  DEFAULT_NAMESPACE,
};
use crate::clock::Clock;
use crate::http::{HttpTransport, REQUEST_TIMEOUT_SECS};
use crate::notify::{CrossContextNotifier, FLAG_TTL, RECENT_WINDOW};
use crate::record::RecordSchema;
use crate::revalidate::{KeyRoutes, Route, DEFAULT_COMPRESSED_FIELD};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
  pub server: ServerConfig,
  pub storage: StorageConfig,
  pub cache: CacheConfig,
  pub notify: NotifyConfig,
  /// Layout of the cached record collections
  pub records: RecordSchema,
  /// URL substring to cache key, first match wins
  pub routes: Vec<Route>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      server: ServerConfig::default(),
      storage: StorageConfig::default(),
      cache: CacheConfig::default(),
      notify: NotifyConfig::default(),
      records: RecordSchema::default(),
      routes: KeyRoutes::default().routes().to_vec(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
  /// Relative request paths are joined onto this
  pub base_url: Option<String>,
  pub timeout_secs: u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      base_url: None,
      timeout_secs: REQUEST_TIMEOUT_SECS,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
  /// SQLite file shared by every process using the same path
  #[default]
  Sqlite,
  /// Process-local, lost on exit
  Memory,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  pub backend: StorageBackend,
  /// Database file (defaults to $XDG_DATA_HOME/casecache/cache.db)
  pub path: Option<PathBuf>,
  /// Largest serialized entry the store accepts
  pub max_value_bytes: usize,
}

impl Default for StorageConfig {
  fn default() -> Self {
    Self {
      backend: StorageBackend::default(),
      path: None,
      max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub max_age_secs: u64,
  pub namespace: String,
  /// Body field holding base64 gzip data when `compressed` is set
  pub compressed_field: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_age_secs: 300,
      namespace: DEFAULT_NAMESPACE.to_string(),
      compressed_field: DEFAULT_COMPRESSED_FIELD.to_string(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
  pub flag_ttl_secs: u64,
  pub recent_window_secs: u64,
}

impl Default for NotifyConfig {
  fn default() -> Self {
    Self {
      flag_ttl_secs: FLAG_TTL.as_secs(),
      recent_window_secs: RECENT_WINDOW.as_secs(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./casecache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/casecache/config.yaml
  ///
  /// Without any file the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        tracing::debug!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("casecache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("casecache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    tracing::debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
  }

  /// Open the configured durable backend.
  pub fn open_storage(&self) -> Result<Arc<dyn DurableStore>> {
    let limit = self.storage.max_value_bytes;
    Ok(match self.storage.backend {
      StorageBackend::Memory => Arc::new(MemoryStorage::with_limit(limit)),
      StorageBackend::Sqlite => {
        let storage = match &self.storage.path {
          Some(path) => SqliteStorage::open_at(path)?,
          None => SqliteStorage::open()?,
        };
        Arc::new(storage.with_limit(limit))
      }
    })
  }

  pub fn build_store(&self, durable: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> CacheEntryStore {
    CacheEntryStore::new(durable, clock)
      .with_namespace(self.cache.namespace.clone())
      .with_max_age(chrono::Duration::seconds(self.cache.max_age_secs as i64))
  }

  pub fn build_notifier(&self, store: &CacheEntryStore) -> CrossContextNotifier {
    CrossContextNotifier::new(store)
      .with_flag_ttl(Duration::from_secs(self.notify.flag_ttl_secs))
      .with_recent_window(Duration::from_secs(self.notify.recent_window_secs))
  }

  pub fn key_routes(&self) -> KeyRoutes {
    KeyRoutes::new(self.routes.clone())
  }

  pub fn transport(&self) -> Result<HttpTransport> {
    Ok(HttpTransport::new(
      self.server.base_url.as_deref(),
      Duration::from_secs(self.server.timeout_secs),
    )?)
  }
}
