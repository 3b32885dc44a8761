//! Two-tier entry store: an in-memory map written through to a durable store.

use chrono::Duration;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use super::entry::{CacheEntry, Version};
use super::storage::DurableStore;
use crate::clock::Clock;

/// Default namespace for durable keys.
pub const DEFAULT_NAMESPACE: &str = "legal";

/// Logical keys the dashboard pages share.
pub const WELL_KNOWN_KEYS: &[&str] = &["dashboard", "cases", "clients", "calendar-events"];

/// Marker holding the version of the most recent write.
const CACHE_VERSION_MARKER: &str = "cache_version";

/// Marker set by a notifier while a recent mutation should be distrusted.
pub const UPDATE_FLAG: &str = "cache_updated";

/// Manages cache entries across the in-memory and durable tiers.
///
/// The in-memory tier is authoritative when it holds a key. Every write goes
/// to both tiers; storage failures are logged and never returned.
pub struct CacheEntryStore {
  memory: Mutex<HashMap<String, CacheEntry>>,
  durable: Arc<dyn DurableStore>,
  clock: Arc<dyn Clock>,
  namespace: String,
  /// How long before cached data is considered stale
  max_age: Duration,
}

impl CacheEntryStore {
  pub fn new(durable: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
    Self {
      memory: Mutex::new(HashMap::new()),
      durable,
      clock,
      namespace: DEFAULT_NAMESPACE.to_string(),
      max_age: Duration::minutes(5),
    }
  }

  pub fn with_max_age(mut self, max_age: Duration) -> Self {
    self.max_age = max_age;
    self
  }

  pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
    self.namespace = namespace.into();
    self
  }

  pub fn max_age(&self) -> Duration {
    self.max_age
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  pub fn clock(&self) -> &Arc<dyn Clock> {
    &self.clock
  }

  pub fn durable(&self) -> &Arc<dyn DurableStore> {
    &self.durable
  }

  fn entry_prefix(&self) -> String {
    format!("{}:entry:", self.namespace)
  }

  /// Durable key for a logical cache key.
  pub fn storage_key(&self, key: &str) -> String {
    format!("{}{}", self.entry_prefix(), key)
  }

  /// Durable key for namespace-level metadata.
  pub fn meta_key(&self, name: &str) -> String {
    format!("{}:meta:{}", self.namespace, name)
  }

  fn memory(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
    self.memory.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Store `data` under `key` as a fresh entry.
  ///
  /// The version defaults to the current time.
  pub fn set<T: Serialize>(
    &self,
    key: &str,
    data: &T,
    version: Option<Version>,
    compressed: bool,
  ) {
    match serde_json::to_value(data) {
      Ok(value) => self.set_revalidated(key, value, version, compressed, None),
      Err(e) => warn!(key = key, error = %e, "Failed to serialize data for cache"),
    }
  }

  /// Store a server response together with its freshness token.
  pub fn set_revalidated(
    &self,
    key: &str,
    data: Value,
    version: Option<Version>,
    compressed: bool,
    freshness_token: Option<String>,
  ) {
    let now = self.clock.now();
    let mut entry = CacheEntry::new(key, data, version.unwrap_or_else(|| Version::at(now)), now);
    entry.compressed = compressed;
    entry.freshness_token = freshness_token;
    self.write(entry);
  }

  /// Write an entry back exactly as given, e.g. a pre-mutation snapshot.
  pub fn restore(&self, entry: CacheEntry) {
    self.write(entry);
  }

  fn write(&self, entry: CacheEntry) {
    let key = entry.key.clone();
    let version = entry.version.clone();
    let storage_key = self.storage_key(&key);

    let bytes = serde_json::to_vec(&entry);
    self.memory().insert(key.clone(), entry);

    let persisted = match bytes {
      Ok(bytes) => self.durable.set(&storage_key, &bytes),
      Err(e) => Err(e.into()),
    };

    match persisted {
      Ok(()) => {
        if let Err(e) = self
          .durable
          .set(&self.meta_key(CACHE_VERSION_MARKER), version.as_str().as_bytes())
        {
          warn!(error = %e, "Failed to update cache version marker");
        }
        debug!(key = %key, version = %version, "Cached entry");
      }
      Err(e) => {
        warn!(key = %key, backend = self.durable.name(), error = %e, "Failed to persist cache entry");
        // Drop the older durable copy so it cannot outlive this write
        if let Err(e) = self.durable.delete(&storage_key) {
          warn!(key = %key, error = %e, "Failed to remove outdated durable entry");
        }
      }
    }
  }

  /// Load the raw entry for `key`, stale or not.
  ///
  /// Falls back to the durable tier on a memory miss and warms memory with
  /// what it finds. Malformed durable values read as absent.
  pub fn entry(&self, key: &str) -> Option<CacheEntry> {
    if let Some(entry) = self.memory().get(key) {
      return Some(entry.clone());
    }

    let bytes = match self.durable.get(&self.storage_key(key)) {
      Ok(Some(bytes)) => bytes,
      Ok(None) => return None,
      Err(e) => {
        warn!(key = key, error = %e, "Failed to load cache entry");
        return None;
      }
    };

    match serde_json::from_slice::<CacheEntry>(&bytes) {
      Ok(entry) => {
        self.memory().insert(key.to_string(), entry.clone());
        Some(entry)
      }
      Err(e) => {
        warn!(key = key, error = %e, "Discarding malformed cache entry");
        None
      }
    }
  }

  /// The entry for `key` if it is fresh and matches `required_version`.
  pub fn fresh_entry(&self, key: &str, required_version: Option<&Version>) -> Option<CacheEntry> {
    let Some(entry) = self.entry(key) else {
      debug!(key = key, "Cache miss");
      return None;
    };

    let now = self.clock.now();
    if entry.is_stale(now, self.max_age) {
      debug!(
        key = key,
        age_secs = entry.age(now).num_seconds(),
        "Cache expired"
      );
      return None;
    }

    if let Some(required) = required_version {
      if &entry.version != required {
        debug!(
          key = key,
          cached = %entry.version,
          required = %required,
          "Cache version mismatch"
        );
        return None;
      }
    }

    debug!(key = key, version = %entry.version, "Cache hit");
    Some(entry)
  }

  /// Cached data for `key`, or `None` when missing, stale or mismatched.
  pub fn get<T: DeserializeOwned>(&self, key: &str, required_version: Option<&Version>) -> Option<T> {
    let entry = self.fresh_entry(key, required_version)?;
    match serde_json::from_value(entry.data) {
      Ok(data) => Some(data),
      Err(e) => {
        warn!(key = key, error = %e, "Cached data has an unexpected shape");
        None
      }
    }
  }

  pub fn is_fresh(&self, key: &str) -> bool {
    self.fresh_entry(key, None).is_some()
  }

  /// Restart the age of an entry the server just confirmed unchanged.
  pub fn touch(&self, key: &str) -> bool {
    match self.entry(key) {
      Some(mut entry) => {
        entry.created_at = self.clock.now();
        self.write(entry);
        true
      }
      None => false,
    }
  }

  pub fn delete(&self, key: &str) {
    self.memory().remove(key);
    if let Err(e) = self.durable.delete(&self.storage_key(key)) {
      warn!(key = key, error = %e, "Failed to delete durable cache entry");
    }
    debug!(key = key, "Deleted cache entry");
  }

  /// Remove every entry of this namespace from both tiers, along with the
  /// version marker and any pending update flag.
  pub fn clear(&self) {
    let mut keys: Vec<String> = self
      .memory()
      .drain()
      .map(|(key, _)| self.storage_key(&key))
      .collect();

    match self.durable.keys(&self.entry_prefix()) {
      Ok(durable_keys) => keys.extend(durable_keys),
      Err(e) => warn!(error = %e, "Failed to list durable cache entries"),
    }
    keys.extend(WELL_KNOWN_KEYS.iter().map(|k| self.storage_key(k)));
    keys.push(self.meta_key(CACHE_VERSION_MARKER));
    keys.push(self.meta_key(UPDATE_FLAG));
    keys.sort();
    keys.dedup();

    for key in &keys {
      if let Err(e) = self.durable.delete(key) {
        warn!(key = %key, error = %e, "Failed to clear durable key");
      }
    }
    debug!(removed = keys.len(), "Cleared cache");
  }

  /// Version of the most recent write in any context sharing the store.
  pub fn cache_version(&self) -> Option<Version> {
    match self.durable.get(&self.meta_key(CACHE_VERSION_MARKER)) {
      Ok(Some(bytes)) => String::from_utf8(bytes).ok().map(Version::from),
      Ok(None) => None,
      Err(e) => {
        warn!(error = %e, "Failed to read cache version marker");
        None
      }
    }
  }

  /// Describe every entry in either tier. Memory copies win over durable
  /// ones for the per-entry details.
  pub fn stats(&self) -> CacheStats {
    let now = self.clock.now();
    let mut known: HashMap<String, CacheEntry> = self.memory().clone();
    let memory_entries = known.len();

    let mut durable_entries = 0;
    let mut total_bytes = 0;
    let prefix = self.entry_prefix();
    match self.durable.keys(&prefix) {
      Ok(keys) => {
        for storage_key in keys {
          let bytes = match self.durable.get(&storage_key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            Err(e) => {
              warn!(key = %storage_key, error = %e, "Failed to read entry for stats");
              continue;
            }
          };
          durable_entries += 1;
          total_bytes += bytes.len();

          let key = storage_key[prefix.len()..].to_string();
          if known.contains_key(&key) {
            continue;
          }
          match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) => {
              known.insert(key, entry);
            }
            Err(e) => warn!(key = %key, error = %e, "Malformed entry in durable store"),
          }
        }
      }
      Err(e) => warn!(error = %e, "Failed to list durable cache entries"),
    }

    let mut entries: Vec<EntryStats> = known
      .into_iter()
      .map(|(key, entry)| EntryStats {
        key,
        age: entry.age(now),
        stale: entry.is_stale(now, self.max_age),
        version: entry.version,
        compressed: entry.compressed,
      })
      .collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));

    CacheStats {
      memory_entries,
      durable_entries,
      total_bytes,
      entries,
    }
  }
}

/// Snapshot of what the cache currently holds.
#[derive(Debug, Clone)]
pub struct CacheStats {
  pub memory_entries: usize,
  pub durable_entries: usize,
  /// Serialized size of all durable entries
  pub total_bytes: usize,
  pub entries: Vec<EntryStats>,
}

#[derive(Debug, Clone)]
pub struct EntryStats {
  pub key: String,
  pub version: Version,
  pub age: Duration,
  pub compressed: bool,
  pub stale: bool,
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::MemoryStorage;
  use crate::clock::ManualClock;
  use serde_json::json;

  fn setup() -> (CacheEntryStore, Arc<MemoryStorage>, Arc<ManualClock>) {
    let durable = Arc::new(MemoryStorage::new());
    let clock = Arc::new(ManualClock::default());
    let store = CacheEntryStore::new(durable.clone(), clock.clone());
    (store, durable, clock)
  }

  #[test]
  fn test_set_then_get_round_trips() {
    let (store, _, _) = setup();
    let cases = json!([{"uniqueKey": "A", "status": "open"}]);

    store.set("cases", &cases, None, false);

    assert_eq!(store.get::<Value>("cases", None), Some(cases));
  }

  #[test]
  fn test_get_warms_memory_from_durable_tier() {
    let (store, durable, clock) = setup();
    store.set("cases", &json!([1, 2]), Some(Version::from("v1")), false);

    // A second store over the same durable tier starts with cold memory
    let other = CacheEntryStore::new(durable.clone(), clock.clone());
    assert_eq!(other.get::<Vec<i32>>("cases", None), Some(vec![1, 2]));
    assert_eq!(other.stats().memory_entries, 1);
  }

  #[test]
  fn test_expired_entry_reads_as_miss_but_keeps_bytes() {
    let (store, durable, clock) = setup();
    store.set("cases", &json!(["a"]), None, false);

    clock.advance(Duration::minutes(5) + Duration::seconds(1));

    assert_eq!(store.get::<Value>("cases", None), None);
    assert!(durable.get(&store.storage_key("cases")).unwrap().is_some());
    assert!(store.entry("cases").is_some());
  }

  #[test]
  fn test_version_gate() {
    let (store, _, clock) = setup();
    store.set("cases", &json!([1]), Some(Version::from("v2")), false);

    assert_eq!(store.get::<Value>("cases", Some(&Version::from("v1"))), None);
    assert_eq!(
      store.get::<Value>("cases", Some(&Version::from("v2"))),
      Some(json!([1]))
    );

    // A matching version does not rescue an expired entry
    clock.advance(Duration::minutes(6));
    assert_eq!(store.get::<Value>("cases", Some(&Version::from("v2"))), None);
    assert!(store.entry("cases").is_some());
  }

  #[test]
  fn test_default_version_follows_clock() {
    let (store, _, clock) = setup();
    store.set("cases", &json!([]), None, false);

    let entry = store.entry("cases").unwrap();
    assert_eq!(entry.version, Version::at(clock.now()));
    assert_eq!(store.cache_version(), Some(entry.version));
  }

  #[test]
  fn test_malformed_durable_entry_is_a_miss() {
    let (store, durable, _) = setup();
    durable
      .set(&store.storage_key("cases"), b"{not json")
      .unwrap();

    assert_eq!(store.get::<Value>("cases", None), None);
  }

  #[test]
  fn test_quota_failure_is_swallowed_and_keeps_memory() {
    let durable = Arc::new(MemoryStorage::with_limit(16));
    let clock = Arc::new(ManualClock::default());
    let store = CacheEntryStore::new(durable.clone(), clock);

    store.set("cases", &json!(["a long enough payload to overflow"]), None, false);

    assert!(durable.get(&store.storage_key("cases")).unwrap().is_none());
    assert!(store.get::<Value>("cases", None).is_some());
  }

  #[test]
  fn test_delete_and_clear_remove_both_tiers() {
    let (store, durable, _) = setup();
    store.set("cases", &json!([1]), None, false);
    store.set("clients", &json!([2]), None, false);
    store.set("custom", &json!([3]), None, false);

    store.delete("cases");
    assert_eq!(store.get::<Value>("cases", None), None);
    assert!(durable.get(&store.storage_key("cases")).unwrap().is_none());

    durable.set(&store.meta_key(UPDATE_FLAG), b"1700000000000").unwrap();
    store.clear();
    assert_eq!(store.get::<Value>("clients", None), None);
    assert_eq!(store.get::<Value>("custom", None), None);
    assert!(durable.keys("legal:").unwrap().is_empty());
  }

  #[test]
  fn test_touch_refreshes_age_only() {
    let (store, _, clock) = setup();
    store.set("cases", &json!([1]), Some(Version::from("v1")), false);
    clock.advance(Duration::minutes(10));
    assert!(!store.is_fresh("cases"));

    assert!(store.touch("cases"));
    let entry = store.fresh_entry("cases", None).unwrap();
    assert_eq!(entry.version, Version::from("v1"));
    assert!(!store.touch("missing"));
  }

  #[test]
  fn test_stats_report_entries() {
    let (store, _, clock) = setup();
    store.set("cases", &json!([1]), None, true);
    clock.advance(Duration::seconds(30));

    let stats = store.stats();
    assert_eq!(stats.memory_entries, 1);
    assert_eq!(stats.durable_entries, 1);
    assert!(stats.total_bytes > 0);
    assert_eq!(stats.entries[0].key, "cases");
    assert_eq!(stats.entries[0].age, Duration::seconds(30));
    assert!(stats.entries[0].compressed);
    assert!(!stats.entries[0].stale);
  }

  #[test]
  fn test_stats_include_entries_only_on_disk() {
    let (store, durable, clock) = setup();
    store.set("cases", &json!([1]), None, false);

    // A second process sharing the durable store sees the entry without
    // having read it
    let peer = CacheEntryStore::new(durable, clock);
    let stats = peer.stats();
    assert_eq!(stats.memory_entries, 0);
    assert_eq!(stats.durable_entries, 1);
    assert_eq!(stats.entries.len(), 1);
    assert_eq!(stats.entries[0].key, "cases");
  }
}
