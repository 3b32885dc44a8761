//! Cross-context mutation notices.
//!
//! A mutation is announced two ways: a broadcast event for subscribers in
//! this process, and a durable "updated at" flag that other processes sharing
//! the store can see. The flag clears itself after a short TTL, so peers
//! distrust their caches only for a bounded window.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::cache::{CacheEntryStore, DurableStore, UPDATE_FLAG};
use crate::clock::Clock;
use crate::record::MutationIntent;

/// How long the durable flag stays set.
pub const FLAG_TTL: Duration = Duration::from_secs(5);

/// How long after a notice a cache hit should be distrusted.
pub const RECENT_WINDOW: Duration = Duration::from_secs(10);

/// Number of events a slow subscriber can fall behind before losing some
const EVENT_CAPACITY: usize = 64;

/// A mutation announced by this context.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEvent {
  pub timestamp: DateTime<Utc>,
  pub intent: MutationIntent,
}

impl CacheEvent {
  /// Wire form: `{timestamp, operation, ...details}`.
  pub fn to_json(&self) -> Value {
    let mut object = Map::new();
    object.insert(
      "timestamp".to_string(),
      self.timestamp.timestamp_millis().to_string().into(),
    );
    object.insert("operation".to_string(), self.intent.operation().into());
    object.extend(self.intent.details());
    Value::Object(object)
  }

  pub fn from_json(value: &Value) -> Option<Self> {
    let object = value.as_object()?;
    let timestamp = object
      .get("timestamp")
      .and_then(Value::as_str)
      .and_then(|t| t.parse::<i64>().ok())
      .and_then(DateTime::from_timestamp_millis)?;
    let operation = object.get("operation").and_then(Value::as_str)?;
    Some(Self {
      timestamp,
      intent: MutationIntent::from_notification(operation, object),
    })
  }
}

/// Publishes mutation notices to this process and to peers.
pub struct CrossContextNotifier {
  durable: Arc<dyn DurableStore>,
  clock: Arc<dyn Clock>,
  flag_key: String,
  flag_ttl: Duration,
  recent_window: Duration,
  events: broadcast::Sender<CacheEvent>,
}

impl CrossContextNotifier {
  /// Notifier sharing the durable store, clock and namespace of `store`.
  pub fn new(store: &CacheEntryStore) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      durable: Arc::clone(store.durable()),
      clock: Arc::clone(store.clock()),
      flag_key: store.meta_key(UPDATE_FLAG),
      flag_ttl: FLAG_TTL,
      recent_window: RECENT_WINDOW,
      events,
    }
  }

  pub fn with_flag_ttl(mut self, flag_ttl: Duration) -> Self {
    self.flag_ttl = flag_ttl;
    self
  }

  pub fn with_recent_window(mut self, recent_window: Duration) -> Self {
    self.recent_window = recent_window;
    self
  }

  /// Receive events for every notice raised after this call.
  pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
    self.events.subscribe()
  }

  /// Announce a mutation.
  ///
  /// Must run inside a tokio runtime for the flag to clear on schedule;
  /// without one the flag only ages out of the recent window. A runtime that
  /// shuts down before the TTL also drops the removal, so short-lived
  /// processes should use [`notify_and_wait`](Self::notify_and_wait).
  pub fn notify(&self, intent: &MutationIntent) -> CacheEvent {
    let (event, stamp) = self.announce(intent);

    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        let durable = Arc::clone(&self.durable);
        let key = self.flag_key.clone();
        let ttl = self.flag_ttl;
        handle.spawn(async move {
          tokio::time::sleep(ttl).await;
          clear_flag(durable.as_ref(), &key, &stamp);
        });
      }
      Err(_) => debug!("No async runtime, update flag will not be cleared"),
    }

    event
  }

  /// Announce a mutation and hold the caller until the flag is cleared.
  pub async fn notify_and_wait(&self, intent: &MutationIntent) -> CacheEvent {
    let (event, stamp) = self.announce(intent);
    tokio::time::sleep(self.flag_ttl).await;
    clear_flag(self.durable.as_ref(), &self.flag_key, &stamp);
    event
  }

  fn announce(&self, intent: &MutationIntent) -> (CacheEvent, String) {
    let event = CacheEvent {
      timestamp: self.clock.now(),
      intent: intent.clone(),
    };
    let stamp = event.timestamp.timestamp_millis().to_string();

    if let Err(e) = self.durable.set(&self.flag_key, stamp.as_bytes()) {
      warn!(error = %e, "Failed to set cache update flag");
    }

    // No subscribers is fine
    let _ = self.events.send(event.clone());
    debug!(operation = intent.operation(), timestamp = %stamp, "Notified cache update");
    (event, stamp)
  }

  pub fn flag_ttl(&self) -> Duration {
    self.flag_ttl
  }

  /// When the current flag was set, if it is set.
  pub fn peer_update(&self) -> Option<DateTime<Utc>> {
    let bytes = match self.durable.get(&self.flag_key) {
      Ok(bytes) => bytes?,
      Err(e) => {
        warn!(error = %e, "Failed to read cache update flag");
        return None;
      }
    };
    String::from_utf8(bytes)
      .ok()
      .and_then(|s| s.parse::<i64>().ok())
      .and_then(DateTime::from_timestamp_millis)
  }

  /// True while a notice from any context is younger than the recent window.
  pub fn is_recently_notified(&self) -> bool {
    let Some(updated_at) = self.peer_update() else {
      return false;
    };
    match (self.clock.now() - updated_at).to_std() {
      Ok(age) => age < self.recent_window,
      // Flag from a clock ahead of ours
      Err(_) => true,
    }
  }
}

/// Remove the flag unless a newer notice replaced it.
fn clear_flag(durable: &dyn DurableStore, key: &str, stamp: &str) {
  match durable.get(key) {
    Ok(Some(current)) if current == stamp.as_bytes() => match durable.delete(key) {
      Ok(()) => debug!("Cleared cache update flag"),
      Err(e) => warn!(error = %e, "Failed to clear cache update flag"),
    },
    Ok(_) => {}
    Err(e) => warn!(error = %e, "Failed to read cache update flag"),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::clock::ManualClock;
  use serde_json::json;

  fn setup() -> (CrossContextNotifier, Arc<ManualClock>, CacheEntryStore) {
    let clock = Arc::new(ManualClock::default());
    let store = CacheEntryStore::new(Arc::new(MemoryStorage::new()), clock.clone());
    (CrossContextNotifier::new(&store), clock, store)
  }

  fn delete_intent() -> MutationIntent {
    MutationIntent::Delete {
      unique_key: "A".to_string(),
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_flag_clears_after_ttl() {
    let (notifier, clock, _store) = setup();

    notifier.notify(&delete_intent());
    assert!(notifier.is_recently_notified());

    tokio::time::sleep(Duration::from_secs(6)).await;
    clock.advance(chrono::Duration::seconds(6));

    assert!(notifier.peer_update().is_none());
    assert!(!notifier.is_recently_notified());
  }

  #[test]
  fn test_window_expires_without_runtime() {
    let (notifier, clock, _store) = setup();

    notifier.notify(&delete_intent());
    clock.advance(chrono::Duration::seconds(7));
    assert!(notifier.is_recently_notified());

    clock.advance(chrono::Duration::seconds(4));
    assert!(!notifier.is_recently_notified());
  }

  #[tokio::test(start_paused = true)]
  async fn test_newer_flag_survives_older_timer() {
    let (notifier, clock, _store) = setup();

    notifier.notify(&delete_intent());
    tokio::time::sleep(Duration::from_secs(3)).await;
    clock.advance(chrono::Duration::seconds(3));
    let second = notifier.notify(&delete_intent());

    // First timer fires at 5s and must leave the second flag alone
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert_eq!(
      notifier.peer_update().map(|t| t.timestamp_millis()),
      Some(second.timestamp.timestamp_millis())
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_notify_and_wait_leaves_no_flag() {
    let (notifier, _clock, _store) = setup();
    let mut rx = notifier.subscribe();

    let event = notifier.notify_and_wait(&delete_intent()).await;

    assert_eq!(rx.recv().await.unwrap(), event);
    assert!(notifier.peer_update().is_none());
    assert!(!notifier.is_recently_notified());
  }

  #[tokio::test]
  async fn test_clearing_the_store_drops_the_flag() {
    let (notifier, _clock, store) = setup();

    notifier.notify(&delete_intent());
    assert!(notifier.peer_update().is_some());

    store.clear();
    assert!(notifier.peer_update().is_none());
    assert!(!notifier.is_recently_notified());
  }

  #[tokio::test]
  async fn test_subscribers_receive_events() {
    let (notifier, clock, _store) = setup();
    let mut rx = notifier.subscribe();

    let intent = MutationIntent::Update {
      unique_key: "A".to_string(),
      patch: json!({"status": "closed"}).as_object().cloned().unwrap(),
    };
    notifier.notify(&intent);

    let event = rx.recv().await.unwrap();
    assert_eq!(event.intent, intent);
    assert_eq!(event.timestamp, clock.now());
  }

  #[test]
  fn test_event_json_shape() {
    let at = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
    let event = CacheEvent {
      timestamp: at,
      intent: delete_intent(),
    };

    let value = event.to_json();
    assert_eq!(
      value,
      json!({"timestamp": "1700000000000", "operation": "delete", "uniqueKey": "A"})
    );
    assert_eq!(CacheEvent::from_json(&value), Some(event));
  }
}
