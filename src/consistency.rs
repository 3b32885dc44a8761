//! Keeps cached collections consistent with single-record changes.
//!
//! Deltas are applied in place so a one-record change does not cost a full
//! refetch. Every operation answers `true` when the cache now reflects the
//! change and `false` when the caller has to reload the whole collection.

use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::CacheEntryStore;
use crate::error::Result;
use crate::notify::{CacheEvent, CrossContextNotifier};
use crate::optimistic::{accept, MutationResponse, OptimisticUpdateManager};
use crate::record::{MutationIntent, Record, RecordSchema};

pub struct ConsistencyCoordinator {
  store: Arc<CacheEntryStore>,
  optimistic: OptimisticUpdateManager,
  notifier: Arc<CrossContextNotifier>,
  schema: RecordSchema,
}

impl ConsistencyCoordinator {
  pub fn new(store: Arc<CacheEntryStore>, notifier: Arc<CrossContextNotifier>) -> Self {
    Self {
      optimistic: OptimisticUpdateManager::new(Arc::clone(&store)),
      store,
      notifier,
      schema: RecordSchema::default(),
    }
  }

  pub fn with_schema(mut self, schema: RecordSchema) -> Self {
    self.schema = schema;
    self
  }

  pub fn schema(&self) -> &RecordSchema {
    &self.schema
  }

  pub fn store(&self) -> &Arc<CacheEntryStore> {
    &self.store
  }

  pub fn notifier(&self) -> &Arc<CrossContextNotifier> {
    &self.notifier
  }

  /// Append `record` to the collection cached under `key`.
  pub fn add_record(&self, key: &str, record: Record) -> bool {
    self.apply_intent(key, &MutationIntent::Add(record))
  }

  /// Merge `patch` into the record identified by `unique_key`.
  pub fn update_record(&self, key: &str, unique_key: &str, patch: Record) -> bool {
    self.apply_intent(
      key,
      &MutationIntent::Update {
        unique_key: unique_key.to_string(),
        patch,
      },
    )
  }

  pub fn remove_record(&self, key: &str, unique_key: &str) -> bool {
    self.apply_intent(
      key,
      &MutationIntent::Delete {
        unique_key: unique_key.to_string(),
      },
    )
  }

  /// Apply a notice received by name, as peers send them.
  pub fn apply_notification(&self, key: &str, operation: &str, details: &Map<String, Value>) -> bool {
    self.apply_intent(key, &MutationIntent::from_notification(operation, details))
  }

  pub fn apply_event(&self, key: &str, event: &CacheEvent) -> bool {
    self.apply_intent(key, &event.intent)
  }

  /// Apply `intent` to the cached collection. An `Unknown` intent clears
  /// the whole cache.
  pub fn apply_intent(&self, key: &str, intent: &MutationIntent) -> bool {
    if let MutationIntent::Unknown { operation } = intent {
      warn!(key = key, operation = %operation, "Unrecognized cache update, clearing cache");
      self.store.clear();
      return false;
    }

    let Some(mut data) = self.store.get::<Value>(key, None) else {
      info!(
        key = key,
        operation = intent.operation(),
        "No cached collection, full reload required"
      );
      return false;
    };

    if !self.schema.apply(&mut data, intent) {
      info!(
        key = key,
        operation = intent.operation(),
        "Record change not applicable, full reload required"
      );
      return false;
    }

    self.schema.stamp(&mut data, self.store.clock().now());
    self.store.set(key, &data, None, false);
    debug!(
      key = key,
      operation = intent.operation(),
      records = self.schema.records(&data).len(),
      "Applied record change"
    );
    true
  }

  /// Whether a cache hit for `key` can be used without revalidating:
  /// the entry is fresh and no context announced a change recently.
  pub fn is_trustworthy(&self, key: &str) -> bool {
    self.store.is_fresh(key) && !self.notifier.is_recently_notified()
  }

  /// Perform a mutation end to end.
  ///
  /// When the change applies to the cached collection it is shown
  /// immediately and rolled back if the server refuses it. When it does not
  /// apply, the server call runs alone and the collection is dropped on
  /// success so the next read reloads it. Successful mutations are announced
  /// to other contexts.
  ///
  /// The server may answer with the stored record, which replaces the local
  /// guess, or with the whole collection. Either way the returned response
  /// carries the server's payload unchanged.
  pub async fn mutate<M, Fut>(
    &self,
    key: &str,
    intent: MutationIntent,
    server_mutation: M,
  ) -> Result<MutationResponse>
  where
    M: FnOnce() -> Fut,
    Fut: Future<Output = Result<MutationResponse>>,
  {
    let base = self.store.get::<Value>(key, None);
    let applies = base.as_ref().is_some_and(|data| {
      let mut probe = data.clone();
      self.schema.apply(&mut probe, &intent)
    });

    let response = match base {
      Some(base) if applies => {
        let now = self.store.clock().now();
        let transform = |data: &Value| {
          let mut data = data.clone();
          self.schema.apply(&mut data, &intent);
          self.schema.stamp(&mut data, now);
          data
        };
        let intent = &intent;
        let mut server_data = None;
        let slot = &mut server_data;
        // The manager commits `data`, so it gets the reconciled collection
        let confirmed = || async move {
          let mut response = server_mutation().await?;
          if response.success {
            *slot = response.data.clone();
            response.data = response
              .data
              .take()
              .and_then(|data| self.reconcile(base, intent, data));
          }
          Ok(response)
        };
        let mut response = self.optimistic.optimistic_update(key, transform, confirmed).await?;
        response.data = server_data;
        response
      }
      _ => {
        let response = accept(server_mutation().await?)?;
        if self.store.entry(key).is_some() {
          info!(
            key = key,
            operation = intent.operation(),
            "Change not applicable to cache, dropping collection"
          );
          self.store.delete(key);
        }
        response
      }
    };

    self.notifier.notify(&intent);
    Ok(response)
  }

  /// Turn the server's answer into the authoritative collection.
  ///
  /// A record replaces the local guess for that record; a whole collection
  /// is taken as is. Anything else keeps the local value.
  fn reconcile(&self, base: Value, intent: &MutationIntent, data: Value) -> Option<Value> {
    let record = data
      .as_object()
      .filter(|r| self.schema.unique_key(r).is_some())
      .cloned();
    let confirmed = match (intent, record) {
      (MutationIntent::Add(_), Some(record)) => MutationIntent::Add(record),
      (MutationIntent::Update { unique_key, .. }, Some(record)) => MutationIntent::Update {
        unique_key: unique_key.clone(),
        patch: record,
      },
      _ if self.is_collection(&data) => return Some(data),
      _ => return None,
    };

    let mut merged = base;
    if !self.schema.apply(&mut merged, &confirmed) {
      return None;
    }
    self.schema.stamp(&mut merged, self.store.clock().now());
    Some(merged)
  }

  fn is_collection(&self, data: &Value) -> bool {
    match &self.schema.list_field {
      None => data.is_array(),
      Some(field) => data.get(field.as_str()).is_some_and(Value::is_array),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, Version};
  use crate::clock::{Clock, ManualClock};
  use crate::error::Error;
  use serde_json::json;

  fn setup() -> ConsistencyCoordinator {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(CacheEntryStore::new(Arc::new(MemoryStorage::new()), clock));
    let notifier = Arc::new(CrossContextNotifier::new(&store));
    ConsistencyCoordinator::new(store, notifier)
  }

  fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
  }

  fn cases(coordinator: &ConsistencyCoordinator) -> Option<Value> {
    coordinator.store().get::<Value>("cases", None)
  }

  #[test]
  fn test_update_on_empty_base_leaves_store_untouched() {
    let coordinator = setup();

    assert!(!coordinator.update_record("cases", "A", record(json!({"status": "closed"}))));
    assert!(coordinator.store().entry("cases").is_none());
    assert_eq!(coordinator.store().stats().durable_entries, 0);
  }

  #[test]
  fn test_removing_missing_key_fails_repeatedly() {
    let coordinator = setup();
    coordinator
      .store()
      .set("cases", &json!([{"uniqueKey": "A"}]), None, false);

    assert!(!coordinator.remove_record("cases", "missing-key"));
    assert!(!coordinator.remove_record("cases", "missing-key"));
    assert_eq!(cases(&coordinator), Some(json!([{"uniqueKey": "A"}])));
  }

  #[test]
  fn test_add_update_remove_in_place() {
    let coordinator = setup();
    let store = coordinator.store().clone();
    store.set("cases", &json!([{"uniqueKey": "A", "status": "open"}]), Some(Version::from("v0")), false);

    assert!(coordinator.add_record("cases", record(json!({"uniqueKey": "B", "status": "open"}))));
    assert_ne!(store.entry("cases").unwrap().version, Version::from("v0"));

    assert!(coordinator.update_record("cases", "A", record(json!({"status": "closed"}))));
    assert!(coordinator.remove_record("cases", "B"));

    assert_eq!(cases(&coordinator), Some(json!([{"uniqueKey": "A", "status": "closed"}])));
  }

  #[test]
  fn test_add_without_collection_or_key_fails() {
    let coordinator = setup();
    assert!(!coordinator.add_record("cases", record(json!({"uniqueKey": "A"}))));

    coordinator.store().set("cases", &json!([]), None, false);
    assert!(!coordinator.add_record("cases", record(json!({"status": "open"}))));
    assert!(!coordinator.update_record("cases", "", record(json!({"status": "x"}))));
  }

  #[test]
  fn test_dashboard_payload_is_stamped() {
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(CacheEntryStore::new(Arc::new(MemoryStorage::new()), clock.clone()));
    let notifier = Arc::new(CrossContextNotifier::new(&store));
    let coordinator =
      ConsistencyCoordinator::new(store.clone(), notifier).with_schema(RecordSchema::dashboard());
    store.set("dashboard", &json!({"cases": [], "total": 0}), None, false);

    assert!(coordinator.add_record("dashboard", record(json!({"cnr_number": "C1"}))));

    let data = store.get::<Value>("dashboard", None).unwrap();
    assert_eq!(data["cases"], json!([{"cnr_number": "C1"}]));
    assert_eq!(data["lastUpdated"], json!(clock.now().timestamp_millis()));
  }

  #[test]
  fn test_notification_dispatch() {
    let coordinator = setup();
    coordinator
      .store()
      .set("cases", &json!([{"uniqueKey": "A", "status": "open"}]), None, false);

    let details = record(json!({"uniqueKey": "A", "patch": {"status": "closed"}}));
    assert!(coordinator.apply_notification("cases", "update", &details));
    assert_eq!(cases(&coordinator), Some(json!([{"uniqueKey": "A", "status": "closed"}])));
  }

  #[test]
  fn test_unknown_or_incomplete_notification_clears_cache() {
    let coordinator = setup();
    coordinator.store().set("cases", &json!([{"uniqueKey": "A"}]), None, false);
    coordinator.store().set("clients", &json!([]), None, false);

    // "delete" without a key cannot be applied as a delta
    assert!(!coordinator.apply_notification("cases", "delete", &Map::new()));
    assert_eq!(cases(&coordinator), None);
    assert_eq!(coordinator.store().get::<Value>("clients", None), None);

    coordinator.store().set("cases", &json!([]), None, false);
    assert!(!coordinator.apply_notification("cases", "archive", &Map::new()));
    assert_eq!(cases(&coordinator), None);
  }

  #[tokio::test]
  async fn test_mutate_rollback_on_rejection() {
    let coordinator = setup();
    let original = json!([{"uniqueKey": "A", "status": "open"}]);
    coordinator.store().set("cases", &original, None, false);
    let mut events = coordinator.notifier().subscribe();

    let result = coordinator
      .mutate(
        "cases",
        MutationIntent::Update {
          unique_key: "A".to_string(),
          patch: record(json!({"status": "closed"})),
        },
        || async { Ok(MutationResponse::rejected("locked")) },
      )
      .await;

    assert!(matches!(result, Err(Error::Rejected(_))));
    assert_eq!(cases(&coordinator), Some(original));
    assert!(events.try_recv().is_err());
    assert!(!coordinator.notifier().is_recently_notified());
  }

  #[tokio::test]
  async fn test_mutate_commits_server_record_and_notifies() {
    let coordinator = setup();
    coordinator.store().set("cases", &json!([{"uniqueKey": "A"}]), None, false);
    let mut events = coordinator.notifier().subscribe();

    let intent = MutationIntent::Add(record(json!({"uniqueKey": "B", "status": "draft"})));
    let response = coordinator
      .mutate("cases", intent.clone(), || async {
        Ok(MutationResponse::ok(json!({"uniqueKey": "B", "status": "filed", "id": 7})))
      })
      .await
      .unwrap();

    assert_eq!(
      response.data,
      Some(json!({"uniqueKey": "B", "status": "filed", "id": 7}))
    );
    assert_eq!(
      cases(&coordinator),
      Some(json!([{"uniqueKey": "A"}, {"uniqueKey": "B", "status": "filed", "id": 7}]))
    );
    assert_eq!(events.recv().await.unwrap().intent, intent);
    assert!(coordinator.notifier().is_recently_notified());
    assert!(!coordinator.is_trustworthy("cases"));
  }

  #[tokio::test]
  async fn test_mutate_returns_unreconciled_server_payload() {
    let coordinator = setup();
    coordinator
      .store()
      .set("cases", &json!([{"uniqueKey": "A"}, {"uniqueKey": "B"}]), None, false);

    let response = coordinator
      .mutate(
        "cases",
        MutationIntent::Delete {
          unique_key: "B".to_string(),
        },
        || async { Ok(MutationResponse::ok(json!({"uniqueKey": "B", "deleted": true}))) },
      )
      .await
      .unwrap();

    assert_eq!(response.data, Some(json!({"uniqueKey": "B", "deleted": true})));
    assert_eq!(cases(&coordinator), Some(json!([{"uniqueKey": "A"}])));
  }

  #[tokio::test]
  async fn test_peer_event_applies_to_own_cache() {
    let clock = Arc::new(ManualClock::default());
    let durable = Arc::new(MemoryStorage::new());
    let ours = setup();
    let store = Arc::new(CacheEntryStore::new(durable, clock));
    let theirs = ConsistencyCoordinator::new(store.clone(), Arc::new(CrossContextNotifier::new(&store)));
    store.set("cases", &json!([{"uniqueKey": "A", "status": "open"}]), None, false);

    let mut events = ours.notifier().subscribe();
    ours.notifier().notify(&MutationIntent::Update {
      unique_key: "A".to_string(),
      patch: record(json!({"status": "closed"})),
    });
    let event = events.recv().await.unwrap();

    assert!(theirs.apply_event("cases", &event));
    assert_eq!(
      store.get::<Value>("cases", None),
      Some(json!([{"uniqueKey": "A", "status": "closed"}]))
    );
  }

  #[tokio::test]
  async fn test_mutate_without_applicable_cache_drops_collection() {
    let coordinator = setup();
    coordinator.store().set("cases", &json!([{"uniqueKey": "A"}]), None, false);

    coordinator
      .mutate(
        "cases",
        MutationIntent::Delete {
          unique_key: "not-cached".to_string(),
        },
        || async { Ok(MutationResponse::confirmed()) },
      )
      .await
      .unwrap();

    assert!(coordinator.store().entry("cases").is_none());
  }

  #[test]
  fn test_trustworthy_requires_fresh_entry() {
    let coordinator = setup();
    assert!(!coordinator.is_trustworthy("cases"));

    coordinator.store().set("cases", &json!([]), None, false);
    assert!(coordinator.is_trustworthy("cases"));
  }
}
