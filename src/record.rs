//! List-shaped records and the deltas applied to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A record is a JSON object carrying a unique key field.
pub type Record = Map<String, Value>;

/// Where records live inside a cached payload and which field identifies them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSchema {
  /// Field holding each record's unique key
  #[serde(default = "default_key_field")]
  pub key_field: String,
  /// Field of the payload object holding the record list.
  /// `None` means the payload itself is the list.
  #[serde(default)]
  pub list_field: Option<String>,
}

fn default_key_field() -> String {
  "uniqueKey".to_string()
}

impl Default for RecordSchema {
  fn default() -> Self {
    Self {
      key_field: default_key_field(),
      list_field: None,
    }
  }
}

/// Field stamped on object payloads after an in-place change
const LAST_UPDATED_FIELD: &str = "lastUpdated";

impl RecordSchema {
  /// Layout of the dashboard payload: cases keyed by CNR number.
  pub fn dashboard() -> Self {
    Self {
      key_field: "cnr_number".to_string(),
      list_field: Some("cases".to_string()),
    }
  }

  pub fn unique_key<'a>(&self, record: &'a Record) -> Option<&'a str> {
    record
      .get(&self.key_field)
      .and_then(Value::as_str)
      .filter(|k| !k.is_empty())
  }

  fn value_key<'a>(&self, value: &'a Value) -> Option<&'a str> {
    value.as_object().and_then(|r| self.unique_key(r))
  }

  fn records_mut<'a>(&self, data: &'a mut Value) -> Option<&'a mut Vec<Value>> {
    match &self.list_field {
      None => data.as_array_mut(),
      Some(field) => data.get_mut(field.as_str()).and_then(Value::as_array_mut),
    }
  }

  /// Records of a payload, skipping anything that is not an object.
  pub fn records<'a>(&self, data: &'a Value) -> Vec<&'a Record> {
    let list = match &self.list_field {
      None => data.as_array(),
      Some(field) => data.get(field.as_str()).and_then(Value::as_array),
    };
    list
      .map(|l| l.iter().filter_map(Value::as_object).collect())
      .unwrap_or_default()
  }

  /// Append a record. Fails on a missing list, a keyless record or a
  /// key that is already present.
  pub fn add(&self, data: &mut Value, record: Record) -> bool {
    let Some(key) = self.unique_key(&record).map(str::to_string) else {
      return false;
    };
    let Some(records) = self.records_mut(data) else {
      return false;
    };
    let duplicate = records.iter().any(|r| self.value_key(r) == Some(key.as_str()));
    if duplicate {
      return false;
    }
    records.push(Value::Object(record));
    true
  }

  /// Shallow-merge `patch` into the record with `unique_key`; patch fields
  /// win, except the key field which keeps the record's identity.
  pub fn update(&self, data: &mut Value, unique_key: &str, patch: &Record) -> bool {
    let Some(records) = self.records_mut(data) else {
      return false;
    };
    let found = records
      .iter_mut()
      .filter_map(Value::as_object_mut)
      .find(|r| self.unique_key(r) == Some(unique_key));
    let Some(record) = found else {
      return false;
    };
    for (field, value) in patch {
      if *field != self.key_field {
        record.insert(field.clone(), value.clone());
      }
    }
    true
  }

  pub fn remove(&self, data: &mut Value, unique_key: &str) -> bool {
    let Some(records) = self.records_mut(data) else {
      return false;
    };
    let before = records.len();
    records.retain(|r| self.value_key(r) != Some(unique_key));
    records.len() < before
  }

  /// Apply an intent in place. `Unknown` never applies.
  pub fn apply(&self, data: &mut Value, intent: &MutationIntent) -> bool {
    match intent {
      MutationIntent::Add(record) => self.add(data, record.clone()),
      MutationIntent::Update { unique_key, patch } => self.update(data, unique_key, patch),
      MutationIntent::Delete { unique_key } => self.remove(data, unique_key),
      MutationIntent::Unknown { .. } => false,
    }
  }

  /// Record the time of an in-place change on object payloads.
  pub fn stamp(&self, data: &mut Value, now: DateTime<Utc>) {
    if let Some(object) = data.as_object_mut() {
      object.insert(LAST_UPDATED_FIELD.to_string(), now.timestamp_millis().into());
    }
  }
}

/// A single-record change to a cached collection.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationIntent {
  Add(Record),
  Update { unique_key: String, patch: Record },
  Delete { unique_key: String },
  /// Anything that cannot be applied as a delta; handled by full invalidation
  Unknown { operation: String },
}

impl MutationIntent {
  pub fn operation(&self) -> &str {
    match self {
      MutationIntent::Add(_) => "add",
      MutationIntent::Update { .. } => "update",
      MutationIntent::Delete { .. } => "delete",
      MutationIntent::Unknown { operation } => operation,
    }
  }

  /// Operation-specific details as they travel in notifications.
  pub fn details(&self) -> Map<String, Value> {
    let mut details = Map::new();
    match self {
      MutationIntent::Add(record) => {
        details.insert("record".to_string(), Value::Object(record.clone()));
      }
      MutationIntent::Update { unique_key, patch } => {
        details.insert("uniqueKey".to_string(), unique_key.clone().into());
        details.insert("patch".to_string(), Value::Object(patch.clone()));
      }
      MutationIntent::Delete { unique_key } => {
        details.insert("uniqueKey".to_string(), unique_key.clone().into());
      }
      MutationIntent::Unknown { .. } => {}
    }
    details
  }

  /// Parse a notification. Missing or mistyped details turn the intent into
  /// `Unknown`, so the receiver falls back to full invalidation.
  ///
  /// Accepts the dashboard field names (`case`, `cnrNumber`, `caseData`)
  /// alongside the generic ones.
  pub fn from_notification(operation: &str, details: &Map<String, Value>) -> Self {
    let field = |names: &[&str]| names.iter().find_map(|n| details.get(*n));
    let record = |names: &[&str]| field(names).and_then(Value::as_object).cloned();
    let key = || {
      field(&["uniqueKey", "cnrNumber"])
        .and_then(Value::as_str)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
    };

    let parsed = match operation {
      "add" => record(&["record", "case"]).map(MutationIntent::Add),
      "update" => match (key(), record(&["patch", "caseData"])) {
        (Some(unique_key), Some(patch)) => Some(MutationIntent::Update { unique_key, patch }),
        _ => None,
      },
      "delete" => key().map(|unique_key| MutationIntent::Delete { unique_key }),
      _ => None,
    };

    parsed.unwrap_or_else(|| MutationIntent::Unknown {
      operation: operation.to_string(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn record(value: Value) -> Record {
    value.as_object().cloned().unwrap()
  }

  #[test]
  fn test_add_appends_and_rejects_duplicates() {
    let schema = RecordSchema::default();
    let mut data = json!([{"uniqueKey": "A"}]);

    assert!(schema.add(&mut data, record(json!({"uniqueKey": "B"}))));
    assert_eq!(data, json!([{"uniqueKey": "A"}, {"uniqueKey": "B"}]));

    assert!(!schema.add(&mut data, record(json!({"uniqueKey": "A", "x": 1}))));
    assert!(!schema.add(&mut data, record(json!({"name": "keyless"}))));
    assert_eq!(schema.records(&data).len(), 2);
  }

  #[test]
  fn test_update_merges_patch_and_keeps_order() {
    let schema = RecordSchema::default();
    let mut data = json!([
      {"uniqueKey": "A", "status": "open", "court": "X"},
      {"uniqueKey": "B", "status": "open"}
    ]);

    let patch = record(json!({"status": "closed", "uniqueKey": "Z"}));
    assert!(schema.update(&mut data, "A", &patch));
    assert_eq!(
      data,
      json!([
        {"uniqueKey": "A", "status": "closed", "court": "X"},
        {"uniqueKey": "B", "status": "open"}
      ])
    );

    assert!(!schema.update(&mut data, "missing", &patch));
  }

  #[test]
  fn test_remove_filters_record() {
    let schema = RecordSchema::default();
    let mut data = json!([{"uniqueKey": "A"}, null, {"uniqueKey": "B"}]);

    assert!(schema.remove(&mut data, "A"));
    assert_eq!(data, json!([null, {"uniqueKey": "B"}]));
    assert!(!schema.remove(&mut data, "A"));
  }

  #[test]
  fn test_dashboard_layout_uses_list_field() {
    let schema = RecordSchema::dashboard();
    let mut data = json!({"cases": [{"cnr_number": "C1"}], "total": 1});

    assert!(schema.add(&mut data, record(json!({"cnr_number": "C2"}))));
    assert!(schema.remove(&mut data, "C1"));
    assert_eq!(data["cases"], json!([{"cnr_number": "C2"}]));

    let mut no_list = json!({"total": 0});
    assert!(!schema.add(&mut no_list, record(json!({"cnr_number": "C3"}))));
  }

  #[test]
  fn test_stamp_only_touches_objects() {
    let schema = RecordSchema::dashboard();
    let now = Utc::now();
    let mut object = json!({"cases": []});
    schema.stamp(&mut object, now);
    assert_eq!(object["lastUpdated"], json!(now.timestamp_millis()));

    let mut list = json!([]);
    schema.stamp(&mut list, now);
    assert_eq!(list, json!([]));
  }

  #[test]
  fn test_from_notification_parses_dashboard_names() {
    let details = record(json!({"cnrNumber": "C1", "caseData": {"status": "closed"}}));
    assert_eq!(
      MutationIntent::from_notification("update", &details),
      MutationIntent::Update {
        unique_key: "C1".to_string(),
        patch: record(json!({"status": "closed"})),
      }
    );

    let details = record(json!({"case": {"cnr_number": "C2"}}));
    assert!(matches!(
      MutationIntent::from_notification("add", &details),
      MutationIntent::Add(_)
    ));
  }

  #[test]
  fn test_from_notification_missing_details_is_unknown() {
    let empty = Map::new();
    for operation in ["add", "update", "delete", "archive"] {
      assert_eq!(
        MutationIntent::from_notification(operation, &empty),
        MutationIntent::Unknown {
          operation: operation.to_string()
        }
      );
    }
  }

  #[test]
  fn test_details_parse_back_to_same_intent() {
    let intent = MutationIntent::Update {
      unique_key: "A".to_string(),
      patch: record(json!({"status": "closed"})),
    };
    let parsed = MutationIntent::from_notification(intent.operation(), &intent.details());
    assert_eq!(parsed, intent);
  }
}
