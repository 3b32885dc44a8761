//! Core types for cached data.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Opaque version token attached to every cache entry.
///
/// Versions are compared for equality only. The default token is derived
/// from the wall clock but carries no ordering guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Version(String);

impl Version {
  pub fn new(token: impl Into<String>) -> Self {
    Self(token.into())
  }

  /// Version token stamped at `at`.
  pub fn at(at: DateTime<Utc>) -> Self {
    Self(at.timestamp_millis().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Version {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<String> for Version {
  fn from(token: String) -> Self {
    Self(token)
  }
}

impl From<&str> for Version {
  fn from(token: &str) -> Self {
    Self(token.to_string())
  }
}

/// A versioned, timestamped container for the data cached under one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T = Value> {
  pub key: String,
  pub data: T,
  pub version: Version,
  pub created_at: DateTime<Utc>,
  #[serde(default)]
  pub compressed: bool,
  /// ETag returned by the server for this data, if any
  #[serde(default)]
  pub freshness_token: Option<String>,
}

impl<T> CacheEntry<T> {
  pub fn new(key: impl Into<String>, data: T, version: Version, created_at: DateTime<Utc>) -> Self {
    Self {
      key: key.into(),
      data,
      version,
      created_at,
      compressed: false,
      freshness_token: None,
    }
  }

  pub fn age(&self, now: DateTime<Utc>) -> Duration {
    now - self.created_at
  }

  /// Stale entries are still stored but read as a miss.
  pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
    self.age(now) > max_age
  }
}
