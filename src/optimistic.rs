//! Optimistic local updates with rollback.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::{CacheEntry, CacheEntryStore, Version};
use crate::error::{Error, Result};

/// Outcome reported by the collaborator performing a server-side mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResponse {
  /// A response with `success: false` counts as a rejection
  #[serde(default = "default_success")]
  pub success: bool,
  /// Authoritative value from the server, if it sent one
  #[serde(default)]
  pub data: Option<Value>,
  #[serde(default)]
  pub cache_version: Option<Version>,
  #[serde(default)]
  pub error: Option<String>,
}

fn default_success() -> bool {
  true
}

impl MutationResponse {
  pub fn ok(data: Value) -> Self {
    Self {
      success: true,
      data: Some(data),
      cache_version: None,
      error: None,
    }
  }

  /// Success without a payload.
  pub fn confirmed() -> Self {
    Self {
      success: true,
      data: None,
      cache_version: None,
      error: None,
    }
  }

  pub fn rejected(error: impl Into<String>) -> Self {
    Self {
      success: false,
      data: None,
      cache_version: None,
      error: Some(error.into()),
    }
  }

  pub fn with_version(mut self, version: impl Into<Version>) -> Self {
    self.cache_version = Some(version.into());
    self
  }
}

/// Restores a snapshot when dropped unless disarmed, so a cancelled or
/// failed mutation never leaves the optimistic value behind.
struct Rollback<'a> {
  store: &'a CacheEntryStore,
  snapshot: Option<CacheEntry>,
}

impl Rollback<'_> {
  fn disarm(mut self) {
    self.snapshot = None;
  }
}

impl Drop for Rollback<'_> {
  fn drop(&mut self) {
    if let Some(snapshot) = self.snapshot.take() {
      info!(key = %snapshot.key, "Rolling back optimistic update");
      self.store.restore(snapshot);
    }
  }
}

/// Applies local transforms ahead of server confirmation.
#[derive(Clone)]
pub struct OptimisticUpdateManager {
  store: Arc<CacheEntryStore>,
}

impl OptimisticUpdateManager {
  pub fn new(store: Arc<CacheEntryStore>) -> Self {
    Self { store }
  }

  /// Update `key` locally with `transform`, then run `server_mutation`.
  ///
  /// 1. No fresh cached value - just run the mutation
  /// 2. Write `transform(current)` immediately
  /// 3. On success commit the server's data (and version) if it sent any,
  ///    otherwise keep the confirmed local value
  /// 4. On rejection or error restore the pre-update entry exactly
  pub async fn optimistic_update<F, M, Fut>(
    &self,
    key: &str,
    transform: F,
    server_mutation: M,
  ) -> Result<MutationResponse>
  where
    F: FnOnce(&Value) -> Value,
    M: FnOnce() -> Fut,
    Fut: Future<Output = Result<MutationResponse>>,
  {
    let Some(snapshot) = self.store.fresh_entry(key, None) else {
      debug!(key = key, "No cached data, skipping optimistic update");
      return accept(server_mutation().await?);
    };

    let optimistic = transform(&snapshot.data);
    let rollback = Rollback {
      store: &self.store,
      snapshot: Some(snapshot),
    };
    self.store.set(key, &optimistic, None, false);
    debug!(key = key, "Applied optimistic update");

    let response = accept(server_mutation().await?)?;

    match &response.data {
      Some(data) => self.store.set(key, data, response.cache_version.clone(), false),
      None => {
        if let Some(version) = &response.cache_version {
          self.store.set(key, &optimistic, Some(version.clone()), false);
        }
      }
    }
    rollback.disarm();
    debug!(key = key, "Server confirmed optimistic update");
    Ok(response)
  }
}

pub(crate) fn accept(response: MutationResponse) -> Result<MutationResponse> {
  if response.success {
    Ok(response)
  } else {
    Err(Error::Rejected(
      response
        .error
        .unwrap_or_else(|| "Server rejected update".to_string()),
    ))
  }
}
