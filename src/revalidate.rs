//! Conditional requests against the server, folded into the cache.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::read::{GzDecoder, ZlibDecoder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Read;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, CacheEntryStore, Version};
use crate::error::{Error, Result};
use crate::http::{RequestOptions, Transport, TransportResponse};
use crate::notify::CrossContextNotifier;

/// Cache key for URLs no route matches. Such responses are never cached.
pub const UNKNOWN_KEY: &str = "unknown";

/// Field of a compressed payload holding the base64 compressed data.
pub const DEFAULT_COMPRESSED_FIELD: &str = "dashboard_data";

const IF_NONE_MATCH: &str = "If-None-Match";

/// Maps URLs containing `pattern` to cache `key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
  pub pattern: String,
  pub key: String,
}

impl Route {
  pub fn new(pattern: impl Into<String>, key: impl Into<String>) -> Self {
    Self {
      pattern: pattern.into(),
      key: key.into(),
    }
  }
}

/// Ordered URL-to-key table; the first matching pattern wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRoutes {
  routes: Vec<Route>,
}

impl KeyRoutes {
  pub fn new(routes: Vec<Route>) -> Self {
    Self { routes }
  }

  pub fn routes(&self) -> &[Route] {
    &self.routes
  }

  pub fn resolve(&self, url: &str) -> &str {
    self
      .routes
      .iter()
      .find(|r| url.contains(r.pattern.as_str()))
      .map(|r| r.key.as_str())
      .unwrap_or(UNKNOWN_KEY)
  }
}

impl Default for KeyRoutes {
  fn default() -> Self {
    Self::new(vec![
      Route::new("/dashboard-data", "dashboard"),
      Route::new("/cases", "cases"),
      Route::new("/clients", "clients"),
      Route::new("/calendar-events", "calendar-events"),
    ])
  }
}

/// Result of a revalidating request.
#[derive(Debug, Clone, PartialEq)]
pub struct Revalidated {
  pub ok: bool,
  pub data: Value,
  /// True when `data` came from the cache rather than a response body
  pub from_cache: bool,
  pub freshness_token: Option<String>,
  /// Why the network could not be used, when serving a fallback
  pub error_message: Option<String>,
}

impl Revalidated {
  fn cached(entry: CacheEntry, error_message: Option<String>) -> Self {
    Self {
      ok: true,
      data: entry.data,
      from_cache: true,
      freshness_token: entry.freshness_token,
      error_message,
    }
  }
}

/// Wraps a transport with ETag revalidation and offline fallback.
pub struct RevalidationClient<T: Transport> {
  transport: T,
  store: Arc<CacheEntryStore>,
  routes: KeyRoutes,
  compressed_field: String,
  notifier: Option<Arc<CrossContextNotifier>>,
}

impl<T: Transport> RevalidationClient<T> {
  pub fn new(transport: T, store: Arc<CacheEntryStore>) -> Self {
    Self {
      transport,
      store,
      routes: KeyRoutes::default(),
      compressed_field: DEFAULT_COMPRESSED_FIELD.to_string(),
      notifier: None,
    }
  }

  pub fn with_routes(mut self, routes: KeyRoutes) -> Self {
    self.routes = routes;
    self
  }

  pub fn with_compressed_field(mut self, field: impl Into<String>) -> Self {
    self.compressed_field = field.into();
    self
  }

  /// Distrust fresh cache hits while peers report recent changes.
  pub fn with_notifier(mut self, notifier: Arc<CrossContextNotifier>) -> Self {
    self.notifier = Some(notifier);
    self
  }

  pub fn cache_key(&self, url: &str) -> &str {
    self.routes.resolve(url)
  }

  /// Serve a fresh, trusted cache hit without touching the network,
  /// otherwise revalidate with [`request`](Self::request).
  pub async fn fetch(&self, url: &str, options: RequestOptions) -> Result<Revalidated> {
    let key = self.routes.resolve(url);
    let suspicious = self
      .notifier
      .as_ref()
      .is_some_and(|n| n.is_recently_notified());

    if key != UNKNOWN_KEY && !suspicious {
      if let Some(entry) = self.store.fresh_entry(key, None) {
        return Ok(Revalidated::cached(entry, None));
      }
    }
    self.request(url, options).await
  }

  /// Issue the request, revalidating any cached entry for the URL.
  ///
  /// 1. Attach the stored freshness token as `If-None-Match`
  /// 2. 304 - return the cached data untouched
  /// 3. Otherwise decode (and decompress) the body and cache it
  /// 4. On failure fall back to cached data, or propagate if there is none
  pub async fn request(&self, url: &str, mut options: RequestOptions) -> Result<Revalidated> {
    let key = self.routes.resolve(url).to_string();
    let cacheable = key != UNKNOWN_KEY;
    let cached = if cacheable { self.store.entry(&key) } else { None };

    if let Some(token) = cached.as_ref().and_then(|e| e.freshness_token.as_ref()) {
      options
        .headers
        .retain(|(name, _)| !name.eq_ignore_ascii_case(IF_NONE_MATCH));
      options.headers.push((IF_NONE_MATCH.to_string(), token.clone()));
    }

    let outcome = match self.transport.send(url, &options).await {
      Ok(response) if response.not_modified() => match &cached {
        Some(entry) => {
          debug!(key = %key, url = url, "304 Not Modified");
          self.store.touch(&key);
          return Ok(Revalidated::cached(entry.clone(), None));
        }
        None => Err(Error::InvalidResponse(format!(
          "304 Not Modified for {} without a cached entry",
          url
        ))),
      },
      Ok(response) if response.ok() => self.decode(response),
      Ok(response) => Err(Error::from_status(
        response.status,
        &String::from_utf8_lossy(&response.body),
      )),
      Err(e) => Err(e),
    };

    match outcome {
      Ok(fresh) => {
        if cacheable {
          self.store.set_revalidated(
            &key,
            fresh.data.clone(),
            fresh.version,
            fresh.compressed,
            fresh.freshness_token.clone(),
          );
        }
        Ok(Revalidated {
          ok: true,
          data: fresh.data,
          from_cache: false,
          freshness_token: fresh.freshness_token,
          error_message: None,
        })
      }
      Err(e) => match cached {
        Some(entry) => {
          info!(key = %key, url = url, error = %e, "Request failed, returning cached data");
          Ok(Revalidated::cached(entry, Some(e.to_string())))
        }
        None => Err(e),
      },
    }
  }

  fn decode(&self, response: TransportResponse) -> Result<Decoded> {
    let mut data: Value = serde_json::from_slice(&response.body)?;
    let compressed = data
      .get("compressed")
      .and_then(Value::as_bool)
      .unwrap_or(false);

    if compressed {
      let field = self.compressed_field.as_str();
      match data.get(field).and_then(Value::as_str).map(decompress) {
        Some(Ok(inflated)) => data[field] = inflated,
        Some(Err(e)) => {
          warn!(field = field, error = %e, "Failed to decompress payload, keeping raw data")
        }
        None => debug!(field = field, "Compressed flag set but field is missing"),
      }
    }

    let version = match data.get("cache_version") {
      Some(Value::String(s)) => Some(Version::from(s.as_str())),
      Some(Value::Number(n)) => Some(Version::from(n.to_string())),
      _ => None,
    };

    Ok(Decoded {
      data,
      version,
      compressed,
      freshness_token: response.freshness_token,
    })
  }
}

struct Decoded {
  data: Value,
  version: Option<Version>,
  compressed: bool,
  freshness_token: Option<String>,
}

/// Decode base64, inflate gzip or zlib, then parse JSON.
fn decompress(encoded: &str) -> Result<Value> {
  let bytes = STANDARD
    .decode(encoded.trim())
    .map_err(|e| Error::InvalidResponse(format!("Invalid base64: {}", e)))?;

  let mut text = String::new();
  let inflated = if bytes.starts_with(&[0x1f, 0x8b]) {
    GzDecoder::new(bytes.as_slice()).read_to_string(&mut text)
  } else {
    ZlibDecoder::new(bytes.as_slice()).read_to_string(&mut text)
  };
  inflated.map_err(|e| Error::InvalidResponse(format!("Failed to inflate: {}", e)))?;

  Ok(serde_json::from_str(&text)?)
}
