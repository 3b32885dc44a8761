//! Outbound request collaborator and its reqwest implementation.

use async_trait::async_trait;
use reqwest::{header, Client};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::error::Result;

pub use reqwest::Method;

/// HTTP request timeout in seconds.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// What to send besides the URL.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
  pub method: Method,
  pub headers: Vec<(String, String)>,
  /// JSON body, if any
  pub body: Option<Value>,
}

impl RequestOptions {
  pub fn get() -> Self {
    Self::default()
  }

  pub fn with_method(method: Method, body: Option<Value>) -> Self {
    Self {
      method,
      headers: Vec::new(),
      body,
    }
  }

  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn header_value(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// Raw answer from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
  pub status: u16,
  pub body: Vec<u8>,
  /// Value of the `ETag` header
  pub freshness_token: Option<String>,
}

impl TransportResponse {
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn not_modified(&self) -> bool {
    self.status == 304
  }
}

/// Sends a request and reports status, body and freshness token.
///
/// Non-success statuses are returned, not raised; only failures to talk to
/// the server at all are errors.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, url: &str, options: &RequestOptions) -> Result<TransportResponse>;
}

/// Transport over reqwest.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpTransport {
  client: Client,
  base_url: Option<Url>,
}

impl HttpTransport {
  /// Relative URLs are joined onto `base_url`.
  pub fn new(base_url: Option<&str>, timeout: Duration) -> Result<Self> {
    let client = Client::builder().timeout(timeout).build()?;
    let base_url = base_url.map(Url::parse).transpose()?;
    Ok(Self { client, base_url })
  }

  fn resolve(&self, url: &str) -> Result<Url> {
    Ok(match &self.base_url {
      Some(base) => base.join(url)?,
      None => Url::parse(url)?,
    })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, url: &str, options: &RequestOptions) -> Result<TransportResponse> {
    let url = self.resolve(url)?;
    let body = options.body.as_ref().map(serde_json::to_vec).transpose()?;
    let mut retries = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
      let mut request = self
        .client
        .request(options.method.clone(), url.clone())
        .header(header::ACCEPT, "application/json");
      for (name, value) in &options.headers {
        request = request.header(name.as_str(), value.as_str());
      }
      if let Some(body) = &body {
        request = request
          .header(header::CONTENT_TYPE, "application/json")
          .body(body.clone());
      }

      let response = request.send().await?;
      let status = response.status().as_u16();

      if status == 429 && retries < MAX_RATE_LIMIT_RETRIES {
        retries += 1;
        warn!(url = %url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        backoff_ms *= 2;
        continue;
      }

      let freshness_token = response
        .headers()
        .get(header::ETAG)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
      let body = response.bytes().await?.to_vec();
      debug!(url = %url, status = status, bytes = body.len(), "Received response");

      return Ok(TransportResponse {
        status,
        body,
        freshness_token,
      });
    }
  }
}
