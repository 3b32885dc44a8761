use thiserror::Error;

/// Errors surfaced by the caching layer.
///
/// Most storage problems never reach callers: the entry store logs them and
/// reports a miss. What does propagate is network failure without a cached
/// fallback and server-side rejection of a mutation.
#[derive(Error, Debug)]
pub enum Error {
  #[error("Value for {key} is {size} bytes, over the {limit} byte limit")]
  QuotaExceeded {
    key: String,
    size: usize,
    limit: usize,
  },

  #[error("Storage error: {0}")]
  Storage(String),

  #[error("Database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("Serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("Network error: {0}")]
  Network(#[from] reqwest::Error),

  #[error("Invalid URL: {0}")]
  InvalidUrl(#[from] url::ParseError),

  #[error("Unauthorized - token may be expired")]
  Unauthorized,

  #[error("Resource not found: {0}")]
  NotFound(String),

  #[error("Server error: {0}")]
  ServerError(String),

  #[error("Invalid response: {0}")]
  InvalidResponse(String),

  #[error("Server rejected update: {0}")]
  Rejected(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl Error {
  /// Truncate a response body to avoid logging excessive data
  fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
      return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
      end -= 1;
    }
    format!(
      "{}... (truncated, {} total bytes)",
      &body[..end],
      body.len()
    )
  }

  /// Map a non-success HTTP status to an error.
  pub fn from_status(status: u16, body: &str) -> Self {
    let truncated = Self::truncate_body(body);
    match status {
      401 => Error::Unauthorized,
      404 => Error::NotFound(truncated),
      500..=599 => Error::ServerError(truncated),
      _ => Error::InvalidResponse(format!("Status {}: {}", status, truncated)),
    }
  }
}
