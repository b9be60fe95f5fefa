//! Error kinds shared by every tier.
//!
//! "Not found" is never an error: tiers report it as `Ok(None)`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
  /// Invalid key, id or query.
  #[error("invalid parameter: {0}")]
  Parameter(String),

  /// The authoritative tier was used without a bearer credential.
  #[error("not authenticated: no bearer credential available for {0}")]
  NotAuthenticated(&'static str),

  /// Transport failure that survived every retry.
  #[error("network error after {attempts} attempt(s): {message}")]
  Network { attempts: u32, message: String },

  /// 5xx that survived every retry.
  #[error("remote server error: HTTP {status}")]
  RemoteServer { status: u16 },

  /// Non-retryable client error other than 404.
  #[error("remote request rejected: HTTP {status}")]
  Http { status: u16 },

  #[error("malformed JSON: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("local storage error: {0}")]
  Local(#[from] rusqlite::Error),

  #[error("shard encoding error: {0}")]
  Codec(String),
}

impl StoreError {
  /// Build the error for a final HTTP status that is neither success nor 404.
  pub fn from_status(status: u16) -> Self {
    if status >= 500 {
      StoreError::RemoteServer { status }
    } else {
      StoreError::Http { status }
    }
  }
}

pub type Result<T> = std::result::Result<T, StoreError>;
