//! Remote tiers and the plumbing they share.
//!
//! - `RemoteDocumentStore`: authoritative read/write store (requires a bearer credential)
//! - `ReadonlyStore`: public read-only mirror
//! - `DirectFallback`: unauthenticated fetch of a well-known static path
//! - `RetryingFetcher`: retry/backoff wrapper used by all of them

mod authoritative;
mod readonly;
mod retry;

pub use authoritative::{FileRef, RemoteDocumentStore};
pub use readonly::{DirectFallback, DocumentFormat, ReadonlyStore};
pub use retry::{RetryOptions, RetryingFetcher, StatusCode};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use crate::error::{Result, StoreError};

/// Supplies the bearer credential for the authoritative store.
///
/// Token acquisition (OAuth etc.) lives outside this crate.
pub trait TokenSource: Send + Sync {
  fn bearer_token(&self) -> Option<String>;
}

/// A token fixed at construction time.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
  pub fn new(token: Option<String>) -> Self {
    Self(token.filter(|t| !t.is_empty()))
  }
}

impl TokenSource for StaticToken {
  fn bearer_token(&self) -> Option<String> {
    self.0.clone()
  }
}

/// Optional transform applied to payloads before they are persisted remotely
/// and reversed after they are read back.
pub trait PayloadCipher: Send + Sync {
  fn seal(&self, value: &Value) -> Result<Value>;
  fn open(&self, value: &Value) -> Result<Value>;
}

/// Storage usage reported by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
  pub usage: u64,
  /// `None` when the account has no limit
  pub limit: Option<u64>,
}

impl Quota {
  pub fn usage_ratio(&self) -> Option<f64> {
    match self.limit {
      Some(limit) if limit > 0 => Some(self.usage as f64 / limit as f64),
      _ => None,
    }
  }
}

/// Named-document surface the tracking map persists through.
#[async_trait]
pub trait DocumentStore: Send + Sync {
  async fn get_document(&self, name: &str) -> Result<Option<Value>>;

  async fn put_document(&self, name: &str, value: &Value) -> Result<()>;

  /// Delete a remote file by id. Deleting a file that is already gone succeeds.
  async fn delete_file(&self, file_id: &str) -> Result<()>;

  async fn quota(&self) -> Result<Quota>;
}

/// Parse a base URL, making sure relative joins append rather than replace.
pub(crate) fn base_url(raw: &str) -> Result<Url> {
  let mut normalized = raw.trim().to_string();
  if !normalized.ends_with('/') {
    normalized.push('/');
  }
  Url::parse(&normalized).map_err(|e| StoreError::Parameter(format!("invalid URL {}: {}", raw, e)))
}

pub(crate) fn join(base: &Url, path: &str) -> Result<Url> {
  base
    .join(path.trim_start_matches('/'))
    .map_err(|e| StoreError::Parameter(format!("invalid path {}: {}", path, e)))
}

/// Map a final response to `Some` (2xx), `None` (404/410) or an error.
pub(crate) fn check_status(response: reqwest::Response) -> Result<Option<reqwest::Response>> {
  let status = response.status();
  if status.is_success() {
    Ok(Some(response))
  } else if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
    Ok(None)
  } else {
    Err(StoreError::from_status(status.as_u16()))
  }
}

pub(crate) async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
  let body = response.text().await.map_err(|e| StoreError::Network {
    attempts: 1,
    message: format!("failed to read response body: {}", e),
  })?;
  Ok(serde_json::from_str(&body)?)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_base_url_joins_append() {
    let base = base_url("https://example.com/drive/v3").unwrap();
    assert_eq!(
      join(&base, "files").unwrap().as_str(),
      "https://example.com/drive/v3/files"
    );
    assert_eq!(
      join(&base, "/about").unwrap().as_str(),
      "https://example.com/drive/v3/about"
    );
  }

  #[test]
  fn test_invalid_base_url() {
    assert!(matches!(base_url("not a url"), Err(StoreError::Parameter(_))));
  }

  #[test]
  fn test_quota_ratio() {
    let quota = Quota {
      usage: 90,
      limit: Some(100),
    };
    assert_eq!(quota.usage_ratio(), Some(0.9));
    assert_eq!(
      Quota {
        usage: 5,
        limit: None
      }
      .usage_ratio(),
      None
    );
  }

  #[test]
  fn test_empty_static_token_is_absent() {
    assert_eq!(StaticToken::new(Some(String::new())).bearer_token(), None);
    assert_eq!(
      StaticToken::new(Some("abc".into())).bearer_token(),
      Some("abc".to_string())
    );
  }
}
