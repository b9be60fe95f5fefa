//! Read-only remote tiers: the public mirror and the direct static fallback.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::retry::{RetryOptions, RetryingFetcher};
use super::{base_url, check_status, join, read_json};
use crate::cache::{Tier, TierKind, TierOptions};
use crate::error::{Result, StoreError};

/// How a read-only document should be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DocumentFormat {
  #[default]
  Json,
  /// Returned as a JSON string
  Text,
}

async fn fetch_document(
  client: &reqwest::Client,
  fetcher: &RetryingFetcher,
  url: &Url,
  format: DocumentFormat,
  retry: Option<&RetryOptions>,
) -> Result<Option<Value>> {
  let response = fetcher.send(|| client.get(url.clone()), retry).await?;
  let Some(response) = check_status(response)? else {
    debug!(url = %url, "Read-only document not found");
    return Ok(None);
  };

  match format {
    DocumentFormat::Json => Ok(Some(read_json(response).await?)),
    DocumentFormat::Text => {
      let text = response.text().await.map_err(|e| StoreError::Network {
        attempts: 1,
        message: format!("failed to read response body: {}", e),
      })?;
      Ok(Some(Value::String(text)))
    }
  }
}

/// Public mirror of the document set. No credential needed.
pub struct ReadonlyStore {
  client: reqwest::Client,
  base: Url,
  fetcher: RetryingFetcher,
}

impl ReadonlyStore {
  pub fn new(base: &str, fetcher: RetryingFetcher) -> Result<Self> {
    Ok(Self {
      client: reqwest::Client::new(),
      base: base_url(base)?,
      fetcher,
    })
  }

  pub fn url_for(&self, key: &str) -> Result<Url> {
    if key.trim().is_empty() {
      return Err(StoreError::Parameter("document key must not be empty".to_string()));
    }
    join(&self.base, key)
  }

  /// Fetch `key`; a missing file is `Ok(None)`, not an error.
  pub async fn get(
    &self,
    key: &str,
    format: DocumentFormat,
    retry: Option<&RetryOptions>,
  ) -> Result<Option<Value>> {
    let url = self.url_for(key)?;
    fetch_document(&self.client, &self.fetcher, &url, format, retry).await
  }
}

#[async_trait]
impl Tier for ReadonlyStore {
  fn kind(&self) -> TierKind {
    TierKind::RemoteReadonly
  }

  fn is_writable(&self) -> bool {
    false
  }

  async fn get(&self, key: &str, options: &TierOptions) -> Result<Option<Value>> {
    ReadonlyStore::get(self, key, DocumentFormat::Json, options.retry.as_ref()).await
  }

  async fn set(&self, _key: &str, _value: &Value, _options: &TierOptions) -> Result<()> {
    Err(StoreError::Parameter(
      "remote-readonly tier does not accept writes".to_string(),
    ))
  }
}

/// Last-resort fetch of one well-known static path.
///
/// Ignores the requested key: each entity that has a static fallback
/// owns its own `DirectFallback`.
pub struct DirectFallback {
  client: reqwest::Client,
  url: Url,
  fetcher: RetryingFetcher,
}

impl DirectFallback {
  pub fn new(base: &str, path: &str, fetcher: RetryingFetcher) -> Result<Self> {
    Ok(Self {
      client: reqwest::Client::new(),
      url: join(&base_url(base)?, path)?,
      fetcher,
    })
  }

  pub fn url(&self) -> &Url {
    &self.url
  }
}

#[async_trait]
impl Tier for DirectFallback {
  fn kind(&self) -> TierKind {
    TierKind::Direct
  }

  fn is_writable(&self) -> bool {
    false
  }

  async fn get(&self, _key: &str, options: &TierOptions) -> Result<Option<Value>> {
    fetch_document(
      &self.client,
      &self.fetcher,
      &self.url,
      DocumentFormat::Json,
      options.retry.as_ref(),
    )
    .await
  }

  async fn set(&self, _key: &str, _value: &Value, _options: &TierOptions) -> Result<()> {
    Err(StoreError::Parameter(
      "direct fallback tier does not accept writes".to_string(),
    ))
  }
}
