//! Authoritative remote store backed by a Drive-style files API.
//!
//! Documents are files addressed by name inside a single storage space
//! (`appDataFolder` by default). Reads and writes need a bearer credential.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::retry::{RetryOptions, RetryingFetcher};
use super::{
  base_url, check_status, join, read_json, DocumentStore, PayloadCipher, Quota, TokenSource,
};
use crate::cache::{Tier, TierKind, TierOptions};
use crate::error::{Result, StoreError};
use crate::tracking::{SaveOptions, ShardedTrackingMap, TrackingMetadata};

/// Names per `batch_exists` query.
const BATCH_CHUNK: usize = 20;
const MULTIPART_BOUNDARY: &str = "rosterkit-part-boundary";

/// A remote file as listed by the store.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileRef {
  pub id: String,
  pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
  #[serde(default)]
  files: Vec<FileRef>,
  next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct About {
  storage_quota: ApiQuota,
}

/// Quota figures arrive as decimal strings.
#[derive(Debug, Deserialize)]
struct ApiQuota {
  usage: Option<String>,
  limit: Option<String>,
}

impl ApiQuota {
  fn into_quota(self) -> Quota {
    Quota {
      usage: self.usage.and_then(|u| u.parse().ok()).unwrap_or(0),
      limit: self.limit.and_then(|l| l.parse().ok()),
    }
  }
}

/// Body of a create response; only the new file's id matters.
#[derive(Debug, Deserialize)]
struct CreatedFile {
  id: String,
}

/// Authoritative read/write remote tier.
///
/// The store can own the tracking map that records expiry and tags for the
/// files it writes, since the remote API has no TTL of its own.
#[derive(Clone)]
pub struct RemoteDocumentStore {
  client: reqwest::Client,
  api_base: Url,
  upload_base: Url,
  space: String,
  token: Arc<dyn TokenSource>,
  fetcher: RetryingFetcher,
  cipher: Option<Arc<dyn PayloadCipher>>,
  tracking: Option<Arc<ShardedTrackingMap>>,
}

impl RemoteDocumentStore {
  pub fn new(
    api_base: &str,
    upload_base: &str,
    space: &str,
    token: Arc<dyn TokenSource>,
    fetcher: RetryingFetcher,
  ) -> Result<Self> {
    Ok(Self {
      client: reqwest::Client::new(),
      api_base: base_url(api_base)?,
      upload_base: base_url(upload_base)?,
      space: space.to_string(),
      token,
      fetcher,
      cipher: None,
      tracking: None,
    })
  }

  /// Seal payloads before they are written and open them after reads.
  pub fn with_cipher(mut self, cipher: Arc<dyn PayloadCipher>) -> Self {
    self.cipher = Some(cipher);
    self
  }

  /// Attach a tracking map whose shards live in this same store.
  pub fn with_tracking(mut self, prefix: &str, options: SaveOptions) -> Self {
    let backing = Self {
      tracking: None,
      ..self.clone()
    };
    let map = ShardedTrackingMap::new(Arc::new(backing), prefix).with_save_options(options);
    self.tracking = Some(Arc::new(map));
    self
  }

  /// The tracking map this store records file metadata in, if any.
  pub fn tracking(&self) -> Option<Arc<ShardedTrackingMap>> {
    self.tracking.clone()
  }

  fn bearer(&self) -> Result<String> {
    self
      .token
      .bearer_token()
      .ok_or(StoreError::NotAuthenticated("remote-authoritative store"))
  }

  /// Look a document up by name.
  pub async fn find_file(
    &self,
    key: &str,
    retry: Option<&RetryOptions>,
  ) -> Result<Option<FileRef>> {
    validate_key(key)?;
    let query = name_query(&[key]);
    let list = self.list_page(&query, 1, None, retry).await?;
    Ok(list.files.into_iter().next())
  }

  async fn list_page(
    &self,
    query: &str,
    page_size: usize,
    page_token: Option<&str>,
    retry: Option<&RetryOptions>,
  ) -> Result<FileList> {
    let token = self.bearer()?;
    let url = join(&self.api_base, "files")?;
    let page_size = page_size.to_string();

    let response = self
      .fetcher
      .send(
        || {
          let mut request = self.client.get(url.clone()).bearer_auth(&token).query(&[
            ("q", query),
            ("spaces", self.space.as_str()),
            ("fields", "nextPageToken, files(id, name)"),
            ("pageSize", page_size.as_str()),
          ]);
          if let Some(page_token) = page_token {
            request = request.query(&[("pageToken", page_token)]);
          }
          request
        },
        retry,
      )
      .await?;

    match check_status(response)? {
      Some(response) => read_json(response).await,
      None => Ok(FileList {
        files: Vec::new(),
        next_page_token: None,
      }),
    }
  }

  /// Fetch and parse a document. `Ok(None)` when no such document exists.
  pub async fn get(&self, key: &str, retry: Option<&RetryOptions>) -> Result<Option<Value>> {
    let Some(file) = self.find_file(key, retry).await? else {
      return Ok(None);
    };

    let token = self.bearer()?;
    let url = join(&self.api_base, &format!("files/{}", file.id))?;
    let response = self
      .fetcher
      .send(
        || {
          self
            .client
            .get(url.clone())
            .bearer_auth(&token)
            .query(&[("alt", "media")])
        },
        retry,
      )
      .await?;

    let Some(response) = check_status(response)? else {
      return Ok(None);
    };
    let value: Value = read_json(response).await?;
    match &self.cipher {
      Some(cipher) => Ok(Some(cipher.open(&value)?)),
      None => Ok(Some(value)),
    }
  }

  /// Create or overwrite a document.
  pub async fn set(&self, key: &str, value: &Value, retry: Option<&RetryOptions>) -> Result<()> {
    self.write(key, value, retry).await.map(|_| ())
  }

  /// Write a document and record `metadata` for it in the tracking map.
  ///
  /// Fails before writing anything when no tracking map is attached.
  pub async fn set_tracked(
    &self,
    key: &str,
    value: &Value,
    metadata: TrackingMetadata,
    retry: Option<&RetryOptions>,
  ) -> Result<()> {
    let Some(tracking) = &self.tracking else {
      return Err(StoreError::Parameter(
        "no tracking map attached to the remote store".to_string(),
      ));
    };

    let file_id = self.write(key, value, retry).await?;
    tracking.ensure_loaded().await;
    let report = tracking.update(&file_id, metadata).await?;
    if !report.failed.is_empty() {
      warn!(key, file_id = %file_id, failed = ?report.failed, "Tracking shards not saved");
    }
    Ok(())
  }

  /// Create or overwrite a document, returning its file id.
  async fn write(&self, key: &str, value: &Value, retry: Option<&RetryOptions>) -> Result<String> {
    let payload = match &self.cipher {
      Some(cipher) => cipher.seal(value)?,
      None => value.clone(),
    };
    let body = serde_json::to_vec(&payload)?;
    let token = self.bearer()?;

    let (response, existing) = match self.find_file(key, retry).await? {
      Some(file) => {
        let url = join(&self.upload_base, &format!("files/{}", file.id))?;
        let response = self
          .fetcher
          .send(
            || {
              self
                .client
                .patch(url.clone())
                .bearer_auth(&token)
                .query(&[("uploadType", "media")])
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone())
            },
            retry,
          )
          .await?;
        (response, Some(file.id))
      }
      None => {
        let url = join(&self.upload_base, "files")?;
        let multipart = multipart_body(key, &self.space, &body)?;
        let response = self
          .fetcher
          .send(
            || {
              self
                .client
                .post(url.clone())
                .bearer_auth(&token)
                .query(&[("uploadType", "multipart")])
                .header(
                  reqwest::header::CONTENT_TYPE,
                  format!("multipart/related; boundary={}", MULTIPART_BOUNDARY),
                )
                .body(multipart.clone())
            },
            retry,
          )
          .await?;
        (response, None)
      }
    };

    let status = response.status();
    if !status.is_success() {
      return Err(StoreError::from_status(status.as_u16()));
    }
    debug!(key, "Stored remote document");

    match existing {
      Some(id) => Ok(id),
      None => {
        let created: CreatedFile = read_json(response).await?;
        Ok(created.id)
      }
    }
  }

  pub async fn has(&self, key: &str) -> Result<bool> {
    Ok(self.find_file(key, None).await?.is_some())
  }

  /// Check several names at once; every requested key appears in the result.
  pub async fn batch_exists(&self, keys: &[&str]) -> Result<HashMap<String, bool>> {
    for key in keys {
      validate_key(key)?;
    }

    let mut found = HashMap::with_capacity(keys.len());
    for chunk in keys.chunks(BATCH_CHUNK) {
      let query = name_query(chunk);
      let list = self.list_page(&query, chunk.len(), None, None).await?;
      for file in list.files {
        found.insert(file.name, true);
      }
    }

    Ok(
      keys
        .iter()
        .map(|key| (key.to_string(), found.contains_key(*key)))
        .collect(),
    )
  }

  /// List files matching a raw store query, following pages until
  /// `page_size` results are gathered or no pages remain.
  pub async fn list_directory(&self, query: &str, page_size: usize) -> Result<Vec<FileRef>> {
    if page_size == 0 {
      return Err(StoreError::Parameter("page size must be positive".to_string()));
    }

    let mut files = Vec::new();
    let mut page_token: Option<String> = None;
    loop {
      let remaining = page_size - files.len();
      let page = self
        .list_page(query, remaining, page_token.as_deref(), None)
        .await?;
      files.extend(page.files);

      match page.next_page_token {
        Some(next) if files.len() < page_size => page_token = Some(next),
        _ => break,
      }
    }

    files.truncate(page_size);
    Ok(files)
  }

  /// Delete a document by name. Returns whether a document was removed.
  pub async fn delete(&self, key: &str) -> Result<bool> {
    match self.find_file(key, None).await? {
      Some(file) => {
        self.delete_by_id(&file.id).await?;
        Ok(true)
      }
      None => Ok(false),
    }
  }

  pub async fn delete_by_id(&self, file_id: &str) -> Result<()> {
    validate_key(file_id)?;
    let token = self.bearer()?;
    let url = join(&self.api_base, &format!("files/{}", file_id))?;
    let response = self
      .fetcher
      .send(|| self.client.delete(url.clone()).bearer_auth(&token), None)
      .await?;

    check_status(response)?;
    Ok(())
  }

  pub async fn get_quota(&self) -> Result<Quota> {
    let token = self.bearer()?;
    let url = join(&self.api_base, "about")?;
    let response = self
      .fetcher
      .send(
        || {
          self
            .client
            .get(url.clone())
            .bearer_auth(&token)
            .query(&[("fields", "storageQuota")])
        },
        None,
      )
      .await?;

    match check_status(response)? {
      Some(response) => {
        let about: About = read_json(response).await?;
        Ok(about.storage_quota.into_quota())
      }
      None => Err(StoreError::Http { status: 404 }),
    }
  }
}

#[async_trait]
impl Tier for RemoteDocumentStore {
  fn kind(&self) -> TierKind {
    TierKind::RemoteAuthoritative
  }

  async fn get(&self, key: &str, options: &TierOptions) -> Result<Option<Value>> {
    RemoteDocumentStore::get(self, key, options.retry.as_ref()).await
  }

  async fn set(&self, key: &str, value: &Value, options: &TierOptions) -> Result<()> {
    RemoteDocumentStore::set(self, key, value, options.retry.as_ref()).await
  }
}

#[async_trait]
impl DocumentStore for RemoteDocumentStore {
  async fn get_document(&self, name: &str) -> Result<Option<Value>> {
    self.get(name, None).await
  }

  async fn put_document(&self, name: &str, value: &Value) -> Result<()> {
    self.set(name, value, None).await
  }

  async fn delete_file(&self, file_id: &str) -> Result<()> {
    self.delete_by_id(file_id).await
  }

  async fn quota(&self) -> Result<Quota> {
    self.get_quota().await
  }
}

fn validate_key(key: &str) -> Result<()> {
  if key.trim().is_empty() {
    return Err(StoreError::Parameter("document key must not be empty".to_string()));
  }
  Ok(())
}

/// Escape a literal for use inside a single-quoted query string.
fn escape_literal(value: &str) -> String {
  value.replace('\\', "\\\\").replace('\'', "\\'")
}

fn name_query(names: &[&str]) -> String {
  let clauses: Vec<String> = names
    .iter()
    .map(|name| format!("name = '{}'", escape_literal(name)))
    .collect();

  if clauses.len() == 1 {
    format!("{} and trashed = false", clauses[0])
  } else {
    format!("({}) and trashed = false", clauses.join(" or "))
  }
}

/// Metadata plus media in one `multipart/related` body.
fn multipart_body(name: &str, space: &str, media: &[u8]) -> Result<Vec<u8>> {
  let metadata = serde_json::to_vec(&json!({ "name": name, "parents": [space] }))?;

  let mut body = Vec::with_capacity(metadata.len() + media.len() + 256);
  body.extend_from_slice(
    format!(
      "--{}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n",
      MULTIPART_BOUNDARY
    )
    .as_bytes(),
  );
  body.extend_from_slice(&metadata);
  body.extend_from_slice(
    format!(
      "\r\n--{}\r\nContent-Type: application/json\r\n\r\n",
      MULTIPART_BOUNDARY
    )
    .as_bytes(),
  );
  body.extend_from_slice(media);
  body.extend_from_slice(format!("\r\n--{}--", MULTIPART_BOUNDARY).as_bytes());
  Ok(body)
}
