//! Core traits and types for the tier chain.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::remote::RetryOptions;

/// One storage backend in the priority chain.
///
/// Variants are declared in priority order, so `Ord` gives the fixed, total
/// tier order: `Cache < Session < Local < RemoteAuthoritative < RemoteReadonly < Direct`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TierKind {
  /// Volatile in-process cache
  Cache,
  /// Session-scoped store
  Session,
  /// Persistent local key/value store
  Local,
  /// Canonical read/write remote store
  RemoteAuthoritative,
  /// Read-only remote mirror
  RemoteReadonly,
  /// Unauthenticated fetch of a well-known static path
  Direct,
}

impl TierKind {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Cache => "cache",
      Self::Session => "session",
      Self::Local => "local",
      Self::RemoteAuthoritative => "remote-authoritative",
      Self::RemoteReadonly => "remote-readonly",
      Self::Direct => "direct",
    }
  }

  /// Remote tiers hold canonical data rather than a cached copy of it.
  pub fn is_remote(&self) -> bool {
    matches!(
      self,
      Self::RemoteAuthoritative | Self::RemoteReadonly | Self::Direct
    )
  }
}

impl fmt::Display for TierKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

/// Per-call options handed to a single tier.
#[derive(Debug, Clone, Default)]
pub struct TierOptions {
  /// Expiration for writes; `None` means the tier keeps the value until deleted.
  pub ttl: Option<Duration>,
  /// Retry overrides for remote tiers.
  pub retry: Option<RetryOptions>,
}

/// Capability interface every tier implements.
#[async_trait]
pub trait Tier: Send + Sync {
  /// Which slot of the chain this tier occupies.
  fn kind(&self) -> TierKind;

  /// Read-only tiers are consulted but never warmed.
  fn is_writable(&self) -> bool {
    true
  }

  /// Read a value. `Ok(None)` means the tier has nothing for `key`.
  async fn get(&self, key: &str, options: &TierOptions) -> Result<Option<Value>>;

  /// Write a value, overwriting whatever the tier held.
  async fn set(&self, key: &str, value: &Value, options: &TierOptions) -> Result<()>;
}

/// How an entity decides whether a tier "has" a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AbsentPolicy {
  /// Only a missing value is absent; a stored JSON `null` is a cached value.
  #[default]
  MissingOnly,
  /// Both a missing value and a stored JSON `null` are absent.
  MissingOrNull,
}

impl AbsentPolicy {
  pub fn is_present(&self, value: &Option<Value>) -> bool {
    match (self, value) {
      (_, None) => false,
      (Self::MissingOrNull, Some(Value::Null)) => false,
      _ => true,
    }
  }
}

/// Terminal state of a single fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
  CacheHit,
  SessionHit,
  LocalHit,
  AuthRemoteHit,
  ReadonlyRemoteHit,
  DirectHit,
  Absent,
}

impl From<TierKind> for FetchOutcome {
  fn from(kind: TierKind) -> Self {
    match kind {
      TierKind::Cache => Self::CacheHit,
      TierKind::Session => Self::SessionHit,
      TierKind::Local => Self::LocalHit,
      TierKind::RemoteAuthoritative => Self::AuthRemoteHit,
      TierKind::RemoteReadonly => Self::ReadonlyRemoteHit,
      TierKind::Direct => Self::DirectHit,
    }
  }
}

/// A value as persisted by tiers that understand expiration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierEntry {
  pub value: Value,
  pub expires_at: Option<DateTime<Utc>>,
}

impl TierEntry {
  pub fn new(value: Value, ttl: Option<Duration>) -> Self {
    let expires_at = ttl
      .filter(|ttl| !ttl.is_zero())
      .and_then(|ttl| chrono::Duration::from_std(ttl).ok())
      // Past the representable range counts as never expiring
      .and_then(|ttl| Utc::now().checked_add_signed(ttl));
    Self { value, expires_at }
  }

  pub fn is_expired(&self) -> bool {
    self.is_expired_at(Utc::now())
  }

  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    self.expires_at.map(|at| at <= now).unwrap_or(false)
  }
}
