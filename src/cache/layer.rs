//! Tiered resolver: fetch through the tier chain and warm faster tiers.

use futures::future::join_all;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::traits::{AbsentPolicy, FetchOutcome, Tier, TierKind, TierOptions};
use crate::error::{Result, StoreError};
use crate::remote::RetryOptions;

/// Expiration applied to each TTL-aware tier when it is warmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierTtls {
  pub cache: Duration,
  pub session: Duration,
  pub local: Duration,
}

impl Default for TierTtls {
  fn default() -> Self {
    Self {
      cache: Duration::from_secs(30 * 60),
      session: Duration::from_secs(60 * 60),
      local: Duration::from_secs(120 * 60),
    }
  }
}

/// Per-call settings supplied by the calling entity.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
  pub ttls: TierTtls,
  pub retry: Option<RetryOptions>,
}

impl FetchOptions {
  pub fn for_tier(&self, kind: TierKind) -> TierOptions {
    let ttl = match kind {
      TierKind::Cache => Some(self.ttls.cache),
      TierKind::Session => Some(self.ttls.session),
      TierKind::Local => Some(self.ttls.local),
      _ => None,
    };
    TierOptions {
      ttl,
      retry: self.retry,
    }
  }
}

/// Result of a fetch.
#[derive(Debug)]
pub struct Fetched {
  /// The resolved value, `None` when no tier had one
  pub value: Option<Value>,
  /// Which terminal state the fetch reached
  pub outcome: FetchOutcome,
  /// Background write-back into faster tiers
  pub warming: WarmHandle,
}

impl Fetched {
  fn absent() -> Self {
    Self {
      value: None,
      outcome: FetchOutcome::Absent,
      warming: WarmHandle::idle(),
    }
  }
}

/// What a warm pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WarmReport {
  pub written: Vec<TierKind>,
  pub failed: Vec<(TierKind, String)>,
}

/// Handle to a background warm pass.
///
/// Dropping the handle detaches the task; warming still completes.
#[derive(Debug)]
pub struct WarmHandle {
  task: Option<JoinHandle<WarmReport>>,
}

impl WarmHandle {
  fn idle() -> Self {
    Self { task: None }
  }

  pub fn is_finished(&self) -> bool {
    self
      .task
      .as_ref()
      .map(|task| task.is_finished())
      .unwrap_or(true)
  }

  /// Wait for every write of this pass to finish.
  pub async fn settle(self) -> WarmReport {
    match self.task {
      Some(task) => task.await.unwrap_or_else(|e| {
        warn!(error = %e, "Warm task did not complete");
        WarmReport::default()
      }),
      None => WarmReport::default(),
    }
  }
}

/// Tiers already known to hold one particular value of a key.
#[derive(Debug)]
struct FoundIn {
  fingerprint: String,
  tiers: HashSet<TierKind>,
}

type FoundInSet = Arc<Mutex<HashMap<String, FoundIn>>>;

fn lock(found_in: &FoundInSet) -> MutexGuard<'_, HashMap<String, FoundIn>> {
  found_in
    .lock()
    .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn fingerprint(value: &Value) -> String {
  let mut hasher = Sha256::new();
  hasher.update(value.to_string().as_bytes());
  hex::encode(hasher.finalize())
}

fn mark_found(found_in: &FoundInSet, key: &str, fingerprint: &str, kind: TierKind) {
  let mut found_in = lock(found_in);
  let entry = found_in.entry(key.to_string()).or_insert_with(|| FoundIn {
    fingerprint: fingerprint.to_string(),
    tiers: HashSet::new(),
  });
  if entry.fingerprint != fingerprint {
    entry.fingerprint = fingerprint.to_string();
    entry.tiers.clear();
  }
  entry.tiers.insert(kind);
}

/// A tier that just missed no longer holds the value, whatever was written to it before.
fn mark_missing(found_in: &FoundInSet, key: &str, kind: TierKind) {
  if let Some(entry) = lock(found_in).get_mut(key) {
    entry.tiers.remove(&kind);
  }
}

/// Resolves a key through an ordered chain of tiers.
///
/// Fetch stops at the first tier holding a present value and schedules a
/// warm pass that copies it into every faster writable tier. Each resolver
/// remembers which tiers already hold the current value of a key, so repeated
/// fetches within a session do not rewrite them.
#[derive(Clone)]
pub struct TieredResolver {
  tiers: Arc<Vec<Arc<dyn Tier>>>,
  found_in: FoundInSet,
  policy: AbsentPolicy,
}

impl TieredResolver {
  /// Build a resolver; tiers may be given in any order but each kind at most once.
  pub fn new(mut tiers: Vec<Arc<dyn Tier>>, policy: AbsentPolicy) -> Result<Self> {
    if tiers.is_empty() {
      return Err(StoreError::Parameter(
        "a resolver needs at least one tier".to_string(),
      ));
    }

    tiers.sort_by_key(|tier| tier.kind());
    if let Some(pair) = tiers.windows(2).find(|pair| pair[0].kind() == pair[1].kind()) {
      return Err(StoreError::Parameter(format!(
        "tier {} configured more than once",
        pair[0].kind()
      )));
    }

    Ok(Self {
      tiers: Arc::new(tiers),
      found_in: Arc::new(Mutex::new(HashMap::new())),
      policy,
    })
  }

  pub fn policy(&self) -> AbsentPolicy {
    self.policy
  }

  pub fn tier_kinds(&self) -> Vec<TierKind> {
    self.tiers.iter().map(|tier| tier.kind()).collect()
  }

  /// Tiers known to hold the current value of `key`.
  pub fn known_tiers(&self, key: &str) -> Vec<TierKind> {
    let mut kinds: Vec<TierKind> = lock(&self.found_in)
      .get(key)
      .map(|found| found.tiers.iter().copied().collect())
      .unwrap_or_default();
    kinds.sort();
    kinds
  }

  /// Forget what is known about `key`, so the next warm rewrites every tier.
  pub fn forget(&self, key: &str) {
    lock(&self.found_in).remove(key);
  }

  /// Query tiers in priority order and return the first present value.
  ///
  /// A failing tier is logged and skipped. If no tier yields a value and at
  /// least one tier failed, the first failure is returned; otherwise the
  /// result is absent.
  pub async fn fetch(&self, key: &str, options: &FetchOptions) -> Result<Fetched> {
    validate_key(key)?;
    let mut first_error: Option<StoreError> = None;

    for tier in self.tiers.iter() {
      let kind = tier.kind();
      match tier.get(key, &options.for_tier(kind)).await {
        Ok(found) if self.policy.is_present(&found) => {
          let Some(value) = found else {
            continue;
          };
          debug!(key, tier = %kind, "Resolved");
          mark_found(&self.found_in, key, &fingerprint(&value), kind);
          let warming = self.spawn_warm(key, value.clone(), Some(kind), options);
          return Ok(Fetched {
            value: Some(value),
            outcome: kind.into(),
            warming,
          });
        }
        Ok(_) => {
          debug!(key, tier = %kind, "Miss");
          mark_missing(&self.found_in, key, kind);
        }
        Err(e) => {
          warn!(key, tier = %kind, error = %e, "Tier read failed");
          first_error.get_or_insert(e);
        }
      }
    }

    match first_error {
      Some(e) => Err(e),
      None => {
        debug!(key, "Absent from every tier");
        Ok(Fetched::absent())
      }
    }
  }

  /// Write `value` into every writable tier not already known to hold it.
  pub fn warm(&self, key: &str, value: Value, options: &FetchOptions) -> Result<WarmHandle> {
    validate_key(key)?;
    Ok(self.spawn_warm(key, value, None, options))
  }

  /// Tiers a warm pass should write, given where the value came from.
  fn warm_targets(
    &self,
    key: &str,
    fingerprint: &str,
    source: Option<TierKind>,
  ) -> Vec<Arc<dyn Tier>> {
    let found_in = lock(&self.found_in);
    let known = found_in
      .get(key)
      .filter(|found| found.fingerprint == fingerprint)
      .map(|found| &found.tiers);

    self
      .tiers
      .iter()
      .filter(|tier| tier.is_writable())
      .filter(|tier| source.map(|source| tier.kind() < source).unwrap_or(true))
      .filter(|tier| !known.map(|tiers| tiers.contains(&tier.kind())).unwrap_or(false))
      // The authoritative tier only takes values that came from a canonical source
      .filter(|tier| {
        tier.kind() != TierKind::RemoteAuthoritative
          || source.map(|source| source.is_remote()).unwrap_or(true)
      })
      .cloned()
      .collect()
  }

  fn spawn_warm(
    &self,
    key: &str,
    value: Value,
    source: Option<TierKind>,
    options: &FetchOptions,
  ) -> WarmHandle {
    let fingerprint = fingerprint(&value);
    let targets = self.warm_targets(key, &fingerprint, source);
    if targets.is_empty() {
      return WarmHandle::idle();
    }

    let key = key.to_string();
    let options = options.clone();
    let found_in = Arc::clone(&self.found_in);

    let task = tokio::spawn(async move {
      let writes = targets.into_iter().map(|tier| {
        let kind = tier.kind();
        let tier_options = options.for_tier(kind);
        let key = key.as_str();
        let value = &value;
        async move { (kind, tier.set(key, value, &tier_options).await) }
      });

      let mut report = WarmReport::default();
      for (kind, result) in join_all(writes).await {
        match result {
          Ok(()) => {
            mark_found(&found_in, &key, &fingerprint, kind);
            report.written.push(kind);
          }
          Err(e) => {
            warn!(key = %key, tier = %kind, error = %e, "Warming failed");
            report.failed.push((kind, e.to_string()));
          }
        }
      }
      report.written.sort();
      report
    });

    WarmHandle { task: Some(task) }
  }
}

fn validate_key(key: &str) -> Result<()> {
  if key.trim().is_empty() {
    return Err(StoreError::Parameter("key must not be empty".to_string()));
  }
  Ok(())
}
