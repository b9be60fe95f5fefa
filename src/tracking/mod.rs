//! Sharded, versioned tracking map.
//!
//! The remote store has no native TTL, so expiration, tags and ownership of
//! remote files are recorded here and persisted as 16 shard documents
//! (`<prefix><digit>.json`). The in-memory map is mutated without
//! coordination between concurrent callers: two overlapping `update`/`prune`
//! calls race and the later shard write wins. Callers that need strict
//! per-id ordering must serialize their calls.

mod codec;
mod shard;
mod types;

pub use codec::Shard;
pub use shard::{shard_key, shard_name, SHARD_DIGITS};
pub use types::{TrackingEntry, TrackingMetadata, VersionEntry};

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::remote::DocumentStore;

pub const DEFAULT_SHARD_PREFIX: &str = "tracking-map.";

/// Settings for persisting shards.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SaveOptions {
  pub compress: bool,
  /// Warn when remote usage/limit reaches this ratio. Never blocks the save.
  pub quota_warning_ratio: Option<f64>,
}

impl Default for SaveOptions {
  fn default() -> Self {
    Self {
      compress: true,
      quota_warning_ratio: None,
    }
  }
}

/// Outcome of a save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
  pub written: Vec<char>,
  pub failed: Vec<char>,
}

type EntryCheck = Box<dyn Fn(&str, &TrackingEntry) -> bool + Send + Sync>;
type EntryCallback = Box<dyn Fn(&str, &TrackingEntry) + Send + Sync>;

/// How `prune` decides what to delete.
#[derive(Default)]
pub struct PruneOptions {
  /// Overdue entries younger than this are only warned about.
  pub grace_period: Option<Duration>,
  /// Upper bound on deletions per call.
  pub max_prune: Option<usize>,
  /// Replaces the `expires`/grace logic entirely when set.
  pub is_expired: Option<EntryCheck>,
  /// Called for entries inside their grace period.
  pub on_warning: Option<EntryCallback>,
  /// Reference time; defaults to now.
  pub now: Option<DateTime<Utc>>,
}

impl PruneOptions {
  pub fn with_grace_period(mut self, grace: Duration) -> Self {
    self.grace_period = Some(grace);
    self
  }

  pub fn with_max_prune(mut self, max: usize) -> Self {
    self.max_prune = Some(max);
    self
  }

  pub fn with_predicate<F>(mut self, predicate: F) -> Self
  where
    F: Fn(&str, &TrackingEntry) -> bool + Send + Sync + 'static,
  {
    self.is_expired = Some(Box::new(predicate));
    self
  }

  pub fn with_warning<F>(mut self, callback: F) -> Self
  where
    F: Fn(&str, &TrackingEntry) + Send + Sync + 'static,
  {
    self.on_warning = Some(Box::new(callback));
    self
  }

  pub fn at(mut self, now: DateTime<Utc>) -> Self {
    self.now = Some(now);
    self
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tracking map persisted as 16 shards on a document store.
pub struct ShardedTrackingMap {
  store: Arc<dyn DocumentStore>,
  prefix: String,
  save_options: SaveOptions,
  entries: Mutex<BTreeMap<String, TrackingEntry>>,
  /// Shards known to exist remotely; emptied shards must still be rewritten
  persisted: Mutex<BTreeSet<char>>,
  loaded: AtomicBool,
}

impl ShardedTrackingMap {
  pub fn new(store: Arc<dyn DocumentStore>, prefix: &str) -> Self {
    Self {
      store,
      prefix: prefix.to_string(),
      save_options: SaveOptions::default(),
      entries: Mutex::new(BTreeMap::new()),
      persisted: Mutex::new(BTreeSet::new()),
      loaded: AtomicBool::new(false),
    }
  }

  /// Options used by the saves `update` and `prune` trigger.
  pub fn with_save_options(mut self, options: SaveOptions) -> Self {
    self.save_options = options;
    self
  }

  pub fn shard_name(&self, digit: char) -> String {
    shard_name(&self.prefix, digit)
  }

  /// Load all shards and replace the in-memory map with their union.
  ///
  /// A shard that is missing, unreadable or undecodable contributes nothing.
  pub async fn load(&self) -> BTreeMap<String, TrackingEntry> {
    let reads = SHARD_DIGITS.iter().map(|digit| {
      let name = self.shard_name(*digit);
      async move {
        let result = self.store.get_document(&name).await;
        (*digit, result, name)
      }
    });

    let mut merged = BTreeMap::new();
    let mut persisted = BTreeSet::new();
    for (digit, result, name) in join_all(reads).await {
      match result {
        Ok(Some(document)) => {
          persisted.insert(digit);
          match codec::decode(document) {
            Ok(shard) => merged.extend(shard),
            Err(e) => warn!(shard = %name, error = %e, "Ignoring undecodable shard"),
          }
        }
        Ok(None) => debug!(shard = %name, "Shard not present"),
        Err(e) => warn!(shard = %name, error = %e, "Failed to load shard"),
      }
    }

    *lock(&self.persisted) = persisted;
    *lock(&self.entries) = merged.clone();
    self.loaded.store(true, Ordering::SeqCst);
    merged
  }

  /// Load the shards unless this map has already loaded them once.
  pub async fn ensure_loaded(&self) {
    if !self.loaded.load(Ordering::SeqCst) {
      self.load().await;
    }
  }

  /// Persist every non-empty shard, plus previously persisted shards that
  /// are now empty.
  pub async fn save(&self, options: &SaveOptions) -> SaveReport {
    if let Some(threshold) = options.quota_warning_ratio {
      self.check_quota(threshold).await;
    }

    let shards = shard::partition(&lock(&self.entries));
    let digits: BTreeSet<char> = shards
      .keys()
      .copied()
      .chain(lock(&self.persisted).iter().copied())
      .collect();

    let writes = digits.into_iter().map(|digit| {
      let name = self.shard_name(digit);
      let shard = shards.get(&digit).cloned().unwrap_or_default();
      async move {
        let result = match codec::encode(&shard, options.compress) {
          Ok(document) => self.store.put_document(&name, &document).await,
          Err(e) => Err(e),
        };
        (digit, shard.is_empty(), result, name)
      }
    });

    let mut report = SaveReport::default();
    for (digit, empty, result, name) in join_all(writes).await {
      match result {
        Ok(()) => {
          let mut persisted = lock(&self.persisted);
          if empty {
            persisted.remove(&digit);
          } else {
            persisted.insert(digit);
          }
          report.written.push(digit);
        }
        Err(e) => {
          warn!(shard = %name, error = %e, "Failed to save shard");
          report.failed.push(digit);
        }
      }
    }
    report
  }

  async fn check_quota(&self, threshold: f64) {
    match self.store.quota().await {
      Ok(quota) => {
        if let Some(ratio) = quota.usage_ratio() {
          if ratio >= threshold {
            warn!(
              usage = quota.usage,
              limit = quota.limit,
              ratio,
              "Remote storage usage above warning threshold"
            );
          }
        }
      }
      Err(e) => debug!(error = %e, "Quota check failed; saving anyway"),
    }
  }

  /// Record a new version for `id` and persist.
  pub async fn update(&self, id: &str, metadata: TrackingMetadata) -> Result<SaveReport> {
    if id.trim().is_empty() {
      return Err(StoreError::Parameter("file id must not be empty".to_string()));
    }

    lock(&self.entries)
      .entry(id.to_string())
      .or_default()
      .record(metadata, Utc::now());

    Ok(self.save(&self.save_options).await)
  }

  /// Copy of the version history for `id`; empty if untracked.
  pub fn versions(&self, id: &str) -> Vec<VersionEntry> {
    lock(&self.entries)
      .get(id)
      .map(|entry| entry.versions.clone())
      .unwrap_or_default()
  }

  pub fn get(&self, id: &str) -> Option<TrackingEntry> {
    lock(&self.entries).get(id).cloned()
  }

  pub fn ids(&self) -> Vec<String> {
    lock(&self.entries).keys().cloned().collect()
  }

  pub fn len(&self) -> usize {
    lock(&self.entries).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Drop an entry locally without touching the remote file.
  pub fn remove(&self, id: &str) -> Option<TrackingEntry> {
    lock(&self.entries).remove(id)
  }

  /// Delete remote files whose entries have expired.
  ///
  /// Returns how many files were actually deleted; failed deletions are
  /// logged, keep their entries and are not counted.
  pub async fn prune(&self, options: PruneOptions) -> usize {
    let now = options.now.unwrap_or_else(Utc::now);
    let snapshot = lock(&self.entries).clone();

    let mut doomed = Vec::new();
    for (id, entry) in &snapshot {
      if let Some(is_expired) = &options.is_expired {
        if is_expired(id.as_str(), entry) {
          doomed.push(id.clone());
        }
        continue;
      }

      let Some(expires) = entry.expires() else {
        continue;
      };
      if expires > now {
        continue;
      }

      let overdue = (now - expires).to_std().unwrap_or_default();
      match options.grace_period {
        Some(grace) if overdue < grace => {
          debug!(id = %id, "Entry expired but inside grace period");
          if let Some(on_warning) = &options.on_warning {
            on_warning(id.as_str(), entry);
          }
        }
        _ => doomed.push(id.clone()),
      }
    }

    if let Some(max) = options.max_prune {
      doomed.truncate(max);
    }
    if doomed.is_empty() {
      return 0;
    }

    let deletions = doomed.iter().map(|id| async move {
      let result = self.store.delete_file(id).await;
      (id, result)
    });

    let mut deleted = Vec::new();
    for (id, result) in join_all(deletions).await {
      match result {
        Ok(()) => deleted.push(id.clone()),
        Err(e) => warn!(id = %id, error = %e, "Failed to delete expired file"),
      }
    }

    if !deleted.is_empty() {
      {
        let mut entries = lock(&self.entries);
        for id in &deleted {
          entries.remove(id);
        }
      }
      self.save(&self.save_options).await;
    }

    info!(
      pruned = deleted.len(),
      attempted = doomed.len(),
      "Tracking map prune finished"
    );
    deleted.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::testing::MemoryDocumentStore;
  use crate::remote::Quota;
  use std::sync::atomic::AtomicUsize;

  fn ts(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap()
  }

  fn map(store: &Arc<MemoryDocumentStore>) -> ShardedTrackingMap {
    ShardedTrackingMap::new(store.clone(), DEFAULT_SHARD_PREFIX)
  }

  async fn seeded(
    store: &Arc<MemoryDocumentStore>,
    entries: &[(&str, DateTime<Utc>)],
  ) -> ShardedTrackingMap {
    let tracking = map(store);
    for (id, expires) in entries {
      store.insert(id, serde_json::json!({"file": id}));
      tracking
        .update(id, TrackingMetadata::expiring_at(*expires))
        .await
        .unwrap();
    }
    tracking
  }

  #[tokio::test]
  async fn test_save_writes_only_populated_shards_and_loads_back() {
    let store = Arc::new(MemoryDocumentStore::default());
    let tracking = map(&store);
    tracking
      .update("3abc", TrackingMetadata::expiring_at(ts("2026-05-01T00:00:00Z")))
      .await
      .unwrap();
    tracking
      .update("a1", TrackingMetadata::expiring_at(ts("2026-06-01T00:00:00Z")))
      .await
      .unwrap();

    assert_eq!(
      store.names(),
      vec!["tracking-map.3.json", "tracking-map.a.json"]
    );

    let fresh = map(&store);
    let loaded = fresh.load().await;
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded.get("3abc"), tracking.get("3abc").as_ref());
    assert_eq!(loaded.get("a1"), tracking.get("a1").as_ref());
  }

  #[tokio::test]
  async fn test_plain_and_compressed_round_trip() {
    for compress in [true, false] {
      let store = Arc::new(MemoryDocumentStore::default());
      let tracking = map(&store).with_save_options(SaveOptions {
        compress,
        quota_warning_ratio: None,
      });
      tracking
        .update(
          "b7",
          TrackingMetadata {
            tags: Some(vec!["org".into()]),
            owner: Some("ops".into()),
            ..Default::default()
          },
        )
        .await
        .unwrap();

      let document = store.document("tracking-map.b.json").unwrap();
      assert_eq!(document.get("encoding").is_some(), compress);

      let fresh = map(&store);
      fresh.load().await;
      assert_eq!(fresh.get("b7"), tracking.get("b7"));
    }
  }

  #[tokio::test]
  async fn test_load_skips_bad_shards() {
    let store = Arc::new(MemoryDocumentStore::default());
    let tracking = seeded(&store, &[("c1", ts("2026-01-01T00:00:00Z"))]).await;
    store.insert(
      "tracking-map.5.json",
      serde_json::json!({"encoding": "gzip+base64", "data": "not base64!"}),
    );

    let fresh = map(&store);
    let loaded = fresh.load().await;
    assert_eq!(loaded.keys().collect::<Vec<_>>(), vec!["c1"]);
    assert_eq!(fresh.get("c1"), tracking.get("c1"));
  }

  #[tokio::test]
  async fn test_update_appends_versions() {
    let store = Arc::new(MemoryDocumentStore::default());
    let tracking = map(&store);
    tracking
      .update("d4", TrackingMetadata::expiring_at(ts("2026-01-01T00:00:00Z")))
      .await
      .unwrap();
    tracking
      .update("d4", TrackingMetadata::expiring_at(ts("2026-02-01T00:00:00Z")))
      .await
      .unwrap();

    let mut versions = tracking.versions("d4");
    assert_eq!(versions.len(), 2);
    assert_eq!(versions[0].metadata.expires, Some(ts("2026-01-01T00:00:00Z")));
    assert_eq!(
      tracking.get("d4").unwrap().expires(),
      Some(ts("2026-02-01T00:00:00Z"))
    );

    // Returned history is a copy
    versions.clear();
    assert_eq!(tracking.versions("d4").len(), 2);
    assert!(tracking.versions("unknown").is_empty());
  }

  #[tokio::test]
  async fn test_ensure_loaded_loads_once() {
    let store = Arc::new(MemoryDocumentStore::default());
    seeded(&store, &[("c1", ts("2026-01-01T00:00:00Z"))]).await;

    let tracking = map(&store);
    tracking.ensure_loaded().await;
    assert_eq!(tracking.ids(), vec!["c1"]);

    // Local changes survive a second call
    tracking.remove("c1");
    tracking.ensure_loaded().await;
    assert!(tracking.is_empty());
  }

  #[tokio::test]
  async fn test_concurrent_updates_in_one_shard() {
    let store = Arc::new(MemoryDocumentStore::default());
    let tracking = map(&store);

    let (first, second) = tokio::join!(
      tracking.update("b1", TrackingMetadata::expiring_at(ts("2026-05-01T00:00:00Z"))),
      tracking.update("b2", TrackingMetadata::expiring_at(ts("2026-06-01T00:00:00Z"))),
    );
    assert_eq!(first.unwrap().written, vec!['b']);
    assert_eq!(second.unwrap().written, vec!['b']);

    // Both land in memory. The in-memory store finishes each save before the
    // next one starts, so the last save saw both entries; against a slow store
    // an earlier snapshot can land last and drop one from the shard.
    assert_eq!(tracking.ids(), vec!["b1", "b2"]);
    let fresh = map(&store);
    assert_eq!(fresh.load().await.len(), 2);

    // Two maps over one store do not see each other: the later save wins.
    let other = map(&store);
    other
      .update("b3", TrackingMetadata::default())
      .await
      .unwrap();
    let reloaded = map(&store).load().await;
    assert_eq!(reloaded.keys().collect::<Vec<_>>(), vec!["b3"]);
  }

  #[tokio::test]
  async fn test_update_rejects_empty_id() {
    let store = Arc::new(MemoryDocumentStore::default());
    assert!(matches!(
      map(&store).update("", TrackingMetadata::default()).await,
      Err(StoreError::Parameter(_))
    ));
  }

  #[tokio::test]
  async fn test_grace_period_warns_instead_of_deleting() {
    let now = ts("2026-04-01T12:00:00Z");
    let expired = now - chrono::Duration::minutes(5);
    let store = Arc::new(MemoryDocumentStore::default());
    let tracking = seeded(&store, &[("e9", expired)]).await;

    let warnings = Arc::new(AtomicUsize::new(0));
    let counter = warnings.clone();
    let pruned = tracking
      .prune(
        PruneOptions::default()
          .with_grace_period(Duration::from_secs(600))
          .with_warning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
          })
          .at(now),
      )
      .await;
    assert_eq!(pruned, 0);
    assert_eq!(warnings.load(Ordering::SeqCst), 1);
    assert!(store.document("e9").is_some());

    let pruned = tracking
      .prune(
        PruneOptions::default()
          .with_grace_period(Duration::from_secs(60))
          .at(now),
      )
      .await;
    assert_eq!(pruned, 1);
    assert!(store.document("e9").is_none());
    assert!(tracking.get("e9").is_none());
  }

  #[tokio::test]
  async fn test_prune_without_grace_deletes_overdue_only() {
    let now = ts("2026-04-01T12:00:00Z");
    let store = Arc::new(MemoryDocumentStore::default());
    let tracking = seeded(
      &store,
      &[
        ("11", now - chrono::Duration::days(1)),
        ("22", now + chrono::Duration::days(1)),
      ],
    )
    .await;
    tracking
      .update("33", TrackingMetadata::default())
      .await
      .unwrap();

    assert_eq!(tracking.prune(PruneOptions::default().at(now)).await, 1);
    assert_eq!(tracking.ids(), vec!["22", "33"]);
  }

  #[tokio::test]
  async fn test_max_prune_caps_deletions() {
    let now = ts("2026-04-01T12:00:00Z");
    let old = now - chrono::Duration::days(3);
    let store = Arc::new(MemoryDocumentStore::default());
    let tracking = seeded(&store, &[("a", old), ("b", old), ("c", old)]).await;

    let pruned = tracking
      .prune(PruneOptions::default().with_max_prune(2).at(now))
      .await;
    assert_eq!(pruned, 2);
    assert_eq!(tracking.len(), 1);
  }

  #[tokio::test]
  async fn test_predicate_overrides_expiry() {
    let now = ts("2026-04-01T12:00:00Z");
    let store = Arc::new(MemoryDocumentStore::default());
    let tracking = seeded(
      &store,
      &[
        ("1old", now - chrono::Duration::days(1)),
        ("2new", now + chrono::Duration::days(1)),
      ],
    )
    .await;

    let pruned = tracking
      .prune(
        PruneOptions::default()
          .with_predicate(|id, _| id == "2new")
          .at(now),
      )
      .await;
    assert_eq!(pruned, 1);
    assert_eq!(tracking.ids(), vec!["1old"]);
  }

  #[tokio::test]
  async fn test_failed_delete_is_not_counted() {
    let now = ts("2026-04-01T12:00:00Z");
    let old = now - chrono::Duration::days(1);
    let store = Arc::new(MemoryDocumentStore::default());
    let tracking = seeded(&store, &[("f1", old), ("f2", old)]).await;
    store.fail_delete_of("f2");

    let pruned = tracking.prune(PruneOptions::default().at(now)).await;
    assert_eq!(pruned, 1);
    assert_eq!(tracking.ids(), vec!["f2"]);

    // The persisted shard reflects only the successful deletion
    let fresh = map(&store);
    assert_eq!(fresh.load().await.keys().collect::<Vec<_>>(), vec!["f2"]);
  }

  #[tokio::test]
  async fn test_emptied_shard_is_rewritten() {
    let now = ts("2026-04-01T12:00:00Z");
    let store = Arc::new(MemoryDocumentStore::default());
    let tracking = seeded(&store, &[("7x", now - chrono::Duration::days(1))]).await;

    assert_eq!(tracking.prune(PruneOptions::default().at(now)).await, 1);

    let fresh = map(&store);
    assert!(fresh.load().await.is_empty());
  }

  #[tokio::test]
  async fn test_quota_check_is_advisory() {
    let store = Arc::new(MemoryDocumentStore::default());
    *store.quota.lock().unwrap() = Some(Quota {
      usage: 95,
      limit: Some(100),
    });
    let options = SaveOptions {
      compress: true,
      quota_warning_ratio: Some(0.9),
    };
    let tracking = map(&store).with_save_options(options);
    tracking
      .update("9a", TrackingMetadata::default())
      .await
      .unwrap();
    assert_eq!(*store.quota_calls.lock().unwrap(), 1);
    assert!(store.document("tracking-map.9.json").is_some());

    // A failing quota query does not block the save either
    *store.quota.lock().unwrap() = None;
    let report = tracking.save(&options).await;
    assert_eq!(report.written, vec!['9']);
    assert_eq!(*store.quota_calls.lock().unwrap(), 2);
  }
}
