//! Local tier: TTL-aware key/value store backed by SQLite.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::traits::{Tier, TierKind, TierOptions};
use crate::error::{Result, StoreError};

/// Schema for the local tier.
///
/// `key_registry` is the authority on which keys exist; `local_entries`
/// holds the payloads. A NULL `expires_at` means the value never expires.
const LOCAL_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS local_entries (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    expires_at INTEGER
);

CREATE TABLE IF NOT EXISTS key_registry (
    key TEXT PRIMARY KEY
);
"#;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Storage half of the local tier, shared with the prune task.
struct LocalStore {
  conn: Mutex<Connection>,
  /// In-memory mirror of `key_registry`
  registry: Mutex<HashSet<String>>,
}

impl LocalStore {
  fn new(conn: Connection) -> Result<Self> {
    conn.execute_batch(LOCAL_SCHEMA)?;

    let registry = {
      let mut stmt = conn.prepare("SELECT key FROM key_registry")?;
      let keys = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<HashSet<String>>>()?;
      keys
    };

    Ok(Self {
      conn: Mutex::new(conn),
      registry: Mutex::new(registry),
    })
  }

  fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
    let data = serde_json::to_string(value)?;
    let expires_at = ttl
      .filter(|ttl| !ttl.is_zero())
      .and_then(|ttl| i64::try_from(ttl.as_millis()).ok())
      .and_then(|ttl| Utc::now().timestamp_millis().checked_add(ttl));

    let mut conn = lock(&self.conn);
    let tx = conn.transaction()?;
    tx.execute(
      "INSERT OR REPLACE INTO local_entries (key, value, expires_at) VALUES (?, ?, ?)",
      params![key, data, expires_at],
    )?;
    tx.execute(
      "INSERT OR IGNORE INTO key_registry (key) VALUES (?)",
      params![key],
    )?;
    tx.commit()?;

    lock(&self.registry).insert(key.to_string());
    Ok(())
  }

  fn get(&self, key: &str) -> Result<Option<Value>> {
    if !lock(&self.registry).contains(key) {
      return Ok(None);
    }

    let row: Option<(String, Option<i64>)> = {
      let conn = lock(&self.conn);
      conn
        .query_row(
          "SELECT value, expires_at FROM local_entries WHERE key = ?",
          params![key],
          |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?
    };

    match row {
      None => {
        // Registered but the payload is gone; heal the registry
        self.delete(key)?;
        Ok(None)
      }
      Some((_, Some(expires_at))) if expires_at <= Utc::now().timestamp_millis() => {
        debug!(key, "Local entry expired");
        self.delete(key)?;
        Ok(None)
      }
      Some((data, _)) => Ok(Some(serde_json::from_str(&data)?)),
    }
  }

  fn delete(&self, key: &str) -> Result<bool> {
    let mut conn = lock(&self.conn);
    let tx = conn.transaction()?;
    let removed = tx.execute("DELETE FROM local_entries WHERE key = ?", params![key])?;
    tx.execute("DELETE FROM key_registry WHERE key = ?", params![key])?;
    tx.commit()?;

    let registered = lock(&self.registry).remove(key);
    Ok(removed > 0 || registered)
  }

  fn clear(&self) -> Result<()> {
    let conn = lock(&self.conn);
    conn.execute_batch("DELETE FROM local_entries; DELETE FROM key_registry;")?;
    lock(&self.registry).clear();
    Ok(())
  }

  fn keys(&self) -> Vec<String> {
    let mut keys: Vec<String> = lock(&self.registry).iter().cloned().collect();
    keys.sort();
    keys
  }

  fn has_key(&self, key: &str) -> bool {
    lock(&self.registry).contains(key)
  }

  /// Touch every registered key so expired ones are reclaimed.
  fn prune(&self) -> usize {
    let mut reclaimed = 0;
    for key in self.keys() {
      match self.get(&key) {
        Ok(None) => reclaimed += 1,
        Ok(Some(_)) => {}
        Err(e) => warn!(key, error = %e, "Failed to check local entry during prune"),
      }
    }
    reclaimed
  }
}

/// State of the background prune timer.
#[derive(Default)]
struct PruneTimer {
  interval: Option<Duration>,
  handle: Option<JoinHandle<()>>,
}

impl PruneTimer {
  fn halt(&mut self) {
    if let Some(handle) = self.handle.take() {
      handle.abort();
    }
  }
}

/// Persistent local tier.
///
/// Existence is decided by the key registry, not by the payload table:
/// a key missing from the registry is absent even if a payload row exists.
pub struct LocalTier {
  store: Arc<LocalStore>,
  timer: Mutex<PruneTimer>,
}

impl LocalTier {
  /// Open or create the local tier at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the local tier at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        StoreError::Parameter(format!(
          "cannot create local tier directory {}: {}",
          parent.display(),
          e
        ))
      })?;
    }

    let conn = Connection::open(path)?;
    Self::with_connection(conn)
  }

  /// Local tier that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    Ok(Self {
      store: Arc::new(LocalStore::new(conn)?),
      timer: Mutex::new(PruneTimer::default()),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StoreError::Parameter("could not determine data directory".to_string()))?;

    Ok(data_dir.join("rosterkit").join("local.db"))
  }

  /// Store `value`; a `ttl` of `None` or zero means no expiration.
  pub fn set(&self, key: &str, value: &Value, ttl: Option<Duration>) -> Result<()> {
    validate_key(key)?;
    self.store.set(key, value, ttl)
  }

  pub fn get(&self, key: &str) -> Result<Option<Value>> {
    validate_key(key)?;
    self.store.get(key)
  }

  pub fn delete(&self, key: &str) -> Result<bool> {
    self.store.delete(key)
  }

  pub fn clear(&self) -> Result<()> {
    self.store.clear()
  }

  pub fn get_all_keys(&self) -> Vec<String> {
    self.store.keys()
  }

  pub fn has_key(&self, key: &str) -> bool {
    self.store.has_key(key)
  }

  /// Run one prune pass now and return how many keys were reclaimed.
  pub fn prune_now(&self) -> usize {
    self.store.prune()
  }

  /// Start the background prune timer, replacing any running one.
  ///
  /// Must be called from within a Tokio runtime.
  pub fn start_prune_timer(&self, interval: Duration) {
    let mut timer = lock(&self.timer);
    timer.halt();
    timer.interval = Some(interval);
    timer.handle = Some(spawn_prune_task(Arc::clone(&self.store), interval));
    info!(interval_ms = interval.as_millis() as u64, "Local prune timer started");
  }

  /// Stop the timer but remember its interval.
  pub fn pause_prune_timer(&self) {
    lock(&self.timer).halt();
  }

  /// Restart a paused timer with its last interval.
  pub fn resume_prune_timer(&self) {
    let interval = lock(&self.timer).interval;
    match interval {
      Some(interval) if !self.is_prune_timer_running() => self.start_prune_timer(interval),
      Some(_) => {}
      None => debug!("No prune interval configured; resume ignored"),
    }
  }

  /// Stop the timer and forget its interval.
  pub fn stop_prune_timer(&self) {
    let mut timer = lock(&self.timer);
    timer.halt();
    timer.interval = None;
  }

  pub fn is_prune_timer_running(&self) -> bool {
    lock(&self.timer)
      .handle
      .as_ref()
      .map(|handle| !handle.is_finished())
      .unwrap_or(false)
  }

  pub fn prune_interval(&self) -> Option<Duration> {
    lock(&self.timer).interval
  }
}

impl Drop for LocalTier {
  fn drop(&mut self) {
    lock(&self.timer).halt();
  }
}

fn spawn_prune_task(store: Arc<LocalStore>, interval: Duration) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;
    loop {
      ticker.tick().await;
      let reclaimed = store.prune();
      if reclaimed > 0 {
        debug!(reclaimed, "Local prune pass reclaimed entries");
      }
    }
  })
}

fn validate_key(key: &str) -> Result<()> {
  if key.is_empty() {
    return Err(StoreError::Parameter("local key must not be empty".to_string()));
  }
  Ok(())
}

#[async_trait]
impl Tier for LocalTier {
  fn kind(&self) -> TierKind {
    TierKind::Local
  }

  async fn get(&self, key: &str, _options: &TierOptions) -> Result<Option<Value>> {
    LocalTier::get(self, key)
  }

  async fn set(&self, key: &str, value: &Value, options: &TierOptions) -> Result<()> {
    LocalTier::set(self, key, value, options.ttl)
  }
}
