//! In-process tiers: the volatile cache and the session store.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

use super::traits::{Tier, TierEntry, TierKind, TierOptions};
use crate::error::Result;

/// TTL-aware map held entirely in memory.
///
/// Expired entries are dropped lazily when read.
pub struct MemoryTier {
  kind: TierKind,
  entries: Mutex<HashMap<String, TierEntry>>,
}

impl MemoryTier {
  pub fn new(kind: TierKind) -> Self {
    Self {
      kind,
      entries: Mutex::new(HashMap::new()),
    }
  }

  pub fn cache() -> Self {
    Self::new(TierKind::Cache)
  }

  pub fn session() -> Self {
    Self::new(TierKind::Session)
  }

  fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, TierEntry>> {
    // A panic while holding the lock cannot leave a half-written entry
    self
      .entries
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  pub fn remove(&self, key: &str) -> bool {
    self.entries().remove(key).is_some()
  }

  pub fn clear(&self) {
    self.entries().clear();
  }

  pub fn len(&self) -> usize {
    self.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

#[async_trait]
impl Tier for MemoryTier {
  fn kind(&self) -> TierKind {
    self.kind
  }

  async fn get(&self, key: &str, _options: &TierOptions) -> Result<Option<Value>> {
    let mut entries = self.entries();
    match entries.get(key) {
      Some(entry) if entry.is_expired() => {
        debug!(tier = %self.kind, key, "Dropping expired entry");
        entries.remove(key);
        Ok(None)
      }
      Some(entry) => Ok(Some(entry.value.clone())),
      None => Ok(None),
    }
  }

  async fn set(&self, key: &str, value: &Value, options: &TierOptions) -> Result<()> {
    let entry = TierEntry::new(value.clone(), options.ttl);
    self.entries().insert(key.to_string(), entry);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::time::Duration;

  #[tokio::test]
  async fn test_set_then_get() {
    let tier = MemoryTier::cache();
    let options = TierOptions::default();
    tier.set("a.json", &json!({"x": 1}), &options).await.unwrap();

    assert_eq!(
      tier.get("a.json", &options).await.unwrap(),
      Some(json!({"x": 1}))
    );
    assert_eq!(tier.get("b.json", &options).await.unwrap(), None);
  }

  #[tokio::test]
  async fn test_expired_entry_is_dropped_on_read() {
    let tier = MemoryTier::session();
    let options = TierOptions {
      ttl: Some(Duration::from_millis(1)),
      ..Default::default()
    };
    tier.set("a.json", &json!(true), &options).await.unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(tier.get("a.json", &options).await.unwrap(), None);
    assert!(tier.is_empty());
  }
}
