//! Test doubles for tiers and remote document stores.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::traits::{Tier, TierKind, TierOptions};
use crate::error::{Result, StoreError};
use crate::remote::{DocumentStore, Quota};

/// In-memory tier that records every write.
pub struct RecordingTier {
  kind: TierKind,
  writable: bool,
  values: Mutex<HashMap<String, Value>>,
  writes: Mutex<Vec<(String, TierOptions)>>,
  fail_reads: bool,
  fail_writes: bool,
}

impl RecordingTier {
  pub fn new(kind: TierKind) -> Self {
    Self {
      kind,
      writable: !matches!(kind, TierKind::RemoteReadonly | TierKind::Direct),
      values: Mutex::new(HashMap::new()),
      writes: Mutex::new(Vec::new()),
      fail_reads: false,
      fail_writes: false,
    }
  }

  pub fn failing_reads(mut self) -> Self {
    self.fail_reads = true;
    self
  }

  pub fn failing_writes(mut self) -> Self {
    self.fail_writes = true;
    self
  }

  pub fn seed(self, key: &str, value: Value) -> Self {
    self.values.lock().unwrap().insert(key.to_string(), value);
    self
  }

  pub fn value(&self, key: &str) -> Option<Value> {
    self.values.lock().unwrap().get(key).cloned()
  }

  pub fn write_count(&self) -> usize {
    self.writes.lock().unwrap().len()
  }

  pub fn last_write_options(&self) -> Option<TierOptions> {
    self.writes.lock().unwrap().last().map(|(_, o)| o.clone())
  }
}

#[async_trait]
impl Tier for RecordingTier {
  fn kind(&self) -> TierKind {
    self.kind
  }

  fn is_writable(&self) -> bool {
    self.writable
  }

  async fn get(&self, key: &str, _options: &TierOptions) -> Result<Option<Value>> {
    if self.fail_reads {
      return Err(StoreError::NotAuthenticated("recording tier"));
    }
    Ok(self.value(key))
  }

  async fn set(&self, key: &str, value: &Value, options: &TierOptions) -> Result<()> {
    self
      .writes
      .lock()
      .unwrap()
      .push((key.to_string(), options.clone()));
    if self.fail_writes {
      return Err(StoreError::RemoteServer { status: 503 });
    }
    self
      .values
      .lock()
      .unwrap()
      .insert(key.to_string(), value.clone());
    Ok(())
  }
}

/// In-memory document store. File ids are document names.
#[derive(Default)]
pub struct MemoryDocumentStore {
  pub documents: Mutex<HashMap<String, Value>>,
  pub failing_deletes: Mutex<HashSet<String>>,
  pub quota: Mutex<Option<Quota>>,
  pub quota_calls: Mutex<usize>,
}

impl MemoryDocumentStore {
  pub fn insert(&self, name: &str, value: Value) {
    self
      .documents
      .lock()
      .unwrap()
      .insert(name.to_string(), value);
  }

  pub fn document(&self, name: &str) -> Option<Value> {
    self.documents.lock().unwrap().get(name).cloned()
  }

  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.documents.lock().unwrap().keys().cloned().collect();
    names.sort();
    names
  }

  pub fn fail_delete_of(&self, file_id: &str) {
    self
      .failing_deletes
      .lock()
      .unwrap()
      .insert(file_id.to_string());
  }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
  async fn get_document(&self, name: &str) -> Result<Option<Value>> {
    Ok(self.document(name))
  }

  async fn put_document(&self, name: &str, value: &Value) -> Result<()> {
    self.insert(name, value.clone());
    Ok(())
  }

  async fn delete_file(&self, file_id: &str) -> Result<()> {
    if self.failing_deletes.lock().unwrap().contains(file_id) {
      return Err(StoreError::Network {
        attempts: 4,
        message: "connection reset".to_string(),
      });
    }
    self.documents.lock().unwrap().remove(file_id);
    Ok(())
  }

  async fn quota(&self) -> Result<Quota> {
    *self.quota_calls.lock().unwrap() += 1;
    self
      .quota
      .lock()
      .unwrap()
      .ok_or(StoreError::Http { status: 403 })
  }
}
