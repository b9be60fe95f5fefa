//! Tracking entries and their version history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Metadata recorded for a remote file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingMetadata {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expires: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tags: Option<Vec<String>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub owner: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub custom: Option<Map<String, Value>>,
}

impl TrackingMetadata {
  pub fn expiring_at(expires: DateTime<Utc>) -> Self {
    Self {
      expires: Some(expires),
      ..Default::default()
    }
  }
}

/// Immutable snapshot appended on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
  pub updated: DateTime<Utc>,
  #[serde(flatten)]
  pub metadata: TrackingMetadata,
}

/// Per-file record. The root fields always mirror the newest version.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackingEntry {
  #[serde(default)]
  pub versions: Vec<VersionEntry>,
  #[serde(flatten)]
  pub latest: TrackingMetadata,
}

impl TrackingEntry {
  /// Append a version and refresh the latest projection.
  pub fn record(&mut self, metadata: TrackingMetadata, now: DateTime<Utc>) {
    self.versions.push(VersionEntry {
      updated: now,
      metadata: metadata.clone(),
    });
    self.latest = metadata;
  }

  pub fn expires(&self) -> Option<DateTime<Utc>> {
    self.latest.expires
  }

  pub fn last_updated(&self) -> Option<DateTime<Utc>> {
    self.versions.last().map(|version| version.updated)
  }
}
