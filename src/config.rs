use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::TierTtls;
use crate::remote::RetryOptions;
use crate::tracking::{SaveOptions, DEFAULT_SHARD_PREFIX};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub remote: RemoteConfig,
  pub readonly: ReadonlyConfig,
  pub direct: DirectConfig,
  pub retry: RetryOptions,
  pub ttl: TtlConfig,
  pub local: LocalConfig,
  pub tracking: TrackingConfig,
  pub entities: EntitiesConfig,
}

/// Authoritative store endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
  pub api_base: String,
  pub upload_base: String,
  /// Storage space documents live in
  pub space: String,
}

impl Default for RemoteConfig {
  fn default() -> Self {
    Self {
      api_base: "https://www.googleapis.com/drive/v3".to_string(),
      upload_base: "https://www.googleapis.com/upload/drive/v3".to_string(),
      space: "appDataFolder".to_string(),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReadonlyConfig {
  /// Base URL of the public mirror; the tier is skipped when unset
  pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DirectConfig {
  /// Base URL static fallbacks are served from; skipped when unset
  pub base_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct TtlConfig {
  pub cache_minutes: u64,
  pub session_minutes: u64,
  pub local_minutes: u64,
}

impl Default for TtlConfig {
  fn default() -> Self {
    Self {
      cache_minutes: 30,
      session_minutes: 60,
      local_minutes: 120,
    }
  }
}

impl TtlConfig {
  pub fn tier_ttls(&self) -> TierTtls {
    let minutes = |m: u64| Duration::from_secs(m.saturating_mul(60));
    TierTtls {
      cache: minutes(self.cache_minutes),
      session: minutes(self.session_minutes),
      local: minutes(self.local_minutes),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
  /// Database path (default: $XDG_DATA_HOME/rosterkit/local.db)
  pub path: Option<PathBuf>,
  /// Background prune interval; 0 disables the timer
  pub prune_interval_secs: u64,
}

impl Default for LocalConfig {
  fn default() -> Self {
    Self {
      path: None,
      prune_interval_secs: 300,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
  pub prefix: String,
  pub compress: bool,
  /// Warn when remote usage/limit reaches this ratio
  pub quota_warning_ratio: Option<f64>,
}

impl Default for TrackingConfig {
  fn default() -> Self {
    Self {
      prefix: DEFAULT_SHARD_PREFIX.to_string(),
      compress: true,
      quota_warning_ratio: Some(0.9),
    }
  }
}

impl TrackingConfig {
  pub fn save_options(&self) -> SaveOptions {
    SaveOptions {
      compress: self.compress,
      quota_warning_ratio: self.quota_warning_ratio,
    }
  }
}

/// Document names for each entity.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EntitiesConfig {
  pub configuration_file: String,
  pub roster_file: String,
  pub organization_file: String,
  /// Static path of the configuration fallback, relative to `direct.base_url`
  pub configuration_fallback_path: Option<String>,
}

impl Default for EntitiesConfig {
  fn default() -> Self {
    Self {
      configuration_file: "configuration.json".to_string(),
      roster_file: "roster.json".to_string(),
      organization_file: "organization.json".to_string(),
      configuration_fallback_path: Some("configuration.json".to_string()),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./rosterkit.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/rosterkit/config.yaml
  ///
  /// With no file found the defaults are used.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("rosterkit.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("rosterkit").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn parse(contents: &str) -> Result<Self> {
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Get the bearer token for the authoritative store from the environment.
  ///
  /// Checks ROSTERKIT_ACCESS_TOKEN first, then GOOGLE_ACCESS_TOKEN as fallback.
  /// A missing token is not an error here; the authoritative tier reports it
  /// when it is actually used.
  pub fn access_token() -> Option<String> {
    std::env::var("ROSTERKIT_ACCESS_TOKEN")
      .or_else(|_| std::env::var("GOOGLE_ACCESS_TOKEN"))
      .ok()
      .filter(|token| !token.is_empty())
  }
}
