//! Domain entities as thin callers of the tiered resolver.
//!
//! Each entity names its document, its absence policy, its per-tier TTLs and
//! whether it has a static fallback. Everything else is the resolver's job.

use serde_json::Value;
use std::sync::Arc;

use crate::cache::{
  AbsentPolicy, FetchOptions, Fetched, LocalTier, MemoryTier, Tier, TierTtls, TieredResolver,
  WarmHandle,
};
use crate::config::Config;
use crate::error::Result;
use crate::remote::{
  DirectFallback, ReadonlyStore, RemoteDocumentStore, RetryOptions, RetryingFetcher, StaticToken,
};
use crate::tracking::ShardedTrackingMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Entity {
  Configuration,
  Roster,
  Organization,
}

impl Entity {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Configuration => "configuration",
      Self::Roster => "roster",
      Self::Organization => "organization",
    }
  }

  /// Configuration keeps an explicitly stored `null`; the roster and
  /// organization documents treat it as "no data yet".
  pub fn absent_policy(&self) -> AbsentPolicy {
    match self {
      Self::Configuration => AbsentPolicy::MissingOnly,
      Self::Roster | Self::Organization => AbsentPolicy::MissingOrNull,
    }
  }
}

/// What one entity needs from the resolver.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityProfile {
  pub entity: Entity,
  pub key: String,
  pub policy: AbsentPolicy,
  pub ttls: TierTtls,
  /// Path of a static fallback document, if the entity has one
  pub direct_path: Option<String>,
}

impl EntityProfile {
  pub fn from_config(entity: Entity, config: &Config) -> Self {
    let entities = &config.entities;
    let (key, direct_path) = match entity {
      Entity::Configuration => (
        entities.configuration_file.clone(),
        entities.configuration_fallback_path.clone(),
      ),
      Entity::Roster => (entities.roster_file.clone(), None),
      Entity::Organization => (entities.organization_file.clone(), None),
    };

    Self {
      entity,
      key,
      policy: entity.absent_policy(),
      ttls: config.ttl.tier_ttls(),
      direct_path,
    }
  }
}

/// Tiers shared by every entity of one process.
pub struct TierSet {
  pub cache: Arc<dyn Tier>,
  pub session: Arc<dyn Tier>,
  pub local: Arc<dyn Tier>,
  pub authoritative: Option<Arc<dyn Tier>>,
  pub readonly: Option<Arc<dyn Tier>>,
  /// Base URL for per-entity static fallbacks
  pub direct_base: Option<String>,
  pub fetcher: RetryingFetcher,
  /// Tracking map owned by the authoritative store
  pub tracking: Option<Arc<ShardedTrackingMap>>,
}

/// The authoritative store described by `config`, owning its tracking map.
pub fn authoritative_store(
  config: &Config,
  fetcher: RetryingFetcher,
) -> Result<RemoteDocumentStore> {
  let store = RemoteDocumentStore::new(
    &config.remote.api_base,
    &config.remote.upload_base,
    &config.remote.space,
    Arc::new(StaticToken::new(Config::access_token())),
    fetcher,
  )?;
  Ok(store.with_tracking(&config.tracking.prefix, config.tracking.save_options()))
}

impl TierSet {
  /// Build the standard tier set, handing back the concrete local tier so
  /// the caller can drive its prune timer and maintenance commands.
  pub fn from_config(config: &Config) -> Result<(Self, Arc<LocalTier>)> {
    let fetcher = RetryingFetcher::new(config.retry);

    let local = Arc::new(match &config.local.path {
      Some(path) => LocalTier::open(path)?,
      None => LocalTier::open_default()?,
    });

    let authoritative = authoritative_store(config, fetcher.clone())?;
    let tracking = authoritative.tracking();

    let readonly = match &config.readonly.base_url {
      Some(base) => Some(Arc::new(ReadonlyStore::new(base, fetcher.clone())?) as Arc<dyn Tier>),
      None => None,
    };

    let tiers = Self {
      cache: Arc::new(MemoryTier::cache()),
      session: Arc::new(MemoryTier::session()),
      local: local.clone(),
      authoritative: Some(Arc::new(authoritative)),
      readonly,
      direct_base: config.direct.base_url.clone(),
      fetcher,
      tracking,
    };
    Ok((tiers, local))
  }
}

/// Resolver bound to one entity's document.
pub struct EntityResolver {
  profile: EntityProfile,
  resolver: TieredResolver,
  options: FetchOptions,
}

impl EntityResolver {
  pub fn new(profile: EntityProfile, tiers: &TierSet, retry: Option<RetryOptions>) -> Result<Self> {
    let mut chain: Vec<Arc<dyn Tier>> = vec![
      tiers.cache.clone(),
      tiers.session.clone(),
      tiers.local.clone(),
    ];
    chain.extend(tiers.authoritative.clone());
    chain.extend(tiers.readonly.clone());

    if let (Some(base), Some(path)) = (&tiers.direct_base, &profile.direct_path) {
      chain.push(Arc::new(DirectFallback::new(base, path, tiers.fetcher.clone())?));
    }

    let resolver = TieredResolver::new(chain, profile.policy)?;
    let options = FetchOptions {
      ttls: profile.ttls,
      retry,
    };
    Ok(Self {
      profile,
      resolver,
      options,
    })
  }

  pub fn profile(&self) -> &EntityProfile {
    &self.profile
  }

  pub fn resolver(&self) -> &TieredResolver {
    &self.resolver
  }

  pub async fn fetch(&self) -> Result<Fetched> {
    self.resolver.fetch(&self.profile.key, &self.options).await
  }

  pub fn warm(&self, value: Value) -> Result<WarmHandle> {
    self.resolver.warm(&self.profile.key, value, &self.options)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::testing::RecordingTier;
  use crate::cache::{FetchOutcome, TierKind};
  use serde_json::json;

  fn tier_set(
    local: RecordingTier,
    authoritative: RecordingTier,
  ) -> (TierSet, Arc<RecordingTier>, Arc<RecordingTier>) {
    let cache = Arc::new(RecordingTier::new(TierKind::Cache));
    let local = Arc::new(local);
    let tiers = TierSet {
      cache: cache.clone(),
      session: Arc::new(RecordingTier::new(TierKind::Session)),
      local: local.clone(),
      authoritative: Some(Arc::new(authoritative)),
      readonly: None,
      direct_base: None,
      fetcher: RetryingFetcher::default(),
      tracking: None,
    };
    (tiers, cache, local)
  }

  #[test]
  fn test_profiles_follow_config() {
    let config = Config::default();
    let configuration = EntityProfile::from_config(Entity::Configuration, &config);
    assert_eq!(configuration.key, "configuration.json");
    assert_eq!(configuration.policy, AbsentPolicy::MissingOnly);
    assert_eq!(configuration.direct_path.as_deref(), Some("configuration.json"));

    let roster = EntityProfile::from_config(Entity::Roster, &config);
    assert_eq!(roster.key, "roster.json");
    assert_eq!(roster.policy, AbsentPolicy::MissingOrNull);
    assert_eq!(roster.direct_path, None);
  }

  #[test]
  fn test_direct_tier_only_when_configured() {
    let config = Config::default();
    let (mut tiers, _, _) = tier_set(
      RecordingTier::new(TierKind::Local),
      RecordingTier::new(TierKind::RemoteAuthoritative),
    );

    let profile = EntityProfile::from_config(Entity::Configuration, &config);
    let resolver = EntityResolver::new(profile.clone(), &tiers, None).unwrap();
    assert!(!resolver.resolver().tier_kinds().contains(&TierKind::Direct));

    tiers.direct_base = Some("https://admin.example.org/static".to_string());
    let resolver = EntityResolver::new(profile, &tiers, None).unwrap();
    assert_eq!(resolver.resolver().tier_kinds().last(), Some(&TierKind::Direct));

    let roster = EntityProfile::from_config(Entity::Roster, &config);
    let resolver = EntityResolver::new(roster, &tiers, None).unwrap();
    assert!(!resolver.resolver().tier_kinds().contains(&TierKind::Direct));
  }

  #[test]
  fn test_tier_set_exposes_the_store_tracking_map() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.local.path = Some(dir.path().join("local.db"));
    config.tracking.prefix = "expiry.".to_string();

    let (tiers, _) = TierSet::from_config(&config).unwrap();
    let tracking = tiers.tracking.unwrap();
    assert_eq!(tracking.shard_name('0'), "expiry.0.json");

    let store = authoritative_store(&config, RetryingFetcher::default()).unwrap();
    let owned = store.tracking().unwrap();
    assert!(Arc::ptr_eq(&owned, &store.clone().tracking().unwrap()));
  }

  #[tokio::test]
  async fn test_roster_treats_null_as_absent() {
    let config = Config::default();
    let (tiers, cache, _) = tier_set(
      RecordingTier::new(TierKind::Local).seed("roster.json", Value::Null),
      RecordingTier::new(TierKind::RemoteAuthoritative).seed("roster.json", json!([{"id": 4}])),
    );

    let roster = EntityResolver::new(
      EntityProfile::from_config(Entity::Roster, &config),
      &tiers,
      None,
    )
    .unwrap();
    let fetched = roster.fetch().await.unwrap();
    assert_eq!(fetched.outcome, FetchOutcome::AuthRemoteHit);
    fetched.warming.settle().await;
    assert_eq!(cache.value("roster.json"), Some(json!([{"id": 4}])));
  }

  #[tokio::test]
  async fn test_entities_share_tiers_but_not_keys() {
    let config = Config::default();
    let (tiers, _, local) = tier_set(
      RecordingTier::new(TierKind::Local),
      RecordingTier::new(TierKind::RemoteAuthoritative),
    );

    let organization = EntityResolver::new(
      EntityProfile::from_config(Entity::Organization, &config),
      &tiers,
      None,
    )
    .unwrap();
    organization
      .warm(json!({"name": "North"}))
      .unwrap()
      .settle()
      .await;

    assert_eq!(local.value("organization.json"), Some(json!({"name": "North"})));
    assert_eq!(local.value("roster.json"), None);
    let ttl = local.last_write_options().unwrap().ttl;
    assert_eq!(ttl, Some(TierTtls::default().local));
  }
}
