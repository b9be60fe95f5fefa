use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use rosterkit::config::Config;
use rosterkit::entities::{self, Entity, EntityProfile, EntityResolver, TierSet};
use rosterkit::logging;
use rosterkit::remote::RetryingFetcher;
use rosterkit::tracking::{PruneOptions, ShardedTrackingMap, TrackingMetadata};

#[derive(Parser, Debug)]
#[command(name = "rosterkit")]
#[command(about = "Tiered, cache-through document resolution for roster administration")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rosterkit/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Only log to stderr
  #[arg(long)]
  no_log_file: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Resolve an entity through every tier and print it
  Fetch {
    entity: Entity,
  },
  /// Write a JSON file into every writable tier for an entity
  Warm {
    entity: Entity,
    file: PathBuf,
  },
  /// Inspect and maintain the remote tracking map
  Tracking {
    #[command(subcommand)]
    command: TrackingCommand,
  },
  /// Inspect and maintain the local persistent tier
  Local {
    #[command(subcommand)]
    command: LocalCommand,
  },
}

#[derive(Subcommand, Debug)]
enum TrackingCommand {
  /// Print tracked ids, or one id's version history
  Show {
    id: Option<String>,
  },
  /// Record new metadata for a file id
  Update {
    id: String,
    /// Expiry time (RFC 3339)
    #[arg(long)]
    expires: Option<DateTime<Utc>>,
    #[arg(long)]
    owner: Option<String>,
    #[arg(long = "tag")]
    tags: Vec<String>,
  },
  /// Delete expired files and drop their entries
  Prune {
    /// Overdue entries younger than this many hours are only warned about
    #[arg(long)]
    grace_hours: Option<u64>,
    /// Maximum number of deletions
    #[arg(long)]
    max: Option<usize>,
  },
}

#[derive(Subcommand, Debug)]
enum LocalCommand {
  /// List registered keys
  Keys,
  /// Remove every entry
  Clear,
  /// Remove expired entries now
  Prune,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let log_dir = if args.no_log_file {
    None
  } else {
    logging::log_dir()
  };
  let _guard = logging::init(log_dir.as_deref())?;

  let config = Config::load(args.config.as_deref())?;

  match args.command {
    Command::Fetch { entity } => fetch(&config, entity).await,
    Command::Warm { entity, file } => warm(&config, entity, &file).await,
    Command::Tracking { command } => tracking(&config, command).await,
    Command::Local { command } => local(&config, command),
  }
}

fn entity_resolver(config: &Config, entity: Entity) -> Result<EntityResolver> {
  let (tiers, local) = TierSet::from_config(config)?;
  if config.local.prune_interval_secs > 0 {
    local.start_prune_timer(Duration::from_secs(config.local.prune_interval_secs));
  }
  let profile = EntityProfile::from_config(entity, config);
  Ok(EntityResolver::new(profile, &tiers, Some(config.retry))?)
}

async fn fetch(config: &Config, entity: Entity) -> Result<()> {
  let resolver = entity_resolver(config, entity)?;
  let fetched = resolver.fetch().await?;
  info!(entity = entity.name(), outcome = ?fetched.outcome, "Resolved");

  let value = fetched
    .value
    .ok_or_else(|| eyre!("No {} document found in any tier", entity.name()))?;
  println!("{}", serde_json::to_string_pretty(&value)?);

  let report = fetched.warming.settle().await;
  for (tier, error) in &report.failed {
    warn!(%tier, %error, "Warming failed");
  }
  Ok(())
}

async fn warm(config: &Config, entity: Entity, file: &std::path::Path) -> Result<()> {
  let contents = std::fs::read_to_string(file)
    .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
  let value: serde_json::Value = serde_json::from_str(&contents)?;

  let resolver = entity_resolver(config, entity)?;
  let report = resolver.warm(value)?.settle().await;

  for tier in &report.written {
    println!("{:<12} written", tier.name());
  }
  for (tier, error) in &report.failed {
    println!("{:<12} failed: {}", tier.name(), error);
  }
  if report.failed.is_empty() {
    Ok(())
  } else {
    Err(eyre!("{} tier(s) failed to warm", report.failed.len()))
  }
}

fn tracking_map(config: &Config) -> Result<Arc<ShardedTrackingMap>> {
  let store = entities::authoritative_store(config, RetryingFetcher::new(config.retry))?;
  store
    .tracking()
    .ok_or_else(|| eyre!("Remote store has no tracking map"))
}

async fn tracking(config: &Config, command: TrackingCommand) -> Result<()> {
  let map = tracking_map(config)?;
  map.load().await;

  match command {
    TrackingCommand::Show { id: Some(id) } => {
      for version in map.versions(&id) {
        println!("{}", serde_json::to_string(&version)?);
      }
    }
    TrackingCommand::Show { id: None } => {
      for id in map.ids() {
        let expires = map
          .get(&id)
          .and_then(|entry| entry.expires())
          .map(|e| e.to_rfc3339())
          .unwrap_or_else(|| "-".to_string());
        println!("{:<40} {}", id, expires);
      }
    }
    TrackingCommand::Update {
      id,
      expires,
      owner,
      tags,
    } => {
      let metadata = TrackingMetadata {
        expires,
        owner,
        tags: (!tags.is_empty()).then_some(tags),
        custom: None,
      };
      let report = map.update(&id, metadata).await?;
      if !report.failed.is_empty() {
        return Err(eyre!("Failed to save shards {:?}", report.failed));
      }
    }
    TrackingCommand::Prune { grace_hours, max } => {
      let mut options = PruneOptions::default().with_warning(|id, entry| {
        warn!(id, expires = ?entry.expires(), "Expired, inside grace period");
      });
      if let Some(hours) = grace_hours {
        options = options.with_grace_period(grace_period(hours));
      }
      if let Some(max) = max {
        options = options.with_max_prune(max);
      }
      let pruned = map.prune(options).await;
      println!("Pruned {} file(s)", pruned);
    }
  }
  Ok(())
}

fn grace_period(hours: u64) -> Duration {
  Duration::from_secs(hours.saturating_mul(3600))
}

fn local(config: &Config, command: LocalCommand) -> Result<()> {
  let (_, local) = TierSet::from_config(config)?;

  match command {
    LocalCommand::Keys => {
      for key in local.get_all_keys() {
        println!("{}", key);
      }
    }
    LocalCommand::Clear => {
      local.clear()?;
      println!("Cleared");
    }
    LocalCommand::Prune => {
      println!("Pruned {} entry(ies)", local.prune_now());
    }
  }
  Ok(())
}
