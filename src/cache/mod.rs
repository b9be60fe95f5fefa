//! Tier chain and the resolver that walks it.
//!
//! This module provides:
//! - A capability trait (`Tier`) every storage backend implements
//! - In-memory tiers for the volatile cache and the session store
//! - A SQLite-backed local tier with lazy expiration and background pruning
//! - `TieredResolver`, which fetches through the chain and warms faster tiers

mod layer;
mod memory;
mod storage;
#[cfg(test)]
pub(crate) mod testing;
mod traits;

pub use layer::{FetchOptions, Fetched, TierTtls, TieredResolver, WarmHandle, WarmReport};
pub use memory::MemoryTier;
pub use storage::LocalTier;
pub use traits::{AbsentPolicy, FetchOutcome, Tier, TierEntry, TierKind, TierOptions};
