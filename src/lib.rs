//! Tiered, cache-through resolution of remote JSON documents, with a
//! sharded tracking map for documents that expire.

pub mod cache;
pub mod config;
pub mod entities;
pub mod error;
pub mod logging;
pub mod remote;
pub mod tracking;

pub use cache::{
  AbsentPolicy, FetchOptions, FetchOutcome, LocalTier, Tier, TierKind, TieredResolver,
};
pub use error::{Result, StoreError};
pub use remote::{RemoteDocumentStore, RetryOptions, RetryingFetcher};
pub use tracking::ShardedTrackingMap;
