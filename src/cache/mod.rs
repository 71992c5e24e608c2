//! Per-connection telemetry cache.
//!
//! Each channel gets a [`ChannelCache`]: a [`StaticCache`] of committed
//! historical segments plus a [`DynamicStage`] that ingests live samples and
//! periodically seals them into the static cache. The [`CacheManager`] owns
//! every channel cache of a connection and hands out [`CacheHandle`]s.
//!
//! ```text
//! stream frames ──► DynamicStage ──sealed segments──► StaticCache ◄── backfill
//!                        │                                 │
//!                        └────────── ChannelCache::read ◄──┘
//! ```

pub mod channel;
pub mod dynamic;
pub mod manager;
pub mod static_cache;

pub use channel::{ChannelCache, ChannelOptions, ChannelStats, DynamicWrite, ReadResult};
pub use dynamic::{DynamicStage, StageWrite};
pub use manager::{CacheHandle, CacheManager};
pub use static_cache::{StaticCache, StaticRead};
