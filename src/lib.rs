//! # telemcache: client-side telemetry cache
//!
//! A per-connection cache for time-series telemetry that serves historical
//! reads and live streams from one place.
//!
//! ## Architecture
//!
//! - **Cache**: per-channel static cache of committed segments plus a dynamic
//!   stage that ingests live samples and seals them into the static cache
//! - **Stream**: one transport subscription multiplexed across many listeners
//! - **Connection**: read-through queries and live ingestion on top of both
//! - **Remote**: the retrieval and transport traits a store implements
//!
//! ## Example
//!
//! ```ignore
//! use telemcache::{config::Config, gpu::HostAllocator, sim::SimulatedStore, Connection};
//!
//! let store = Arc::new(SimulatedStore::new());
//! let conn = Connection::new(store.clone(), store, Arc::new(HostAllocator::new()), &Config::default());
//! let result = conn.read(ChannelKey(1), range, &CancellationToken::new()).await?;
//! for segment in &result.series {
//!     plot(segment.as_plot_points());
//! }
//! ```

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod gpu;
pub mod logging;
pub mod remote;
pub mod segment;
pub mod sim;
pub mod stream;
pub mod types;

pub use cache::{CacheHandle, CacheManager, ChannelCache, DynamicWrite, ReadResult};
pub use connection::Connection;
pub use error::{CacheError, Result};
pub use segment::{Frame, Segment};
pub use stream::{ListenerGuard, StreamMultiplexer, Subscriber};
pub use types::{ChannelDescriptor, ChannelKey, DataType, TimeRange, TimeStamp};
