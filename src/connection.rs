//! A live connection to a telemetry store
//!
//! [`Connection`] ties the cache manager to the stream multiplexer. Reads go
//! through the cache and fetch only the gaps; live streams feed the channel
//! caches' dynamic stages as frames arrive.

use crate::cache::{CacheManager, ChannelStats, DynamicWrite, ReadResult};
use crate::config::Config;
use crate::error::{CacheError, Result, ResultExt};
use crate::gpu::DeviceAllocator;
use crate::remote::{Retriever, StreamTransport};
use crate::segment::{Frame, Segment};
use crate::stream::{ListenerGuard, MultiplexerStats, StreamMultiplexer, Subscriber};
use crate::types::{ChannelKey, TimeRange, TimeStamp};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Cache manager and stream multiplexer for one connection
pub struct Connection {
    manager: Arc<CacheManager>,
    multiplexer: StreamMultiplexer,
    retriever: Arc<dyn Retriever>,
    pump_interval: Duration,
}

impl Connection {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        transport: Arc<dyn StreamTransport>,
        allocator: Arc<dyn DeviceAllocator>,
        config: &Config,
    ) -> Self {
        let manager = Arc::new(CacheManager::new(
            Arc::clone(&retriever),
            allocator,
            config.cache.channel_options(),
        ));
        Self {
            manager,
            multiplexer: StreamMultiplexer::new(transport),
            retriever,
            pump_interval: config.stream.pump_interval(),
        }
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    pub fn multiplexer(&self) -> &StreamMultiplexer {
        &self.multiplexer
    }

    /// Read `range` of one channel, fetching and caching whatever is missing.
    ///
    /// Gaps are fetched only up to the start of the live segment (or the
    /// current time when nothing is streaming) so that backfill never claims
    /// the span live data is still arriving for.
    pub async fn read(
        &self,
        key: ChannelKey,
        range: TimeRange,
        cancel: &CancellationToken,
    ) -> Result<ReadResult> {
        self.manager.populate_missing(&[key], cancel).await?;
        let handle = self.manager.get(key)?;
        let cached = handle.read(&range)?;
        if cached.is_complete() {
            return Ok(cached);
        }

        let data_type = handle.descriptor()?.data_type;
        let horizon = handle.live_start()?.unwrap_or_else(TimeStamp::now);
        let fetchable: Vec<TimeRange> = cached
            .gaps
            .iter()
            .filter_map(|gap| gap.intersection(&TimeRange::new(TimeStamp::MIN, horizon)))
            .collect();
        tracing::debug!(
            "channel {}: fetching {} of {} gaps",
            key,
            fetchable.len(),
            cached.gaps.len()
        );

        for gap in fetchable {
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                fetched = self.retriever.read(key, gap) => fetched,
            };
            let fetched = fetched.with_context(|| format!("reading channel {} over {:?}", key, gap))?;
            let covered = Segment::cover(gap, data_type, fetched)?;
            handle.write_static(gap, covered)?;
        }
        handle.read(&range)
    }

    /// Stream `keys` into their caches.
    ///
    /// `on_update` sees the outcome of every ingested batch. A cache that hits
    /// an invariant violation is rebuilt empty and keeps ingesting. The stream
    /// stays subscribed for as long as the returned guard lives.
    pub async fn stream_live<F>(
        &self,
        keys: &[ChannelKey],
        mut on_update: F,
        cancel: &CancellationToken,
    ) -> Result<ListenerGuard>
    where
        F: FnMut(ChannelKey, &Result<DynamicWrite>) + Send + 'static,
    {
        self.manager.populate_missing(keys, cancel).await?;
        let manager = Arc::clone(&self.manager);
        let subscriber = Subscriber::new(keys.iter().copied(), move |frame: &Frame| {
            for (key, segment) in frame.iter() {
                let result = manager.get(key).and_then(|h| h.ingest(segment));
                let result = match result {
                    Ok(Some(write)) => Ok(write),
                    Ok(None) => continue,
                    Err(err) => Err(err),
                };
                if let Err(err) = &result {
                    if err.is_fatal() {
                        tracing::error!("channel {} corrupted, rebuilding: {}", key, err);
                        if let Err(e) = manager.rebuild(key) {
                            tracing::warn!("failed to rebuild channel {}: {}", key, e);
                        }
                    } else {
                        tracing::warn!("dropped live data for channel {}: {}", key, err);
                    }
                }
                on_update(key, &result);
            }
        });
        self.multiplexer.add_listener(subscriber, cancel).await
    }

    /// Dispatch queued frames now. Returns the number of frames drained.
    pub fn pump(&self) -> usize {
        self.multiplexer.pump()
    }

    /// Dispatch frames at the configured interval until cancelled
    pub async fn run(&self, cancel: &CancellationToken) {
        self.multiplexer.run(self.pump_interval, cancel).await;
    }

    pub fn channel_stats(&self) -> Vec<(ChannelKey, ChannelStats)> {
        self.manager.stats()
    }

    pub fn stream_stats(&self) -> MultiplexerStats {
        self.multiplexer.stats()
    }

    /// Close the stream and release every cache
    pub fn close(&self) {
        self.multiplexer.shutdown();
        self.manager.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("manager", &self.manager)
            .field("multiplexer", &self.multiplexer)
            .field("pump_interval", &self.pump_interval)
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}
