//! Registry of channel caches for one connection
//!
//! The manager resolves channel descriptors through the [`Retriever`] and owns
//! the resulting [`ChannelCache`]s. Callers only ever hold [`CacheHandle`]s,
//! which stop working once the cache behind them is evicted, rebuilt or the
//! manager is closed.
//!
//! # Single-flight population
//!
//! A key being resolved is registered in an in-flight table before the
//! retriever is called. Concurrent [`CacheManager::populate_missing`] calls
//! that need the same key wait on that entry instead of issuing their own
//! retrieval. If the resolving call is cancelled its entries disappear and the
//! waiters take over.

use super::channel::{ChannelCache, ChannelOptions, ChannelStats, DynamicWrite, ReadResult};
use crate::error::{CacheError, Result};
use crate::gpu::DeviceAllocator;
use crate::remote::Retriever;
use crate::segment::Segment;
use crate::types::{ChannelDescriptor, ChannelKey, TimeRange, TimeStamp};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

type Outcome = Option<Result<()>>;

struct InFlight {
    id: u64,
    rx: watch::Receiver<Outcome>,
}

#[derive(Default)]
struct ManagerState {
    caches: HashMap<ChannelKey, Arc<Mutex<ChannelCache>>>,
    in_flight: HashMap<ChannelKey, InFlight>,
    closed: bool,
}

/// Owns every channel cache of a connection
pub struct CacheManager {
    retriever: Arc<dyn Retriever>,
    allocator: Arc<dyn DeviceAllocator>,
    options: Mutex<ChannelOptions>,
    state: Mutex<ManagerState>,
    next_flight: AtomicU64,
}

/// Removes this call's in-flight entries however the call ends
struct InFlightGuard<'a> {
    state: &'a Mutex<ManagerState>,
    id: u64,
    keys: Vec<ChannelKey>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        for key in &self.keys {
            if state.in_flight.get(key).is_some_and(|f| f.id == self.id) {
                state.in_flight.remove(key);
            }
        }
    }
}

impl CacheManager {
    pub fn new(
        retriever: Arc<dyn Retriever>,
        allocator: Arc<dyn DeviceAllocator>,
        options: ChannelOptions,
    ) -> Self {
        Self {
            retriever,
            allocator,
            options: Mutex::new(options),
            state: Mutex::new(ManagerState::default()),
            next_flight: AtomicU64::new(1),
        }
    }

    /// Build caches for every key in `keys` that does not have one yet.
    ///
    /// Keys already present are left untouched. Keys another call is already
    /// resolving are waited on rather than fetched again. On cancellation no
    /// cache from this call is registered.
    pub async fn populate_missing(
        &self,
        keys: &[ChannelKey],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let wanted: BTreeSet<ChannelKey> = keys.iter().copied().collect();
        loop {
            let mut fetch = Vec::new();
            let mut waits = Vec::new();
            let mut leader = None;
            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(CacheError::Closed);
                }
                for key in &wanted {
                    if state.caches.contains_key(key) {
                        continue;
                    }
                    match state.in_flight.get(key) {
                        Some(flight) => waits.push((*key, flight.rx.clone())),
                        None => fetch.push(*key),
                    }
                }
                if !fetch.is_empty() {
                    let id = self.next_flight.fetch_add(1, Ordering::Relaxed);
                    let (tx, rx) = watch::channel(None);
                    for key in &fetch {
                        state.in_flight.insert(
                            *key,
                            InFlight {
                                id,
                                rx: rx.clone(),
                            },
                        );
                    }
                    leader = Some((id, tx));
                }
            }

            if let Some((id, tx)) = leader {
                let _guard = InFlightGuard {
                    state: &self.state,
                    id,
                    keys: fetch.clone(),
                };
                tracing::debug!("resolving channels {:?}", fetch);
                let fetched = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = self.retriever.retrieve(&fetch) => Some(result),
                };
                // dropping `tx` unanswered sends the waiters back round the loop
                let Some(fetched) = fetched else {
                    tracing::debug!("resolution of {:?} cancelled", fetch);
                    return Err(CacheError::Cancelled);
                };
                let outcome = fetched.and_then(|descriptors| self.install(id, &fetch, descriptors));
                let _ = tx.send(Some(outcome.clone()));
                outcome?;
            }

            // the leader's outcome covers its whole batch; judge only our own keys
            let mut retry = false;
            for (key, mut rx) in waits {
                let seen = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                    seen = rx.wait_for(Option::is_some) => seen.map(|v| (*v).clone()),
                };
                let Ok(outcome) = seen else {
                    retry = true;
                    continue;
                };
                {
                    let state = self.state.lock();
                    if state.closed {
                        return Err(CacheError::Closed);
                    }
                    if state.caches.contains_key(&key) {
                        continue;
                    }
                }
                match outcome {
                    Some(Err(err)) if matches!(err.root(), CacheError::NotFound(_)) => {
                        return Err(CacheError::NotFound(key))
                    }
                    Some(Err(err)) => return Err(err),
                    // resolved but gone again, e.g. evicted in between
                    _ => retry = true,
                }
            }
            if !retry {
                return Ok(());
            }
        }
    }

    /// Register caches for resolved descriptors and clear their in-flight
    /// entries in one step
    fn install(
        &self,
        id: u64,
        requested: &[ChannelKey],
        descriptors: Vec<ChannelDescriptor>,
    ) -> Result<()> {
        let options = self.options.lock().clone();
        let mut built = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            if !requested.contains(&descriptor.key) {
                continue;
            }
            let key = descriptor.key;
            let cache = ChannelCache::new(descriptor, options.clone(), Arc::clone(&self.allocator))?;
            built.push((key, cache));
        }

        let mut state = self.state.lock();
        for key in requested {
            if state.in_flight.get(key).is_some_and(|f| f.id == id) {
                state.in_flight.remove(key);
            }
        }
        if state.closed {
            // caches built here are dropped, releasing their device buffers
            return Err(CacheError::Closed);
        }
        let mut missing: Vec<ChannelKey> = requested.to_vec();
        for (key, cache) in built {
            missing.retain(|k| *k != key);
            state
                .caches
                .entry(key)
                .or_insert_with(|| Arc::new(Mutex::new(cache)));
        }
        tracing::info!(
            "populated {} channels, {} unresolved",
            requested.len() - missing.len(),
            missing.len()
        );
        match missing.first() {
            Some(key) => Err(CacheError::NotFound(*key)),
            None => Ok(()),
        }
    }

    /// Handle to the cache for `key`
    pub fn get(&self, key: ChannelKey) -> Result<CacheHandle> {
        let state = self.state.lock();
        if state.closed {
            return Err(CacheError::Closed);
        }
        state
            .caches
            .get(&key)
            .map(|cache| CacheHandle {
                key,
                cache: Arc::downgrade(cache),
            })
            .ok_or(CacheError::NotFound(key))
    }

    pub fn contains(&self, key: ChannelKey) -> bool {
        self.state.lock().caches.contains_key(&key)
    }

    /// Keys with a registered cache, ascending
    pub fn keys(&self) -> Vec<ChannelKey> {
        let mut keys: Vec<_> = self.state.lock().caches.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.state.lock().caches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Tear down the cache for `key`. Returns whether one existed.
    pub fn evict(&self, key: ChannelKey) -> bool {
        let removed = self.state.lock().caches.remove(&key);
        match removed {
            Some(cache) => {
                cache.lock().close();
                tracing::debug!("evicted channel {}", key);
                true
            }
            None => false,
        }
    }

    /// Replace the cache for `key` with an empty one for the same descriptor.
    /// Used to recover from an invariant violation.
    pub fn rebuild(&self, key: ChannelKey) -> Result<CacheHandle> {
        let options = self.options.lock().clone();
        let mut state = self.state.lock();
        if state.closed {
            return Err(CacheError::Closed);
        }
        let old = state.caches.get(&key).ok_or(CacheError::NotFound(key))?;
        let descriptor = {
            let mut old = old.lock();
            old.close();
            old.descriptor().clone()
        };
        let fresh = Arc::new(Mutex::new(ChannelCache::new(
            descriptor,
            options,
            Arc::clone(&self.allocator),
        )?));
        let handle = CacheHandle {
            key,
            cache: Arc::downgrade(&fresh),
        };
        state.caches.insert(key, fresh);
        tracing::warn!("rebuilt cache for channel {}", key);
        Ok(handle)
    }

    /// Change the live seal size of every current and future cache
    pub fn set_dynamic_capacity(&self, capacity: usize) -> Result<()> {
        let caches: Vec<_> = {
            let mut options = self.options.lock();
            options.dynamic_capacity = capacity;
            self.state.lock().caches.values().cloned().collect()
        };
        for cache in caches {
            cache.lock().set_dynamic_capacity(capacity)?;
        }
        Ok(())
    }

    /// Statistics for every cache, by key
    pub fn stats(&self) -> Vec<(ChannelKey, ChannelStats)> {
        let caches: Vec<_> = {
            let state = self.state.lock();
            state
                .caches
                .iter()
                .map(|(k, c)| (*k, Arc::clone(c)))
                .collect()
        };
        let mut out: Vec<_> = caches
            .into_iter()
            .map(|(k, c)| (k, c.lock().stats()))
            .collect();
        out.sort_by_key(|(k, _)| *k);
        out
    }

    /// Release every device buffer and clear the registry. Later calls fail
    /// with [`CacheError::Closed`].
    pub fn close(&self) {
        let caches = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.in_flight.clear();
            std::mem::take(&mut state.caches)
        };
        let count = caches.len();
        for cache in caches.into_values() {
            cache.lock().close();
        }
        tracing::info!("cache manager closed, released {} channels", count);
    }
}

impl Drop for CacheManager {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheManager")
            .field("channels", &state.caches.len())
            .field("in_flight", &state.in_flight.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Caller-side reference to a channel cache owned by a [`CacheManager`]
#[derive(Debug, Clone)]
pub struct CacheHandle {
    key: ChannelKey,
    cache: Weak<Mutex<ChannelCache>>,
}

impl CacheHandle {
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    /// Whether the cache behind this handle still exists
    pub fn is_live(&self) -> bool {
        self.cache.strong_count() > 0
    }

    /// Run `f` with exclusive access to the cache
    pub fn with<T>(&self, f: impl FnOnce(&mut ChannelCache) -> Result<T>) -> Result<T> {
        let cache = self.cache.upgrade().ok_or(CacheError::NotFound(self.key))?;
        let mut cache = cache.lock();
        f(&mut cache)
    }

    pub fn read(&self, range: &TimeRange) -> Result<ReadResult> {
        self.with(|c| c.read(range))
    }

    pub fn write_dynamic(&self, batch: &Segment) -> Result<DynamicWrite> {
        self.with(|c| c.write_dynamic(batch))
    }

    pub fn ingest(&self, batch: &Segment) -> Result<Option<DynamicWrite>> {
        self.with(|c| c.ingest(batch))
    }

    pub fn write_static(&self, range: TimeRange, segments: Vec<Segment>) -> Result<()> {
        self.with(|c| c.write_static(range, segments))
    }

    pub fn descriptor(&self) -> Result<ChannelDescriptor> {
        self.with(|c| Ok(c.descriptor().clone()))
    }

    pub fn current(&self) -> Result<Option<Segment>> {
        self.with(|c| Ok(c.current()))
    }

    /// Start of the open live segment, if any samples are buffered
    pub fn live_start(&self) -> Result<Option<TimeStamp>> {
        self.with(|c| Ok(c.live_range().map(|r| r.start)))
    }

    pub fn stats(&self) -> Result<ChannelStats> {
        self.with(|c| Ok(c.stats()))
    }

    pub fn is_poisoned(&self) -> Result<bool> {
        self.with(|c| Ok(c.is_poisoned()))
    }
}
