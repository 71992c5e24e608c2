//! One transport stream shared by many listeners

use super::subscriber::{FrameHandler, Subscriber};
use crate::error::{CacheError, Result};
use crate::remote::{OpenedStream, StreamHandle, StreamTransport};
use crate::segment::Frame;
use crate::types::ChannelKey;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Lifecycle of the underlying transport stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StreamState {
    #[default]
    Closed,
    Opening,
    Open,
    Closing,
}

/// Registration handle; orders listeners by registration time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

/// Statistics for a multiplexer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiplexerStats {
    /// Frames drained from the transport
    pub frames_received: u64,
    /// Frame deliveries to listeners (one frame may be delivered many times)
    pub frames_dispatched: u64,
    /// Frames no listener was interested in
    pub frames_unmatched: u64,
    pub opens: u64,
    pub updates: u64,
    pub closes: u64,
    pub transport_errors: u64,
}

struct Listener {
    channels: BTreeSet<ChannelKey>,
    handler: Arc<Mutex<FrameHandler>>,
}

#[derive(Default)]
struct MuxState {
    listeners: BTreeMap<ListenerId, Listener>,
    stream: Option<OpenedStream>,
    /// Subscription last acknowledged by the transport
    pushed: BTreeSet<ChannelKey>,
    state: StreamState,
    stats: MultiplexerStats,
    shut_down: bool,
}

impl MuxState {
    fn desired(&self) -> BTreeSet<ChannelKey> {
        self.listeners
            .values()
            .flat_map(|l| l.channels.iter().copied())
            .collect()
    }
}

struct Shared {
    transport: Arc<dyn StreamTransport>,
    state: Mutex<MuxState>,
    /// Serializes transport pushes so that subscription updates never race
    sync_lock: tokio::sync::Mutex<()>,
    /// Held from draining the frame queue until every drained frame is
    /// delivered, so concurrent pumps cannot reorder frames
    dispatch_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl Shared {
    fn detach(&self, id: ListenerId) -> bool {
        let mut state = self.state.lock();
        state.listeners.remove(&id);
        state.listeners.is_empty()
    }

    /// Close the open stream, if any, without waiting on anything
    fn close_stream(&self) {
        let handle = {
            let mut state = self.state.lock();
            let Some(stream) = state.stream.take() else {
                return;
            };
            state.state = StreamState::Closing;
            state.pushed.clear();
            stream.handle
        };
        self.transport.close(handle);
        let mut state = self.state.lock();
        if state.state == StreamState::Closing {
            state.state = StreamState::Closed;
        }
        state.stats.closes += 1;
        tracing::debug!("closed stream {:?}", handle);
    }
}

/// Resets a half-open stream to `Closed` if the open call is abandoned
struct OpeningReset<'a> {
    shared: &'a Shared,
    armed: bool,
}

impl Drop for OpeningReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.state.lock();
            if state.state == StreamState::Opening && state.stream.is_none() {
                state.state = StreamState::Closed;
            }
        }
    }
}

enum Step {
    Open(BTreeSet<ChannelKey>),
    Update(StreamHandle, BTreeSet<ChannelKey>),
    Close,
    Done,
}

/// Merges listeners' channel interests into a single transport subscription
#[derive(Clone)]
pub struct StreamMultiplexer {
    shared: Arc<Shared>,
}

impl StreamMultiplexer {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                state: Mutex::new(MuxState::default()),
                sync_lock: tokio::sync::Mutex::new(()),
                dispatch_lock: Mutex::new(()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register a listener and make sure the stream carries its channels.
    ///
    /// Returns once the transport has acknowledged the subscription; the
    /// subscriber's `on_open` callback runs just before. On failure or
    /// cancellation the listener is not registered.
    pub async fn add_listener(
        &self,
        subscriber: Subscriber,
        cancel: &CancellationToken,
    ) -> Result<ListenerGuard> {
        let Subscriber {
            channels,
            handler,
            on_open,
        } = subscriber;
        let id = ListenerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed));
        {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return Err(CacheError::Closed);
            }
            state.listeners.insert(
                id,
                Listener {
                    channels,
                    handler: Arc::new(Mutex::new(handler)),
                },
            );
        }
        let mut guard = ListenerGuard {
            shared: Arc::clone(&self.shared),
            id,
            active: true,
        };

        let synced = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CacheError::Cancelled),
            result = self.sync_subscription() => result,
        };
        if let Err(err) = synced {
            // drop the listener without pushing anything further
            guard.active = false;
            self.shared.detach(id);
            tracing::warn!("listener {:?} not registered: {}", id, err);
            return Err(err);
        }

        if let Some(on_open) = on_open {
            on_open();
        }
        Ok(guard)
    }

    /// Bring the transport in line with the current listeners: open a stream
    /// if there is none, push the channel union if it changed, close the
    /// stream if nobody is listening.
    pub async fn sync_subscription(&self) -> Result<()> {
        let _serial = self.shared.sync_lock.lock().await;
        loop {
            let step = {
                let mut state = self.shared.state.lock();
                let desired = state.desired();
                match state.stream.as_ref().map(|s| s.handle) {
                    None if desired.is_empty() => Step::Done,
                    None => {
                        state.state = StreamState::Opening;
                        Step::Open(desired)
                    }
                    Some(_) if desired.is_empty() => Step::Close,
                    Some(handle) if desired != state.pushed => Step::Update(handle, desired),
                    Some(_) => Step::Done,
                }
            };

            match step {
                Step::Done => return Ok(()),
                Step::Close => self.shared.close_stream(),
                Step::Open(channels) => {
                    let mut reset = OpeningReset {
                        shared: &self.shared,
                        armed: true,
                    };
                    let opened = self.shared.transport.open(&channels).await;
                    let mut state = self.shared.state.lock();
                    match opened {
                        Ok(stream) => {
                            tracing::debug!("opened stream {:?} for {:?}", stream.handle, channels);
                            state.stream = Some(stream);
                            state.pushed = channels;
                            state.state = StreamState::Open;
                            state.stats.opens += 1;
                            reset.armed = false;
                        }
                        Err(err) => {
                            state.state = StreamState::Closed;
                            state.stats.transport_errors += 1;
                            reset.armed = false;
                            return Err(err);
                        }
                    }
                }
                Step::Update(handle, channels) => {
                    let updated = self.shared.transport.update(handle, &channels).await;
                    let mut state = self.shared.state.lock();
                    match updated {
                        Ok(()) => {
                            tracing::debug!("stream {:?} now carries {:?}", handle, channels);
                            state.pushed = channels;
                            state.stats.updates += 1;
                        }
                        Err(err) => {
                            state.stats.transport_errors += 1;
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Drain queued frames and hand each to every interested listener, in
    /// registration order. Returns the number of frames drained.
    ///
    /// Concurrent callers are serialized. Handlers must not call `pump`.
    pub fn pump(&self) -> usize {
        let _dispatch = self.shared.dispatch_lock.lock();
        let (frames, listeners) = {
            let state = self.shared.state.lock();
            let Some(stream) = &state.stream else {
                return 0;
            };
            let frames: Vec<Frame> = stream.frames.try_iter().collect();
            if frames.is_empty() {
                return 0;
            }
            let listeners: Vec<_> = state
                .listeners
                .values()
                .map(|l| (l.channels.clone(), Arc::clone(&l.handler)))
                .collect();
            (frames, listeners)
        };

        let mut dispatched = 0u64;
        let mut unmatched = 0u64;
        for frame in &frames {
            let mut matched = false;
            for (channels, handler) in &listeners {
                if !frame.intersects(channels) {
                    continue;
                }
                let filtered = frame.filter(channels);
                let mut call = handler.lock();
                (*call)(&filtered);
                dispatched += 1;
                matched = true;
            }
            if !matched {
                unmatched += 1;
            }
        }

        let mut state = self.shared.state.lock();
        state.stats.frames_received += frames.len() as u64;
        state.stats.frames_dispatched += dispatched;
        state.stats.frames_unmatched += unmatched;
        frames.len()
    }

    /// Pump frames every `period` until cancelled
    pub async fn run(&self, period: Duration, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.pump();
                }
            }
        }
        // deliver whatever arrived before cancellation
        self.pump();
    }

    pub fn state(&self) -> StreamState {
        self.shared.state.lock().state
    }

    /// Channels the transport was last told to carry
    pub fn subscription(&self) -> BTreeSet<ChannelKey> {
        self.shared.state.lock().pushed.clone()
    }

    pub fn listener_count(&self) -> usize {
        self.shared.state.lock().listeners.len()
    }

    pub fn stats(&self) -> MultiplexerStats {
        self.shared.state.lock().stats.clone()
    }

    /// Drop every listener, close the stream and refuse new registrations
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.listeners.clear();
        }
        self.shared.close_stream();
        tracing::info!("stream multiplexer shut down");
    }
}

impl fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("StreamMultiplexer")
            .field("state", &state.state)
            .field("listeners", &state.listeners.len())
            .field("subscription", &state.pushed)
            .finish()
    }
}

/// Keeps a listener registered.
///
/// Dropping the guard unregisters the listener. If it was the last one the
/// stream closes on the spot; otherwise the shrunken subscription is pushed by
/// a task spawned on the current tokio runtime. Outside a runtime the push
/// waits for the next [`StreamMultiplexer::sync_subscription`]. Use
/// [`ListenerGuard::remove`] to push it and wait for the result.
#[must_use = "dropping the guard removes the listener"]
pub struct ListenerGuard {
    shared: Arc<Shared>,
    id: ListenerId,
    active: bool,
}

impl ListenerGuard {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Unregister the listener and push the reduced subscription
    pub async fn remove(mut self) -> Result<()> {
        self.active = false;
        self.shared.detach(self.id);
        let mux = StreamMultiplexer {
            shared: Arc::clone(&self.shared),
        };
        mux.sync_subscription().await
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if self.shared.detach(self.id) {
            self.shared.close_stream();
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::debug!("listener {:?} dropped outside a runtime, narrowing deferred", self.id);
            return;
        };
        let mux = StreamMultiplexer {
            shared: Arc::clone(&self.shared),
        };
        runtime.spawn(async move {
            if let Err(err) = mux.sync_subscription().await {
                tracing::warn!("failed to narrow subscription: {}", err);
            }
        });
    }
}

impl fmt::Debug for ListenerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerGuard")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
