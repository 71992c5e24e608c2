//! Simulated telemetry store
//!
//! [`SimulatedStore`] serves both collaborator traits from in-memory signal
//! generators, so the cache and the multiplexer can be driven without a real
//! store. Historical reads and live frames come from the same pattern, so for
//! time-based patterns backfilled and streamed data line up.
//!
//! # Signal patterns
//!
//! - [`SignalPattern::Constant`] - Fixed value
//! - [`SignalPattern::Sine`] - Sinusoidal wave with configurable frequency/amplitude
//! - [`SignalPattern::Counter`] - Sample counter wrapping within a range
//! - [`SignalPattern::Sawtooth`] - Linear ramp that resets every period
//! - [`SignalPattern::Square`] - Alternates between `+amplitude` and `-amplitude`
//! - [`SignalPattern::Triangle`] - Triangle wave
//!
//! # Example
//!
//! ```ignore
//! let store = SimulatedStore::new()
//!     .with_channel(
//!         ChannelDescriptor::new(1, DataType::F32).with_name("pressure"),
//!         SignalPattern::Sine { frequency: 1.0, amplitude: 10.0, offset: 0.0 },
//!     );
//! store.emit(TimeStamp::now());
//! ```

use crate::error::{CacheError, Result};
use crate::remote::{OpenedStream, Retriever, StreamHandle, StreamTransport};
use crate::segment::{Frame, Segment};
use crate::types::{ChannelDescriptor, ChannelKey, TimeRange, TimeStamp};
use async_trait::async_trait;
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default spacing of historical samples (10 ms)
pub const DEFAULT_SAMPLE_PERIOD_NS: i64 = 10_000_000;

/// Upper bound on samples produced by one historical read
pub const MAX_READ_SAMPLES: i64 = 1_000_000;

/// Pattern for generating channel values from time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SignalPattern {
    Constant(f64),
    Sine {
        frequency: f64,
        amplitude: f64,
        offset: f64,
    },
    /// Counts samples by `step`, wrapping from `max` back to `min`
    Counter { step: f64, min: f64, max: f64 },
    Sawtooth { period: f64, amplitude: f64 },
    Square { period: f64, amplitude: f64 },
    Triangle { period: f64, amplitude: f64 },
}

impl Default for SignalPattern {
    fn default() -> Self {
        SignalPattern::Sine {
            frequency: 1.0,
            amplitude: 100.0,
            offset: 0.0,
        }
    }
}

impl SignalPattern {
    /// Value at `ts`; `index` is the sample number used by `Counter`
    pub fn value_at(&self, ts: TimeStamp, index: i64) -> f64 {
        let secs = ts.as_secs_f64();
        match *self {
            SignalPattern::Constant(v) => v,
            SignalPattern::Sine {
                frequency,
                amplitude,
                offset,
            } => offset + amplitude * (2.0 * std::f64::consts::PI * frequency * secs).sin(),
            SignalPattern::Counter { step, min, max } => {
                let span = max - min;
                if span <= 0.0 {
                    return min;
                }
                min + (index as f64 * step).rem_euclid(span)
            }
            SignalPattern::Sawtooth { period, amplitude } => {
                let t = secs.rem_euclid(period);
                amplitude * (t / period)
            }
            SignalPattern::Square { period, amplitude } => {
                let t = secs.rem_euclid(period);
                if t < period / 2.0 {
                    amplitude
                } else {
                    -amplitude
                }
            }
            SignalPattern::Triangle { period, amplitude } => {
                let t = secs.rem_euclid(period);
                let half = period / 2.0;
                if t < half {
                    amplitude * (2.0 * t / half - 1.0)
                } else {
                    amplitude * (1.0 - 2.0 * (t - half) / half)
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct SimChannel {
    descriptor: ChannelDescriptor,
    pattern: SignalPattern,
    /// Spacing of historical samples
    period_ns: i64,
    /// Live samples emitted so far
    emitted: i64,
}

#[derive(Debug)]
struct SimStream {
    channels: BTreeSet<ChannelKey>,
    tx: Sender<Frame>,
}

/// Statistics for the simulated store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimStats {
    pub retrieves: u64,
    pub reads: u64,
    pub frames_sent: u64,
    /// Frames dropped because a stream's queue was full
    pub frames_dropped: u64,
}

/// In-memory store implementing [`Retriever`] and [`StreamTransport`]
#[derive(Debug)]
pub struct SimulatedStore {
    channels: Mutex<BTreeMap<ChannelKey, SimChannel>>,
    streams: Mutex<HashMap<StreamHandle, SimStream>>,
    next_stream: AtomicU64,
    /// Per-stream queue length
    frame_buffer: usize,
    last_emit: Mutex<Option<TimeStamp>>,
    stats: Mutex<SimStats>,
}

impl Default for SimulatedStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedStore {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(BTreeMap::new()),
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            frame_buffer: 1024,
            last_emit: Mutex::new(None),
            stats: Mutex::new(SimStats::default()),
        }
    }

    pub fn with_frame_buffer(mut self, frames: usize) -> Self {
        self.frame_buffer = frames.max(1);
        self
    }

    pub fn with_channel(self, descriptor: ChannelDescriptor, pattern: SignalPattern) -> Self {
        self.add_channel(descriptor, pattern, DEFAULT_SAMPLE_PERIOD_NS);
        self
    }

    /// Register a channel whose history is sampled every `period_ns`
    pub fn add_channel(&self, descriptor: ChannelDescriptor, pattern: SignalPattern, period_ns: i64) {
        self.channels.lock().insert(
            descriptor.key,
            SimChannel {
                descriptor,
                pattern,
                period_ns: period_ns.max(1),
                emitted: 0,
            },
        );
    }

    pub fn channel_keys(&self) -> Vec<ChannelKey> {
        self.channels.lock().keys().copied().collect()
    }

    pub fn open_streams(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn stats(&self) -> SimStats {
        self.stats.lock().clone()
    }

    /// Push one sample per subscribed channel to every open stream. Timestamps
    /// are forced to increase. Returns the number of frames queued.
    pub fn emit(&self, ts: TimeStamp) -> usize {
        let ts = {
            let mut last = self.last_emit.lock();
            let ts = match *last {
                Some(prev) if ts <= prev => prev.next(),
                _ => ts,
            };
            *last = Some(ts);
            ts
        };

        let mut samples: HashMap<ChannelKey, Segment> = HashMap::new();
        {
            let mut channels = self.channels.lock();
            for (key, channel) in channels.iter_mut() {
                let value = channel.pattern.value_at(ts, channel.emitted);
                match Segment::from_samples(channel.descriptor.data_type, &[(ts, value)]) {
                    Ok(segment) => {
                        channel.emitted += 1;
                        samples.insert(*key, segment);
                    }
                    Err(e) => tracing::warn!("simulated sample for {} rejected: {}", key, e),
                }
            }
        }

        let mut sent = 0;
        let mut dropped = 0;
        for stream in self.streams.lock().values() {
            let mut frame = Frame::new();
            for key in &stream.channels {
                if let Some(segment) = samples.get(key) {
                    frame.push(*key, segment.clone());
                }
            }
            if frame.is_empty() {
                continue;
            }
            match stream.tx.try_send(frame) {
                Ok(()) => sent += 1,
                Err(TrySendError::Full(_)) => dropped += 1,
                Err(TrySendError::Disconnected(_)) => {}
            }
        }

        let mut stats = self.stats.lock();
        stats.frames_sent += sent;
        stats.frames_dropped += dropped;
        sent as usize
    }

    /// Emit at the current time every `period` until cancelled
    pub async fn run(&self, period: Duration, cancel: &CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.emit(TimeStamp::now());
                }
            }
        }
    }
}

#[async_trait]
impl Retriever for SimulatedStore {
    async fn retrieve(&self, keys: &[ChannelKey]) -> Result<Vec<ChannelDescriptor>> {
        self.stats.lock().retrieves += 1;
        let channels = self.channels.lock();
        Ok(keys
            .iter()
            .filter_map(|k| channels.get(k).map(|c| c.descriptor.clone()))
            .collect())
    }

    async fn read(&self, key: ChannelKey, range: TimeRange) -> Result<Vec<Segment>> {
        self.stats.lock().reads += 1;
        let (data_type, pattern, period) = {
            let channels = self.channels.lock();
            let channel = channels.get(&key).ok_or(CacheError::NotFound(key))?;
            (channel.descriptor.data_type, channel.pattern, channel.period_ns)
        };
        if range.is_empty() {
            return Ok(Vec::new());
        }

        // first multiple of the period at or after the start
        let first = range.start.0.div_euclid(period) + i64::from(range.start.0.rem_euclid(period) != 0);
        let last = (range.end.0 - 1).div_euclid(period);
        if last.saturating_sub(first).saturating_add(1) > MAX_READ_SAMPLES {
            return Err(CacheError::Transport(format!(
                "read of {:?} would produce more than {} samples",
                range, MAX_READ_SAMPLES
            )));
        }
        let samples: Vec<(TimeStamp, f64)> = (first..=last)
            .map(|i| {
                let ts = TimeStamp(i * period);
                (ts, pattern.value_at(ts, i))
            })
            .collect();
        Ok(vec![Segment::from_values(range, data_type, &samples)?])
    }
}

#[async_trait]
impl StreamTransport for SimulatedStore {
    async fn open(&self, channels: &BTreeSet<ChannelKey>) -> Result<OpenedStream> {
        let handle = StreamHandle(self.next_stream.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = crossbeam_channel::bounded(self.frame_buffer);
        self.streams.lock().insert(
            handle,
            SimStream {
                channels: channels.clone(),
                tx,
            },
        );
        tracing::debug!("simulated stream {:?} opened for {:?}", handle, channels);
        Ok(OpenedStream { handle, frames: rx })
    }

    async fn update(&self, handle: StreamHandle, channels: &BTreeSet<ChannelKey>) -> Result<()> {
        match self.streams.lock().get_mut(&handle) {
            Some(stream) => {
                stream.channels = channels.clone();
                Ok(())
            }
            None => Err(CacheError::Transport(format!("unknown stream {:?}", handle))),
        }
    }

    fn close(&self, handle: StreamHandle) {
        self.streams.lock().remove(&handle);
    }
}
