//! Immutable sample segments and stream frames
//!
//! A [`Segment`] is a time-stamped slice of typed samples for one channel. Its
//! buffers are reference counted, so trimming a segment to a sub-range produces a
//! cheap view instead of a copy. Segments are never mutated after construction,
//! which lets the static cache and any number of read results share them.
//!
//! A [`Frame`] is the unit delivered by the stream transport: one or more
//! `(channel, segment)` pairs in arrival order.

use crate::error::{CacheError, Result};
use crate::types::{ChannelKey, DataType, TimeRange, TimeStamp};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Immutable, time-stamped slice of samples for one channel
#[derive(Clone)]
pub struct Segment {
    time_range: TimeRange,
    data_type: DataType,
    timestamps: Arc<[TimeStamp]>,
    data: Arc<[u8]>,
    /// First visible sample in the shared buffers
    offset: usize,
    /// Number of visible samples
    len: usize,
}

impl Segment {
    /// Build a segment from raw little-endian sample bytes.
    ///
    /// Timestamps must be strictly increasing and lie inside `time_range`, and
    /// `data` must hold exactly one sample of `data_type` per timestamp.
    pub fn new(
        time_range: TimeRange,
        data_type: DataType,
        timestamps: Vec<TimeStamp>,
        data: Vec<u8>,
    ) -> Result<Self> {
        if !time_range.is_valid() {
            return Err(CacheError::InvariantViolation(format!(
                "segment range {:?} is inverted",
                time_range
            )));
        }
        let expected = timestamps.len() * data_type.size_bytes();
        if data.len() != expected {
            return Err(CacheError::InvariantViolation(format!(
                "segment holds {} bytes for {} {} samples (expected {})",
                data.len(),
                timestamps.len(),
                data_type,
                expected
            )));
        }
        check_timestamps(&timestamps)?;
        if let (Some(first), Some(last)) = (timestamps.first(), timestamps.last()) {
            if !time_range.contains(*first) || !time_range.contains(*last) {
                return Err(CacheError::InvariantViolation(format!(
                    "samples [{}, {}] fall outside segment range {:?}",
                    first.0, last.0, time_range
                )));
            }
        }

        let len = timestamps.len();
        Ok(Self {
            time_range,
            data_type,
            timestamps: timestamps.into(),
            data: data.into(),
            offset: 0,
            len,
        })
    }

    /// A segment that covers `time_range` but holds no samples. Used to record
    /// that the store has no data for a span.
    pub fn empty(time_range: TimeRange, data_type: DataType) -> Self {
        Self {
            time_range,
            data_type,
            timestamps: Arc::from(Vec::<TimeStamp>::new()),
            data: Arc::from(Vec::<u8>::new()),
            offset: 0,
            len: 0,
        }
    }

    /// Build a segment over `time_range` from `(timestamp, value)` pairs
    pub fn from_values(
        time_range: TimeRange,
        data_type: DataType,
        samples: &[(TimeStamp, f64)],
    ) -> Result<Self> {
        let mut data = Vec::with_capacity(samples.len() * data_type.size_bytes());
        let mut timestamps = Vec::with_capacity(samples.len());
        for &(ts, value) in samples {
            timestamps.push(ts);
            data_type.encode_f64(value, &mut data);
        }
        Self::new(time_range, data_type, timestamps, data)
    }

    /// Build a segment whose range is exactly `[first, last + 1)` of its samples.
    /// This is the shape of a batch arriving from the live stream.
    pub fn from_samples(data_type: DataType, samples: &[(TimeStamp, f64)]) -> Result<Self> {
        let range = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => TimeRange::new(first.0, last.0.next()),
            _ => TimeRange::default(),
        };
        Self::from_values(range, data_type, samples)
    }

    #[inline]
    pub fn time_range(&self) -> TimeRange {
        self.time_range
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Number of samples
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the visible sample data in bytes
    #[inline]
    pub fn byte_len(&self) -> usize {
        self.len * self.data_type.size_bytes()
    }

    #[inline]
    pub fn timestamps(&self) -> &[TimeStamp] {
        &self.timestamps[self.offset..self.offset + self.len]
    }

    /// Raw little-endian sample bytes
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        let density = self.data_type.size_bytes();
        &self.data[self.offset * density..(self.offset + self.len) * density]
    }

    pub fn first_timestamp(&self) -> Option<TimeStamp> {
        self.timestamps().first().copied()
    }

    pub fn last_timestamp(&self) -> Option<TimeStamp> {
        self.timestamps().last().copied()
    }

    /// Decoded value of the sample at `index`
    pub fn value(&self, index: usize) -> Option<f64> {
        if index >= self.len {
            return None;
        }
        let density = self.data_type.size_bytes();
        let start = index * density;
        self.data_type.parse_to_f64(&self.bytes()[start..start + density])
    }

    /// Iterate decoded values in time order
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        let density = self.data_type.size_bytes();
        self.bytes()
            .chunks_exact(density)
            .filter_map(move |chunk| self.data_type.parse_to_f64(chunk))
    }

    /// Iterate `(timestamp, value)` pairs in time order
    pub fn samples(&self) -> impl Iterator<Item = (TimeStamp, f64)> + '_ {
        self.timestamps().iter().copied().zip(self.values())
    }

    /// Samples as plot points (seconds, value)
    pub fn as_plot_points(&self) -> Vec<[f64; 2]> {
        self.samples()
            .map(|(ts, v)| [ts.as_secs_f64(), v])
            .collect()
    }

    /// View of this segment restricted to `range`, sharing the same buffers.
    /// Returns `None` when the two ranges share no instant.
    pub fn trim(&self, range: &TimeRange) -> Option<Segment> {
        let time_range = self.time_range.intersection(range)?;
        let ts = self.timestamps();
        let lo = ts.partition_point(|t| *t < time_range.start);
        let hi = ts.partition_point(|t| *t < time_range.end);
        Some(Segment {
            time_range,
            data_type: self.data_type,
            timestamps: Arc::clone(&self.timestamps),
            data: Arc::clone(&self.data),
            offset: self.offset + lo,
            len: hi - lo,
        })
    }

    /// Whether this segment is a narrow view into larger shared buffers
    pub fn is_view(&self) -> bool {
        self.offset != 0 || self.len != self.timestamps.len()
    }

    /// Copy a view out into buffers of its own so the cache does not pin the
    /// larger allocation it was cut from.
    pub fn compact(self) -> Segment {
        if !self.is_view() {
            return self;
        }
        Segment {
            time_range: self.time_range,
            data_type: self.data_type,
            timestamps: Arc::from(self.timestamps()),
            data: Arc::from(self.bytes()),
            offset: 0,
            len: self.len,
        }
    }

    /// Normalize fetched segments so that they exactly cover `range`.
    ///
    /// Segments are trimmed to `range`, ordered by start, and every hole between
    /// them is filled with an empty segment. Overlapping input is rejected.
    pub fn cover(
        range: TimeRange,
        data_type: DataType,
        segments: Vec<Segment>,
    ) -> Result<Vec<Segment>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let mut trimmed = Vec::with_capacity(segments.len());
        for segment in &segments {
            if segment.data_type != data_type {
                return Err(CacheError::DataTypeMismatch {
                    expected: data_type,
                    actual: segment.data_type,
                });
            }
            if let Some(view) = segment.trim(&range) {
                trimmed.push(view);
            }
        }
        trimmed.sort_by_key(|s| s.time_range.start);

        let mut out = Vec::with_capacity(trimmed.len() * 2 + 1);
        let mut cursor = range.start;
        for segment in trimmed {
            let tr = segment.time_range;
            if tr.start < cursor {
                return Err(CacheError::InvariantViolation(format!(
                    "fetched segment {:?} overlaps data ending at {}",
                    tr, cursor.0
                )));
            }
            if tr.start > cursor {
                out.push(Segment::empty(TimeRange::new(cursor, tr.start), data_type));
            }
            cursor = tr.end;
            out.push(segment);
        }
        if cursor < range.end {
            out.push(Segment::empty(TimeRange::new(cursor, range.end), data_type));
        }
        Ok(out)
    }
}

fn check_timestamps(timestamps: &[TimeStamp]) -> Result<()> {
    if let Some(pos) = timestamps.windows(2).position(|w| w[0] >= w[1]) {
        return Err(CacheError::InvariantViolation(format!(
            "timestamps out of order at sample {}: {} then {}",
            pos,
            timestamps[pos].0,
            timestamps[pos + 1].0
        )));
    }
    Ok(())
}

impl PartialEq for Segment {
    fn eq(&self, other: &Self) -> bool {
        self.time_range == other.time_range
            && self.data_type == other.data_type
            && self.timestamps() == other.timestamps()
            && self.bytes() == other.bytes()
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("time_range", &self.time_range)
            .field("data_type", &self.data_type)
            .field("len", &self.len)
            .finish()
    }
}

/// One unit of stream data: `(channel, segment)` pairs in arrival order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frame {
    entries: Vec<(ChannelKey, Segment)>,
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append
    pub fn with(mut self, key: impl Into<ChannelKey>, segment: Segment) -> Self {
        self.push(key, segment);
        self
    }

    pub fn push(&mut self, key: impl Into<ChannelKey>, segment: Segment) {
        self.entries.push((key.into(), segment));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelKey, &Segment)> {
        self.entries.iter().map(|(k, s)| (*k, s))
    }

    /// Distinct channels carried by this frame
    pub fn channels(&self) -> BTreeSet<ChannelKey> {
        self.entries.iter().map(|(k, _)| *k).collect()
    }

    /// Segments for one channel, in arrival order
    pub fn get(&self, key: ChannelKey) -> impl Iterator<Item = &Segment> {
        self.entries
            .iter()
            .filter(move |(k, _)| *k == key)
            .map(|(_, s)| s)
    }

    pub fn intersects(&self, channels: &BTreeSet<ChannelKey>) -> bool {
        self.entries.iter().any(|(k, _)| channels.contains(k))
    }

    /// Sub-frame holding only the entries for `channels`
    pub fn filter(&self, channels: &BTreeSet<ChannelKey>) -> Frame {
        Frame {
            entries: self
                .entries
                .iter()
                .filter(|(k, _)| channels.contains(k))
                .cloned()
                .collect(),
        }
    }

    pub fn into_entries(self) -> Vec<(ChannelKey, Segment)> {
        self.entries
    }
}
