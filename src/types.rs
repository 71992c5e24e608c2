//! Core data types for telemcache
//!
//! This module contains the fundamental value types shared by the cache and the
//! stream multiplexer.
//!
//! # Main Types
//!
//! - [`ChannelKey`] - Identifies a single telemetry source
//! - [`DataType`] - Sample encoding of a channel (u8, i32, f64, etc.)
//! - [`TimeStamp`] - Nanoseconds since the Unix epoch
//! - [`TimeRange`] - Half-open `[start, end)` interval of timestamps
//! - [`ChannelDescriptor`] - Resolved metadata for a channel

use serde::{Deserialize, Serialize};
use std::fmt;

/// Key of a telemetry channel in the remote store.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct ChannelKey(pub u32);

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelKey({})", self.0)
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for ChannelKey {
    fn from(value: u32) -> Self {
        ChannelKey(value)
    }
}

/// Sample encoding of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum DataType {
    /// 8-bit unsigned integer
    U8,
    /// 16-bit unsigned integer
    U16,
    /// 32-bit unsigned integer
    U32,
    /// 64-bit unsigned integer
    U64,
    /// 8-bit signed integer
    I8,
    /// 16-bit signed integer
    I16,
    /// 32-bit signed integer
    I32,
    /// 64-bit signed integer
    I64,
    /// 32-bit floating point
    F32,
    /// 64-bit floating point
    #[default]
    F64,
}

impl DataType {
    /// Returns the size in bytes of one sample of this type (the channel density)
    pub fn size_bytes(&self) -> usize {
        match self {
            DataType::U8 | DataType::I8 => 1,
            DataType::U16 | DataType::I16 => 2,
            DataType::U32 | DataType::I32 | DataType::F32 => 4,
            DataType::U64 | DataType::I64 | DataType::F64 => 8,
        }
    }

    /// Parse one little-endian sample into a f64 value for plotting
    pub fn parse_to_f64(&self, bytes: &[u8]) -> Option<f64> {
        let size = self.size_bytes();
        if bytes.len() < size {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[..size].copy_from_slice(&bytes[..size]);

        Some(match self {
            DataType::U8 => buf[0] as f64,
            DataType::I8 => buf[0] as i8 as f64,
            DataType::U16 => u16::from_le_bytes([buf[0], buf[1]]) as f64,
            DataType::I16 => i16::from_le_bytes([buf[0], buf[1]]) as f64,
            DataType::U32 => u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64,
            DataType::I32 => i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64,
            DataType::F32 => f32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as f64,
            DataType::U64 => u64::from_le_bytes(buf) as f64,
            DataType::I64 => i64::from_le_bytes(buf) as f64,
            DataType::F64 => f64::from_le_bytes(buf),
        })
    }

    /// Encode a f64 value as one little-endian sample, appending it to `out`.
    /// Integer types saturate at their bounds.
    pub fn encode_f64(&self, value: f64, out: &mut Vec<u8>) {
        match self {
            DataType::U8 => out.push(value as u8),
            DataType::I8 => out.push(value as i8 as u8),
            DataType::U16 => out.extend_from_slice(&(value as u16).to_le_bytes()),
            DataType::I16 => out.extend_from_slice(&(value as i16).to_le_bytes()),
            DataType::U32 => out.extend_from_slice(&(value as u32).to_le_bytes()),
            DataType::I32 => out.extend_from_slice(&(value as i32).to_le_bytes()),
            DataType::F32 => out.extend_from_slice(&(value as f32).to_le_bytes()),
            DataType::U64 => out.extend_from_slice(&(value as u64).to_le_bytes()),
            DataType::I64 => out.extend_from_slice(&(value as i64).to_le_bytes()),
            DataType::F64 => out.extend_from_slice(&value.to_le_bytes()),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::U8 => write!(f, "u8"),
            DataType::U16 => write!(f, "u16"),
            DataType::U32 => write!(f, "u32"),
            DataType::U64 => write!(f, "u64"),
            DataType::I8 => write!(f, "i8"),
            DataType::I16 => write!(f, "i16"),
            DataType::I32 => write!(f, "i32"),
            DataType::I64 => write!(f, "i64"),
            DataType::F32 => write!(f, "f32"),
            DataType::F64 => write!(f, "f64"),
        }
    }
}

/// Nanoseconds since the Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct TimeStamp(pub i64);

impl TimeStamp {
    pub const MIN: TimeStamp = TimeStamp(i64::MIN);
    pub const MAX: TimeStamp = TimeStamp(i64::MAX);

    pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

    /// Current wall-clock time
    pub fn now() -> Self {
        TimeStamp(chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX))
    }

    pub fn from_secs(secs: i64) -> Self {
        TimeStamp(secs.saturating_mul(Self::NANOS_PER_SECOND))
    }

    pub fn from_millis(millis: i64) -> Self {
        TimeStamp(millis.saturating_mul(1_000_000))
    }

    /// Shift by a signed number of nanoseconds, saturating at the bounds
    #[inline]
    pub fn offset(self, nanos: i64) -> Self {
        TimeStamp(self.0.saturating_add(nanos))
    }

    /// The timestamp immediately after this one
    #[inline]
    pub fn next(self) -> Self {
        self.offset(1)
    }

    /// Seconds since the epoch as f64, the x-axis unit used by plots
    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / Self::NANOS_PER_SECOND as f64
    }
}

impl fmt::Debug for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimeStamp({})", self.0)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.div_euclid(Self::NANOS_PER_SECOND);
        let nanos = self.0.rem_euclid(Self::NANOS_PER_SECOND) as u32;
        match chrono::DateTime::from_timestamp(secs, nanos) {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.9fZ")),
            None => write!(f, "{}ns", self.0),
        }
    }
}

/// Half-open interval `[start, end)` of timestamps
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: TimeStamp,
    pub end: TimeStamp,
}

impl TimeRange {
    pub fn new(start: TimeStamp, end: TimeStamp) -> Self {
        Self { start, end }
    }

    /// Convenience constructor from raw nanosecond values
    pub fn from_nanos(start: i64, end: i64) -> Self {
        Self::new(TimeStamp(start), TimeStamp(end))
    }

    /// A range is valid when `start <= end`
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    /// Span in nanoseconds (zero for empty or inverted ranges)
    pub fn span(&self) -> i64 {
        if self.is_empty() {
            0
        } else {
            self.end.0.saturating_sub(self.start.0)
        }
    }

    #[inline]
    pub fn contains(&self, ts: TimeStamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Whether `other` lies entirely inside this range
    pub fn contains_range(&self, other: &TimeRange) -> bool {
        other.start >= self.start && other.end <= self.end
    }

    /// Whether the two ranges share at least one instant
    #[inline]
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Intersection of two ranges, or `None` when they share no instant
    pub fn intersection(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        if start < end {
            Some(TimeRange { start, end })
        } else {
            None
        }
    }
}

impl fmt::Debug for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start.0, self.end.0)
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} - {})", self.start, self.end)
    }
}

/// Resolved metadata for a channel. Immutable once retrieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub key: ChannelKey,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    pub data_type: DataType,
    /// Bytes per sample
    pub density: usize,
}

impl ChannelDescriptor {
    pub fn new(key: impl Into<ChannelKey>, data_type: DataType) -> Self {
        Self {
            key: key.into(),
            name: String::new(),
            data_type,
            density: data_type.size_bytes(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}
