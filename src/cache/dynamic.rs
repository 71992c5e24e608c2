//! Bounded live-ingestion stage for one channel
//!
//! The stage accumulates streamed samples in one open buffer. Once the buffer
//! has reached its capacity it is *about to flush*: the next write first seals
//! exactly `capacity` samples into an immutable [`Segment`], hands it back to
//! the caller for commit to the static cache, and keeps the remainder as the
//! start of a fresh buffer. Sealing repeats until the open buffer is below
//! capacity. A batch larger than the capacity is additionally sealed in full
//! chunks as soon as it is appended, so the open buffer stays bounded.
//!
//! Sealed segments are contiguous: each one ends where the next begins, at the
//! timestamp of the first sample kept in the open buffer.
//!
//! Every append is mirrored into a device buffer owned by the stage. The
//! device buffer is recreated whenever the open buffer outgrows it or the
//! capacity changes. A failed recreation keeps the previous buffer and marks
//! the mirror stale until a later write brings it up to date.

use crate::error::{CacheError, Result};
use crate::gpu::{DeviceAllocator, DeviceBuffer};
use crate::segment::Segment;
use crate::types::{DataType, TimeRange, TimeStamp};
use std::sync::Arc;

/// Live buffer plus its device mirror
#[derive(Debug)]
pub struct DynamicStage {
    data_type: DataType,
    /// Samples per sealed segment
    capacity: usize,
    timestamps: Vec<TimeStamp>,
    data: Vec<u8>,
    /// Start of the open segment: the end of the last sealed one, or the first
    /// sample ever written
    span_start: Option<TimeStamp>,
    allocator: Arc<dyn DeviceAllocator>,
    mirror: Option<Box<dyn DeviceBuffer>>,
    /// Set when the last mirror sync failed
    mirror_stale: bool,
    flushes: u64,
}

/// Outcome of an accepted [`DynamicStage::write`]
#[derive(Debug, Default)]
pub struct StageWrite {
    /// Segments sealed by this write, oldest first
    pub flushed: Vec<Segment>,
    /// Set when the device mirror could not be updated. Host-side samples are
    /// intact either way.
    pub mirror_error: Option<CacheError>,
}

impl DynamicStage {
    pub fn new(
        data_type: DataType,
        capacity: usize,
        allocator: Arc<dyn DeviceAllocator>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(CacheError::Config(
                "dynamic capacity must be at least one sample".to_string(),
            ));
        }
        let mirror = allocator.allocate(capacity * data_type.size_bytes())?;
        Ok(Self {
            data_type,
            capacity,
            timestamps: Vec::with_capacity(capacity),
            data: Vec::with_capacity(capacity * data_type.size_bytes()),
            span_start: None,
            allocator,
            mirror: Some(mirror),
            mirror_stale: false,
            flushes: 0,
        })
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples in the open buffer
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Whether the next write will seal the open buffer first
    pub fn is_about_to_flush(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Number of segments sealed over the stage's lifetime
    pub fn flush_count(&self) -> u64 {
        self.flushes
    }

    /// Range covered by the open buffer
    pub fn open_range(&self) -> Option<TimeRange> {
        let start = self.span_start?;
        let last = self.timestamps.last()?;
        Some(TimeRange::new(start, last.next()))
    }

    /// The device mirror, for render passes
    pub fn mirror(&self) -> Option<&dyn DeviceBuffer> {
        self.mirror.as_deref()
    }

    /// Append a batch of streamed samples.
    ///
    /// Validation failures leave the stage untouched. Once the batch is
    /// accepted the write always reports the segments it sealed; a failure to
    /// update the device mirror is returned alongside them and retried by the
    /// next write.
    pub fn write(&mut self, batch: &Segment) -> Result<StageWrite> {
        if batch.data_type() != self.data_type {
            return Err(CacheError::DataTypeMismatch {
                expected: self.data_type,
                actual: batch.data_type(),
            });
        }
        if self.mirror.is_none() {
            return Err(CacheError::Closed);
        }
        let Some(first) = batch.first_timestamp() else {
            return Ok(StageWrite::default());
        };
        let floor = match (self.timestamps.last(), self.span_start) {
            (Some(last), _) => Some(last.next()),
            (None, start) => start,
        };
        if let Some(floor) = floor {
            if first < floor {
                return Err(CacheError::InvariantViolation(format!(
                    "live sample at {} arrived before open segment end {}",
                    first.0, floor.0
                )));
            }
        }

        let mut flushed = Vec::new();
        while self.len() >= self.capacity {
            flushed.push(self.seal()?);
        }

        let mut offset = if flushed.is_empty() { self.data.len() } else { 0 };
        if self.span_start.is_none() {
            self.span_start = Some(first);
        }
        self.timestamps.extend_from_slice(batch.timestamps());
        self.data.extend_from_slice(batch.bytes());

        // a batch larger than the stage is sealed right away in full chunks
        if batch.len() > self.capacity {
            while self.len() > self.capacity {
                flushed.push(self.seal()?);
            }
            offset = 0;
        }

        let mirror_error = self.sync_mirror(offset).err();
        if let Some(err) = &mirror_error {
            tracing::warn!("device mirror out of date: {}", err);
        }
        Ok(StageWrite {
            flushed,
            mirror_error,
        })
    }

    /// Seal the first `capacity` samples into a segment
    fn seal(&mut self) -> Result<Segment> {
        let n = self.capacity.min(self.len());
        let density = self.data_type.size_bytes();
        let start = self.span_start.unwrap_or(self.timestamps[0]);
        let end = match self.timestamps.get(n) {
            Some(next) => *next,
            None => self.timestamps[n - 1].next(),
        };

        let segment = Segment::new(
            TimeRange::new(start, end),
            self.data_type,
            self.timestamps[..n].to_vec(),
            self.data[..n * density].to_vec(),
        )?;
        self.timestamps.drain(..n);
        self.data.drain(..n * density);
        self.span_start = Some(end);
        self.flushes += 1;

        tracing::trace!(
            "sealed {} samples over {:?}, {} left open",
            segment.len(),
            segment.time_range(),
            self.len()
        );
        Ok(segment)
    }

    /// Upload open-buffer bytes from `offset` onward, growing the mirror if
    /// the buffer has outgrown it. After a failed sync the next one uploads
    /// everything.
    fn sync_mirror(&mut self, offset: usize) -> Result<()> {
        let offset = if self.mirror_stale { 0 } else { offset };
        let result = self.try_sync(offset);
        self.mirror_stale = result.is_err();
        result
    }

    fn try_sync(&mut self, offset: usize) -> Result<()> {
        let needed = self.data.len();
        let too_small = self
            .mirror
            .as_ref()
            .map_or(true, |m| m.capacity() < needed);
        if too_small {
            let base = self.capacity * self.data_type.size_bytes();
            self.replace_mirror(needed.max(base).next_power_of_two())?;
            return self.upload(0);
        }
        self.upload(offset)
    }

    fn upload(&mut self, offset: usize) -> Result<()> {
        match self.mirror.as_mut() {
            Some(mirror) => mirror.write(offset, &self.data[offset..]),
            None => Err(CacheError::Closed),
        }
    }

    /// Swap in a new device buffer of `bytes`. The old buffer is kept if the
    /// allocation fails.
    fn replace_mirror(&mut self, bytes: usize) -> Result<()> {
        let fresh = self.allocator.allocate(bytes)?;
        if let Some(mut old) = self.mirror.replace(fresh) {
            old.release();
        }
        tracing::debug!("recreated device mirror with {} bytes", bytes);
        Ok(())
    }

    /// Change the seal size. Recreates the device mirror; on allocation
    /// failure the stage keeps its old capacity and mirror.
    pub fn set_capacity(&mut self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            return Err(CacheError::Config(
                "dynamic capacity must be at least one sample".to_string(),
            ));
        }
        if self.mirror.is_none() {
            return Err(CacheError::Closed);
        }
        let bytes = (capacity * self.data_type.size_bytes()).max(self.data.len());
        self.replace_mirror(bytes)?;
        self.capacity = capacity;
        self.sync_mirror(0)
    }

    /// The open buffer as a segment, for real-time renderers
    pub fn current(&self) -> Option<Segment> {
        let range = self.open_range()?;
        Segment::new(
            range,
            self.data_type,
            self.timestamps.clone(),
            self.data.clone(),
        )
        .ok()
    }

    /// The open buffer trimmed to `range`, or `None` if nothing intersects
    pub fn read(&self, range: &TimeRange) -> Option<Segment> {
        let open = self.open_range()?;
        if !open.overlaps(range) {
            return None;
        }
        self.current()?.trim(range)
    }

    /// Release the device mirror and drop buffered samples. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut mirror) = self.mirror.take() {
            mirror.release();
        }
        self.timestamps = Vec::new();
        self.data = Vec::new();
    }

    pub fn is_closed(&self) -> bool {
        self.mirror.is_none()
    }
}

impl Drop for DynamicStage {
    fn drop(&mut self) {
        self.close();
    }
}
