//! Per-channel pairing of the static cache and the dynamic stage

use super::dynamic::DynamicStage;
use super::static_cache::StaticCache;
use crate::error::{CacheError, Result};
use crate::gpu::DeviceAllocator;
use crate::segment::Segment;
use crate::types::{ChannelDescriptor, ChannelKey, DataType, TimeRange, TimeStamp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Tuning shared by every channel cache of a manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOptions {
    /// Samples per sealed live segment
    pub dynamic_capacity: usize,
    /// Byte budget of each static cache; `None` keeps everything
    pub static_budget_bytes: Option<usize>,
    /// Copy backfilled views into owned buffers before committing them
    pub compact_static_writes: bool,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            dynamic_capacity: 4096,
            static_budget_bytes: Some(64 * 1024 * 1024),
            compact_static_writes: true,
        }
    }
}

/// Outcome of a live write
#[derive(Debug, Clone, Default)]
pub struct DynamicWrite {
    /// Segments sealed and committed to the static cache by this write
    pub flushed: Vec<Segment>,
    /// The open segment after the write
    pub current: Option<Segment>,
    /// Device mirror failure during the write; the next write retries it
    pub device_error: Option<CacheError>,
}

impl DynamicWrite {
    /// Flushed segments followed by the open one
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.flushed.iter().chain(self.current.iter())
    }
}

/// Outcome of a channel read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadResult {
    /// Covering segments in time order; the live segment, if any, is last
    pub series: Vec<Segment>,
    /// Parts of the request with no cached coverage
    pub gaps: Vec<TimeRange>,
}

impl ReadResult {
    /// True when the request is fully covered
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.series.iter().map(Segment::len).sum()
    }
}

/// Statistics for one channel cache
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub dynamic_writes: u64,
    pub samples_written: u64,
    pub flushes: u64,
    pub static_writes: u64,
    pub reads: u64,
    /// Reads that returned at least one gap
    pub partial_reads: u64,
    pub evicted_segments: u64,
    /// Live writes whose device mirror update failed
    pub device_errors: u64,
    pub static_segments: usize,
    pub static_bytes: usize,
    pub open_samples: usize,
}

/// Static cache plus dynamic stage for a single channel
#[derive(Debug)]
pub struct ChannelCache {
    descriptor: ChannelDescriptor,
    static_cache: StaticCache,
    dynamic: DynamicStage,
    options: ChannelOptions,
    /// Set after an invariant violation; the cache refuses all work until rebuilt
    poisoned: Option<String>,
    stats: ChannelStats,
}

impl ChannelCache {
    pub fn new(
        descriptor: ChannelDescriptor,
        options: ChannelOptions,
        allocator: Arc<dyn DeviceAllocator>,
    ) -> Result<Self> {
        let dynamic = DynamicStage::new(descriptor.data_type, options.dynamic_capacity, allocator)?;
        Ok(Self {
            descriptor,
            static_cache: StaticCache::new(),
            dynamic,
            options,
            poisoned: None,
            stats: ChannelStats::default(),
        })
    }

    pub fn key(&self) -> ChannelKey {
        self.descriptor.key
    }

    pub fn descriptor(&self) -> &ChannelDescriptor {
        &self.descriptor
    }

    pub fn data_type(&self) -> DataType {
        self.descriptor.data_type
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    fn check(&self) -> Result<()> {
        if let Some(reason) = &self.poisoned {
            return Err(CacheError::InvariantViolation(format!(
                "channel {} needs rebuild: {}",
                self.descriptor.key, reason
            )));
        }
        if self.dynamic.is_closed() {
            return Err(CacheError::Closed);
        }
        Ok(())
    }

    /// Record a fatal error so later calls fail until the cache is rebuilt
    fn guard<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_fatal() {
                tracing::error!("channel {} poisoned: {}", self.descriptor.key, err);
                self.poisoned = Some(err.to_string());
            }
        }
        result
    }

    /// Append live samples. Segments sealed by the stage are committed to the
    /// static cache under their exact span.
    ///
    /// A device mirror failure does not fail the write: the samples are kept
    /// and the error is reported in [`DynamicWrite::device_error`].
    pub fn write_dynamic(&mut self, batch: &Segment) -> Result<DynamicWrite> {
        self.check()?;
        let staged = {
            let result = self.dynamic.write(batch);
            self.guard(result)?
        };
        for segment in &staged.flushed {
            let result = self
                .static_cache
                .write(segment.time_range(), vec![segment.clone()]);
            self.guard(result)?;
        }
        if !staged.flushed.is_empty() {
            self.enforce_budget();
        }

        self.stats.dynamic_writes += 1;
        self.stats.samples_written += batch.len() as u64;
        self.stats.flushes += staged.flushed.len() as u64;
        if staged.mirror_error.is_some() {
            self.stats.device_errors += 1;
        }
        Ok(DynamicWrite {
            flushed: staged.flushed,
            current: self.dynamic.current(),
            device_error: staged.mirror_error,
        })
    }

    /// Live write that skips samples at or before the newest one already
    /// ingested. Lets several listeners feed the same channel from one stream.
    /// Returns `None` when the whole batch was already seen.
    pub fn ingest(&mut self, batch: &Segment) -> Result<Option<DynamicWrite>> {
        let fresh = match self.dynamic.open_range() {
            Some(open) => batch.trim(&TimeRange::new(open.end, TimeStamp::MAX)),
            None => Some(batch.clone()),
        };
        match fresh {
            Some(segment) if !segment.is_empty() => self.write_dynamic(&segment).map(Some),
            _ => Ok(None),
        }
    }

    /// Backfill historical data. `segments` must exactly cover `range`.
    pub fn write_static(&mut self, range: TimeRange, segments: Vec<Segment>) -> Result<()> {
        self.check()?;
        let expected = self.descriptor.data_type;
        if let Some(bad) = segments.iter().find(|s| s.data_type() != expected) {
            return Err(CacheError::DataTypeMismatch {
                expected,
                actual: bad.data_type(),
            });
        }
        let segments = if self.options.compact_static_writes {
            segments.into_iter().map(Segment::compact).collect()
        } else {
            segments
        };
        let result = self.static_cache.write(range, segments);
        self.guard(result)?;
        self.stats.static_writes += 1;
        self.enforce_budget();
        Ok(())
    }

    fn enforce_budget(&mut self) {
        if let Some(budget) = self.options.static_budget_bytes {
            let evicted = self.static_cache.evict_to(budget);
            self.stats.evicted_segments += evicted.len() as u64;
        }
    }

    /// Read `range` from the static cache, with the live segment appended when
    /// the request reaches into it.
    pub fn read(&mut self, range: &TimeRange) -> Result<ReadResult> {
        self.check()?;
        let static_read = self.static_cache.read(range);
        let mut series = static_read.segments;
        let mut gaps = static_read.gaps;

        let live_from = series
            .last()
            .map_or(range.start, |s| s.time_range().end.max(range.start));
        if let Some(live) = self.dynamic.read(&TimeRange::new(live_from, range.end)) {
            gaps = subtract(gaps, &live.time_range());
            series.push(live);
        }

        self.stats.reads += 1;
        if !gaps.is_empty() {
            self.stats.partial_reads += 1;
        }
        Ok(ReadResult { series, gaps })
    }

    /// The open live segment
    pub fn current(&self) -> Option<Segment> {
        self.dynamic.current()
    }

    /// Range covered by the open live segment
    pub fn live_range(&self) -> Option<TimeRange> {
        self.dynamic.open_range()
    }

    /// Merged spans held by the static cache
    pub fn coverage(&self) -> Vec<TimeRange> {
        self.static_cache.coverage()
    }

    /// Change the live seal size
    pub fn set_dynamic_capacity(&mut self, capacity: usize) -> Result<()> {
        self.check()?;
        self.dynamic.set_capacity(capacity)?;
        self.options.dynamic_capacity = capacity;
        Ok(())
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            static_segments: self.static_cache.len(),
            static_bytes: self.static_cache.byte_len(),
            open_samples: self.dynamic.len(),
            ..self.stats.clone()
        }
    }

    /// Release the device mirror and drop all cached data
    pub fn close(&mut self) {
        self.dynamic.close();
        self.static_cache.clear();
    }
}

/// Remove `cut` from each of `gaps`
fn subtract(gaps: Vec<TimeRange>, cut: &TimeRange) -> Vec<TimeRange> {
    let mut out = Vec::with_capacity(gaps.len());
    for gap in gaps {
        if !gap.overlaps(cut) {
            out.push(gap);
            continue;
        }
        if gap.start < cut.start {
            out.push(TimeRange::new(gap.start, cut.start));
        }
        if cut.end < gap.end {
            out.push(TimeRange::new(cut.end, gap.end));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HostAllocator;

    fn cache_with(options: ChannelOptions) -> (ChannelCache, HostAllocator) {
        let alloc = HostAllocator::new();
        let cache = ChannelCache::new(
            ChannelDescriptor::new(7, DataType::F64),
            options,
            Arc::new(alloc.clone()),
        )
        .unwrap();
        (cache, alloc)
    }

    fn cache(capacity: usize) -> ChannelCache {
        cache_with(ChannelOptions {
            dynamic_capacity: capacity,
            ..ChannelOptions::default()
        })
        .0
    }

    fn run(start: i64, n: i64) -> Segment {
        let samples: Vec<_> = (start..start + n).map(|t| (TimeStamp(t), t as f64)).collect();
        Segment::from_samples(DataType::F64, &samples).unwrap()
    }

    fn span(start: i64, end: i64) -> Segment {
        let samples: Vec<_> = (start..end).map(|t| (TimeStamp(t), 0.5)).collect();
        Segment::from_values(TimeRange::from_nanos(start, end), DataType::F64, &samples).unwrap()
    }

    #[test]
    fn test_empty_read_is_one_gap() {
        let mut c = cache(16);
        let r = TimeRange::from_nanos(0, 100);
        let result = c.read(&r).unwrap();
        assert!(result.series.is_empty());
        assert_eq!(result.gaps, vec![r]);
    }

    #[test]
    fn test_static_union_has_no_gaps() {
        let mut c = cache(16);
        c.write_static(TimeRange::from_nanos(0, 10), vec![span(0, 10)])
            .unwrap();
        c.write_static(TimeRange::from_nanos(10, 25), vec![span(10, 25)])
            .unwrap();
        let result = c.read(&TimeRange::from_nanos(0, 25)).unwrap();
        assert!(result.is_complete());
        let ranges: Vec<_> = result.series.iter().map(|s| s.time_range()).collect();
        assert_eq!(
            ranges,
            vec![TimeRange::from_nanos(0, 10), TimeRange::from_nanos(10, 25)]
        );
    }

    #[test]
    fn test_static_write_is_idempotent() {
        let mut once = cache(16);
        let mut twice = cache(16);
        let r = TimeRange::from_nanos(0, 10);
        once.write_static(r, vec![span(0, 10)]).unwrap();
        twice.write_static(r, vec![span(0, 10)]).unwrap();
        twice.write_static(r, vec![span(0, 10)]).unwrap();
        let wide = TimeRange::from_nanos(-5, 20);
        assert_eq!(once.read(&wide).unwrap(), twice.read(&wide).unwrap());
    }

    #[test]
    fn test_dynamic_flush_lands_in_static() {
        let mut c = cache(4);
        c.write_dynamic(&run(0, 4)).unwrap();
        let out = c.write_dynamic(&run(4, 2)).unwrap();
        assert_eq!(out.flushed.len(), 1);
        assert_eq!(out.current.as_ref().unwrap().len(), 2);
        assert_eq!(out.segments().count(), 2);
        assert_eq!(c.coverage(), vec![TimeRange::from_nanos(0, 4)]);
    }

    #[test]
    fn test_read_appends_live_tail() {
        let mut c = cache(4);
        c.write_dynamic(&run(0, 4)).unwrap();
        c.write_dynamic(&run(4, 3)).unwrap();
        let result = c.read(&TimeRange::from_nanos(0, 10)).unwrap();
        assert_eq!(result.series.len(), 2);
        assert_eq!(result.series[1].time_range(), TimeRange::from_nanos(4, 7));
        assert_eq!(result.gaps, vec![TimeRange::from_nanos(7, 10)]);
        assert_eq!(result.sample_count(), 7);
    }

    #[test]
    fn test_live_only_read() {
        let mut c = cache(64);
        c.write_dynamic(&run(100, 10)).unwrap();
        let result = c.read(&TimeRange::from_nanos(50, 110)).unwrap();
        assert_eq!(result.series.len(), 1);
        assert_eq!(result.gaps, vec![TimeRange::from_nanos(50, 100)]);
    }

    #[test]
    fn test_ingest_skips_seen_samples() {
        let mut c = cache(64);
        assert!(c.ingest(&run(0, 5)).unwrap().is_some());
        assert!(c.ingest(&run(0, 5)).unwrap().is_none());
        let out = c.ingest(&run(3, 4)).unwrap().unwrap();
        assert_eq!(out.current.unwrap().len(), 7);
        assert!(!c.is_poisoned());
    }

    #[test]
    fn test_type_mismatch_is_not_fatal() {
        let mut c = cache(16);
        let wrong = Segment::from_samples(DataType::U8, &[(TimeStamp(0), 1.0)]).unwrap();
        let err = c
            .write_static(TimeRange::from_nanos(0, 1), vec![wrong.clone()])
            .unwrap_err();
        assert!(matches!(err, CacheError::DataTypeMismatch { .. }));
        assert!(c.write_dynamic(&wrong).is_err());
        assert!(!c.is_poisoned());
    }

    #[test]
    fn test_out_of_order_live_write_poisons() {
        let mut c = cache(16);
        c.write_dynamic(&run(10, 5)).unwrap();
        assert!(c.write_dynamic(&run(0, 2)).unwrap_err().is_fatal());
        assert!(c.is_poisoned());
        assert!(c.read(&TimeRange::from_nanos(0, 10)).unwrap_err().is_fatal());
    }

    #[test]
    fn test_bad_cover_poisons() {
        let mut c = cache(16);
        let err = c
            .write_static(TimeRange::from_nanos(0, 20), vec![span(0, 10)])
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(c.is_poisoned());
    }

    #[test]
    fn test_budget_evicts_oldest() {
        let (mut c, _) = cache_with(ChannelOptions {
            dynamic_capacity: 16,
            static_budget_bytes: Some(20 * 8),
            compact_static_writes: true,
        });
        c.write_static(TimeRange::from_nanos(0, 10), vec![span(0, 10)])
            .unwrap();
        c.write_static(TimeRange::from_nanos(10, 20), vec![span(10, 20)])
            .unwrap();
        c.write_static(TimeRange::from_nanos(20, 30), vec![span(20, 30)])
            .unwrap();
        assert_eq!(c.stats().evicted_segments, 1);
        assert_eq!(c.coverage(), vec![TimeRange::from_nanos(10, 30)]);
    }

    #[test]
    fn test_device_failure_keeps_live_data() {
        // 32-byte mirror fits; growing it to 64 bytes beside the old one does not
        let alloc = HostAllocator::new().with_limit(40);
        let mut c = ChannelCache::new(
            ChannelDescriptor::new(7, DataType::F64),
            ChannelOptions {
                dynamic_capacity: 4,
                ..ChannelOptions::default()
            },
            Arc::new(alloc.clone()),
        )
        .unwrap();

        c.write_dynamic(&run(0, 3)).unwrap();
        let out = c.write_dynamic(&run(3, 3)).unwrap();
        assert!(matches!(out.device_error, Some(CacheError::Device(_))));
        let out = c.write_dynamic(&run(6, 3)).unwrap();
        assert_eq!(out.flushed.len(), 1);

        assert_eq!(c.coverage(), vec![TimeRange::from_nanos(0, 4)]);
        assert!(!c.is_poisoned());
        let result = c.read(&TimeRange::from_nanos(0, 9)).unwrap();
        assert!(result.is_complete());
        assert_eq!(result.sample_count(), 9);
        assert_eq!(c.stats().device_errors, 2);
        c.write_dynamic(&run(9, 1)).unwrap();
    }

    #[test]
    fn test_close_releases_device_memory() {
        let (mut c, alloc) = cache_with(ChannelOptions::default());
        c.write_dynamic(&run(0, 10)).unwrap();
        assert_eq!(alloc.live_buffers(), 1);
        c.close();
        assert_eq!(alloc.live_buffers(), 0);
        assert!(matches!(c.read(&TimeRange::from_nanos(0, 1)), Err(CacheError::Closed)));
    }

    #[test]
    fn test_stats() {
        let mut c = cache(4);
        c.write_dynamic(&run(0, 5)).unwrap();
        c.write_dynamic(&run(5, 1)).unwrap();
        c.read(&TimeRange::from_nanos(0, 100)).unwrap();
        let stats = c.stats();
        assert_eq!(stats.dynamic_writes, 2);
        assert_eq!(stats.samples_written, 6);
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.static_segments, 1);
        assert_eq!(stats.open_samples, 2);
        assert_eq!(stats.partial_reads, 1);
    }

    #[test]
    fn test_subtract() {
        let gaps = vec![TimeRange::from_nanos(0, 10), TimeRange::from_nanos(20, 30)];
        let out = subtract(gaps, &TimeRange::from_nanos(5, 25));
        assert_eq!(
            out,
            vec![TimeRange::from_nanos(0, 5), TimeRange::from_nanos(25, 30)]
        );
    }
}
