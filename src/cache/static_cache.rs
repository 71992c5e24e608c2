//! Gap-aware index of committed historical segments for one channel
//!
//! Segments are kept sorted by start time and never overlap. A write replaces
//! every stored segment overlapping its range in a single splice, so a reader
//! holding the cache sees either the state before or after the write.
//!
//! # Eviction
//!
//! Retention is bounded by [`StaticCache::evict_to`], which drops the least
//! recently read segments (ties broken by oldest start time) until the stored
//! byte count fits the budget. Evicted spans simply become gaps again.

use crate::error::{CacheError, Result};
use crate::segment::Segment;
use crate::types::{TimeRange, TimeStamp};

#[derive(Debug, Clone)]
struct Entry {
    segment: Segment,
    /// Access clock value of the last read or write touching this entry
    last_access: u64,
}

/// Result of a static cache read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaticRead {
    /// Stored segments trimmed to the request, in time order
    pub segments: Vec<Segment>,
    /// Sub-ranges of the request with no stored coverage, in time order
    pub gaps: Vec<TimeRange>,
}

/// Ordered, non-overlapping segment store for one channel
#[derive(Debug, Default)]
pub struct StaticCache {
    entries: Vec<Entry>,
    clock: u64,
    bytes: usize,
}

impl StaticCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored segments
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bytes of sample data held
    pub fn byte_len(&self) -> usize {
        self.bytes
    }

    /// End of the newest stored segment
    pub fn upper_bound(&self) -> Option<TimeStamp> {
        self.entries.last().map(|e| e.segment.time_range().end)
    }

    /// Merged spans currently covered by stored segments
    pub fn coverage(&self) -> Vec<TimeRange> {
        let mut out: Vec<TimeRange> = Vec::new();
        for entry in &self.entries {
            let tr = entry.segment.time_range();
            match out.last_mut() {
                Some(last) if last.end == tr.start => last.end = tr.end,
                _ => out.push(tr),
            }
        }
        out
    }

    /// Replace everything overlapping `range` with `segments`.
    ///
    /// `segments` must be time-ordered, contiguous and exactly cover `range`.
    /// Stored segments that straddle the edges of `range` keep their parts
    /// outside it.
    pub fn write(&mut self, range: TimeRange, segments: Vec<Segment>) -> Result<()> {
        validate_cover(&range, &segments)?;
        if range.is_empty() {
            return Ok(());
        }

        self.clock += 1;
        let tick = self.clock;

        let lo = self
            .entries
            .partition_point(|e| e.segment.time_range().end <= range.start);
        let hi = self
            .entries
            .partition_point(|e| e.segment.time_range().start < range.end);

        let mut replacement = Vec::with_capacity(segments.len() + 2);
        if lo < hi {
            let first = &self.entries[lo];
            let left = TimeRange::new(first.segment.time_range().start, range.start);
            if let Some(keep) = first.segment.trim(&left) {
                replacement.push(Entry {
                    segment: keep.compact(),
                    last_access: first.last_access,
                });
            }
        }
        replacement.extend(segments.into_iter().map(|segment| Entry {
            segment,
            last_access: tick,
        }));
        if lo < hi {
            let last = &self.entries[hi - 1];
            let right = TimeRange::new(range.end, last.segment.time_range().end);
            if let Some(keep) = last.segment.trim(&right) {
                replacement.push(Entry {
                    segment: keep.compact(),
                    last_access: last.last_access,
                });
            }
        }

        let added: usize = replacement.iter().map(|e| e.segment.byte_len()).sum();
        let removed: usize = self
            .entries
            .splice(lo..hi, replacement)
            .map(|e| e.segment.byte_len())
            .sum();
        self.bytes = self.bytes + added - removed;

        tracing::trace!(
            "static write {:?}: replaced {} segments, now {} ({} bytes)",
            range,
            hi - lo,
            self.entries.len(),
            self.bytes
        );
        Ok(())
    }

    /// Stored segments intersecting `range`, trimmed to it, plus the gaps
    /// between them.
    pub fn read(&mut self, range: &TimeRange) -> StaticRead {
        let mut out = StaticRead::default();
        if range.is_empty() {
            return out;
        }
        self.clock += 1;
        let tick = self.clock;

        let lo = self
            .entries
            .partition_point(|e| e.segment.time_range().end <= range.start);
        let mut cursor = range.start;
        for entry in self.entries[lo..].iter_mut() {
            let Some(view) = entry.segment.trim(range) else {
                break;
            };
            let tr = view.time_range();
            if tr.start > cursor {
                out.gaps.push(TimeRange::new(cursor, tr.start));
            }
            cursor = tr.end;
            entry.last_access = tick;
            out.segments.push(view);
        }
        if cursor < range.end {
            out.gaps.push(TimeRange::new(cursor, range.end));
        }
        out
    }

    /// Evict least recently used segments until at most `budget` bytes remain.
    /// Returns the ranges that were evicted.
    pub fn evict_to(&mut self, budget: usize) -> Vec<TimeRange> {
        let mut evicted = Vec::new();
        while self.bytes > budget {
            let victim = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, e)| (e.last_access, e.segment.time_range().start))
                .map(|(i, _)| i);
            let Some(index) = victim else {
                break;
            };
            let entry = self.entries.remove(index);
            self.bytes -= entry.segment.byte_len();
            evicted.push(entry.segment.time_range());
        }
        if !evicted.is_empty() {
            tracing::debug!(
                "evicted {} segments, {} bytes remain",
                evicted.len(),
                self.bytes
            );
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }
}

/// Check that `segments` are ordered, contiguous and exactly cover `range`
fn validate_cover(range: &TimeRange, segments: &[Segment]) -> Result<()> {
    if !range.is_valid() {
        return Err(CacheError::InvariantViolation(format!(
            "write range {:?} is inverted",
            range
        )));
    }
    let (Some(first), Some(last)) = (segments.first(), segments.last()) else {
        if range.is_empty() {
            return Ok(());
        }
        return Err(CacheError::InvariantViolation(format!(
            "no segments supplied to cover {:?}",
            range
        )));
    };
    if first.time_range().start != range.start || last.time_range().end != range.end {
        return Err(CacheError::InvariantViolation(format!(
            "segments span [{}, {}) but the write covers {:?}",
            first.time_range().start.0,
            last.time_range().end.0,
            range
        )));
    }
    for pair in segments.windows(2) {
        let (a, b) = (pair[0].time_range(), pair[1].time_range());
        if a.end != b.start {
            return Err(CacheError::InvariantViolation(format!(
                "segments {:?} and {:?} are not contiguous",
                a, b
            )));
        }
    }
    if let Some(bad) = segments.iter().find(|s| s.time_range().is_empty()) {
        return Err(CacheError::InvariantViolation(format!(
            "segment {:?} has an empty range",
            bad.time_range()
        )));
    }
    Ok(())
}
