//! Test data builders for segments and frames

use telemcache::{ChannelKey, DataType, Frame, Segment, TimeRange, TimeStamp};

/// Builder for evenly spaced segments
pub struct SegmentBuilder {
    data_type: DataType,
    start: i64,
    count: usize,
    step: i64,
    range: Option<TimeRange>,
    value: Option<f64>,
}

impl SegmentBuilder {
    pub fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            start: 0,
            count: 0,
            step: 1,
            range: None,
            value: None,
        }
    }

    /// First sample timestamp
    pub fn start(mut self, start: i64) -> Self {
        self.start = start;
        self
    }

    pub fn count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// Spacing between samples in nanoseconds
    pub fn step(mut self, step: i64) -> Self {
        self.step = step;
        self
    }

    /// Explicit range; defaults to `[first, last + 1)`
    pub fn range(mut self, start: i64, end: i64) -> Self {
        self.range = Some(TimeRange::from_nanos(start, end));
        self
    }

    /// Constant value for every sample; defaults to the timestamp
    pub fn value(mut self, value: f64) -> Self {
        self.value = Some(value);
        self
    }

    pub fn build(self) -> Segment {
        let samples: Vec<(TimeStamp, f64)> = (0..self.count as i64)
            .map(|i| {
                let t = self.start + i * self.step;
                (TimeStamp(t), self.value.unwrap_or(t as f64))
            })
            .collect();
        match self.range {
            Some(range) => Segment::from_values(range, self.data_type, &samples).unwrap(),
            None => Segment::from_samples(self.data_type, &samples).unwrap(),
        }
    }
}

/// `count` consecutive f64 samples starting at `start`, one nanosecond apart
pub fn live_batch(start: i64, count: usize) -> Segment {
    SegmentBuilder::new(DataType::F64)
        .start(start)
        .count(count)
        .build()
}

/// A frame with one single-sample segment per key, all at `t`
pub fn frame_at(keys: &[u32], t: i64) -> Frame {
    keys.iter().fold(Frame::new(), |frame, key| {
        frame.with(ChannelKey(*key), live_batch(t, 1))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_builder() {
        let seg = SegmentBuilder::new(DataType::U16)
            .start(10)
            .count(3)
            .step(5)
            .range(0, 30)
            .value(7.0)
            .build();

        assert_eq!(seg.len(), 3);
        assert_eq!(seg.time_range(), TimeRange::from_nanos(0, 30));
        assert_eq!(seg.last_timestamp(), Some(TimeStamp(20)));
        assert!(seg.values().all(|v| v == 7.0));
    }
}
