//! Fixed-capacity circular sample storage with a parallel marker ring
//!
//! Logical sample indices are 1-based and grow without bound (`smax` is the
//! total number of samples ever written). Logical sample `i` lives in slot
//! `(i - 1) % capacity`, so only the last `capacity` samples are retrievable.

use crate::error::{BspError, BspResult};
use crate::marker::Marker;
use crate::signal_block::SignalBlock;

/// Circular buffer of multichannel frames plus an independent marker ring
#[derive(Debug, Clone)]
pub struct RingBuffer {
    capacity: usize,
    channel_count: usize,
    sampling_rate: f32,
    // Slot-major: slot p occupies data[p * channel_count..(p + 1) * channel_count]
    data: Vec<f32>,
    smax: u64,
    // Markers with absolute latencies; marker m (1-based) lives in slot (m - 1) % marker_capacity
    markers: Vec<Option<Marker>>,
    mmax: u64,
}

impl RingBuffer {
    /// Create an empty ring
    pub fn new(
        capacity: usize,
        channel_count: usize,
        sampling_rate: f32,
        marker_capacity: usize,
    ) -> BspResult<Self> {
        if capacity == 0 {
            return Err(BspError::invalid_argument("capacity", "ring capacity must be at least one sample"));
        }
        if channel_count == 0 {
            return Err(BspError::invalid_argument("channel_count", "ring needs at least one channel"));
        }
        if marker_capacity == 0 {
            return Err(BspError::invalid_argument("marker_capacity", "marker ring capacity must be at least one"));
        }

        Ok(RingBuffer {
            capacity,
            channel_count,
            sampling_rate,
            data: vec![0.0; capacity * channel_count],
            smax: 0,
            markers: vec![None; marker_capacity],
            mmax: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn sampling_rate(&self) -> f32 {
        self.sampling_rate
    }

    pub fn marker_capacity(&self) -> usize {
        self.markers.len()
    }

    /// Total samples ever written
    pub fn smax(&self) -> u64 {
        self.smax
    }

    /// Total markers ever written
    pub fn mmax(&self) -> u64 {
        self.mmax
    }

    /// Number of samples currently retrievable
    pub fn retained(&self) -> u64 {
        self.smax.min(self.capacity as u64)
    }

    /// Oldest logical index still retrievable (`smax + 1` when empty)
    pub fn oldest_retained(&self) -> u64 {
        self.smax - self.retained() + 1
    }

    /// Physical slot of a logical sample index
    fn slot(&self, index: u64) -> usize {
        ((index - 1) % self.capacity as u64) as usize
    }

    /// Append samples and markers.
    ///
    /// Marker latencies are relative to the appended block (1-based, so a
    /// marker on the first new sample has latency 1.0).
    pub fn append(&mut self, samples: &SignalBlock, markers: &[Marker]) -> BspResult<()> {
        if samples.channel_count() != self.channel_count {
            return Err(BspError::shape(
                "appended sample channels",
                self.channel_count,
                samples.channel_count(),
            ));
        }

        let count = samples.samples();
        if let Some(bad) = markers
            .iter()
            .find(|m| !(m.latency >= 1.0 && m.latency < count as f64 + 1.0))
        {
            return Err(BspError::invalid_argument(
                "markers",
                format!(
                    "marker '{}' latency {} lies outside the appended block of {} samples",
                    bad.kind, bad.latency, count
                ),
            ));
        }

        // Frames that would be overwritten within this append are skipped
        let skip = count.saturating_sub(self.capacity);
        for (offset, frame) in samples.frames().enumerate().skip(skip) {
            let slot = self.slot(self.smax + offset as u64 + 1);
            let start = slot * self.channel_count;
            self.data[start..start + self.channel_count].copy_from_slice(frame);
        }

        let base = self.smax as f64;
        for marker in markers {
            let slot = (self.mmax % self.markers.len() as u64) as usize;
            self.markers[slot] = Some(marker.shifted(base));
            self.mmax += 1;
        }

        self.smax += count as u64;
        Ok(())
    }

    fn check_range(&self, start: u64, end: u64) -> BspResult<()> {
        if start == 0 || start > end || end > self.smax {
            return Err(BspError::invalid_argument(
                "range",
                format!(
                    "window [{}, {}] is not within the written samples [1, {}]",
                    start, end, self.smax
                ),
            ));
        }
        if self.smax - start >= self.capacity as u64 {
            return Err(BspError::Range {
                start,
                oldest: self.oldest_retained(),
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Read the inclusive logical window `[start, end]` in sample order
    pub fn read_window(&self, start: u64, end: u64) -> BspResult<SignalBlock> {
        self.check_range(start, end)?;

        let count = (end - start + 1) as usize;
        let mut data = Vec::with_capacity(count * self.channel_count);

        let first_slot = self.slot(start);
        let contiguous = count.min(self.capacity - first_slot);
        data.extend_from_slice(
            &self.data[first_slot * self.channel_count..(first_slot + contiguous) * self.channel_count],
        );
        if contiguous < count {
            // Wrapped part continues at slot 0
            data.extend_from_slice(&self.data[..(count - contiguous) * self.channel_count]);
        }

        SignalBlock::new(data, self.channel_count, self.sampling_rate)
    }

    /// Retained markers attached to samples in `[start, end]`, ordered by latency.
    /// Latencies are absolute.
    pub fn markers_in(&self, start: u64, end: u64) -> Vec<Marker> {
        if start > end {
            return Vec::new();
        }

        let retained = self.mmax.min(self.markers.len() as u64);
        let mut found: Vec<Marker> = (self.mmax - retained..self.mmax)
            .filter_map(|m| self.markers[(m % self.markers.len() as u64) as usize].as_ref())
            .filter(|marker| {
                let pos = marker.sample_position();
                pos >= start && pos <= end
            })
            .cloned()
            .collect();

        found.sort_by(|a, b| a.latency.total_cmp(&b.latency));
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ramp(from: u64, to: u64, channels: usize) -> SignalBlock {
        let mut data = Vec::new();
        for i in from..=to {
            for ch in 0..channels {
                data.push(i as f32 + ch as f32 * 1000.0);
            }
        }
        SignalBlock::new(data, channels, 100.0).unwrap()
    }

    #[test]
    fn test_wraparound_read() {
        let mut ring = RingBuffer::new(10, 1, 100.0, 4).unwrap();
        ring.append(&ramp(1, 25, 1), &[]).unwrap();

        assert_eq!(ring.smax(), 25);
        assert_eq!(ring.oldest_retained(), 16);

        let window = ring.read_window(21, 25).unwrap();
        assert_eq!(window.data(), &[21.0, 22.0, 23.0, 24.0, 25.0]);

        let spanning = ring.read_window(18, 22).unwrap();
        assert_eq!(spanning.data(), &[18.0, 19.0, 20.0, 21.0, 22.0]);
    }

    #[test]
    fn test_overwritten_range() {
        let mut ring = RingBuffer::new(10, 2, 100.0, 4).unwrap();
        ring.append(&ramp(1, 25, 2), &[]).unwrap();

        let err = ring.read_window(15, 20).unwrap_err();
        assert_eq!(
            err,
            BspError::Range {
                start: 15,
                oldest: 16,
                capacity: 10
            }
        );
        assert!(matches!(
            ring.read_window(20, 26),
            Err(BspError::InvalidArgument { argument: "range", .. })
        ));
    }

    #[test]
    fn test_channel_mismatch() {
        let mut ring = RingBuffer::new(10, 2, 100.0, 4).unwrap();
        let result = ring.append(&ramp(1, 3, 3), &[]);
        assert!(matches!(result, Err(BspError::Shape { expected: 2, actual: 3, .. })));
        assert_eq!(ring.smax(), 0);
    }

    #[test]
    fn test_marker_absolute_positions() {
        let mut ring = RingBuffer::new(50, 1, 100.0, 8).unwrap();
        ring.append(&ramp(1, 100, 1), &[]).unwrap();
        ring.append(&ramp(101, 120, 1), &[Marker::new("cue", 7.0), Marker::new("resp", 2.5)]).unwrap();

        let markers = ring.markers_in(100, 120);
        assert_eq!(markers.len(), 2);
        assert_eq!(markers[0].kind, "resp");
        assert_eq!(markers[0].latency, 102.5);
        assert_eq!(markers[1].latency, 107.0);

        assert!(ring.markers_in(108, 120).is_empty());
    }

    #[test]
    fn test_marker_ring_overwrites_oldest() {
        let mut ring = RingBuffer::new(50, 1, 100.0, 2).unwrap();
        ring.append(
            &ramp(1, 3, 1),
            &[Marker::new("a", 1.0), Marker::new("b", 2.0), Marker::new("c", 3.0)],
        ).unwrap();

        let kinds: Vec<_> = ring.markers_in(1, 3).into_iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec!["b", "c"]);
        assert_eq!(ring.mmax(), 3);
    }

    #[test]
    fn test_marker_outside_block_rejected() {
        let mut ring = RingBuffer::new(10, 1, 100.0, 2).unwrap();
        let result = ring.append(&ramp(1, 3, 1), &[Marker::new("late", 4.0)]);
        assert!(matches!(result, Err(BspError::InvalidArgument { argument: "markers", .. })));
        assert_eq!(ring.smax(), 0);
    }

    proptest! {
        #[test]
        fn test_single_sample_appends_read_back(capacity in 1usize..40, total in 1u64..200) {
            let mut ring = RingBuffer::new(capacity, 1, 100.0, 4).unwrap();
            for i in 1..=total {
                ring.append(&ramp(i, i, 1), &[]).unwrap();
            }

            let oldest = ring.oldest_retained();
            prop_assert_eq!(oldest, total.saturating_sub(capacity as u64) + 1);

            // Every window inside the retained range reads back exactly
            for start in oldest..=total {
                let window = ring.read_window(start, total).unwrap();
                let expected: Vec<f32> = (start..=total).map(|i| i as f32).collect();
                prop_assert_eq!(window.data(), expected.as_slice());
            }

            // Anything older is gone
            if oldest > 1 {
                let is_range_error = matches!(
                    ring.read_window(oldest - 1, total),
                    Err(BspError::Range { .. })
                );
                prop_assert!(is_range_error);
            }
        }
    }
}
