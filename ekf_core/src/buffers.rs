// ekf_core/src/buffers.rs

use heapless::Deque;

use crate::messages::{
    AirspeedSample, AuxVelSample, BaroSample, ExtVisionSample, FlowSample, GpsSample, ImuSample,
    MagSample, OutputSample, RangeSample,
};
use crate::types::TimeUs;

/// Samples older than the fusion horizon by more than this are stale (us).
pub const MAX_SAMPLE_AGE_US: u64 = 100_000;

/// Anything that can be placed on the delayed horizon.
pub trait Timestamped {
    fn time_us(&self) -> TimeUs;
}

macro_rules! impl_timestamped {
    ($($sample:ty),* $(,)?) => {
        $(
            impl Timestamped for $sample {
                fn time_us(&self) -> TimeUs {
                    self.time_us
                }
            }
        )*
    };
}

impl_timestamped!(
    ImuSample,
    GpsSample,
    MagSample,
    BaroSample,
    RangeSample,
    FlowSample,
    AirspeedSample,
    ExtVisionSample,
    AuxVelSample,
    OutputSample,
);

/// A fixed-capacity, time-ordered queue of samples.
///
/// `N` is the storage capacity; `length` limits how many samples are kept so
/// the same type can serve delay lines of different depth. Pushing into a
/// full buffer drops the oldest sample.
#[derive(Debug, Clone)]
pub struct ObservationBuffer<T, const N: usize> {
    samples: Deque<T, N>,
    length: usize,
}

impl<T: Timestamped + Copy, const N: usize> Default for ObservationBuffer<T, N> {
    fn default() -> Self {
        Self::with_length(N)
    }
}

impl<T: Timestamped + Copy, const N: usize> ObservationBuffer<T, N> {
    /// Creates a buffer that keeps at most `length` samples, clamped to `1..=N`.
    pub fn with_length(length: usize) -> Self {
        Self {
            samples: Deque::new(),
            length: length.clamp(1, N),
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// True once the buffer holds `length` samples.
    pub fn is_full(&self) -> bool {
        self.samples.len() >= self.length
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Appends a sample, evicting the oldest one when full. Samples that are
    /// not newer than the current newest are ignored and `false` is
    /// returned.
    pub fn push(&mut self, sample: T) -> bool {
        if let Some(newest) = self.samples.back() {
            if sample.time_us() <= newest.time_us() {
                return false;
            }
        }
        while self.samples.len() >= self.length {
            self.samples.pop_front();
        }
        // Cannot fail: room was made above and `length <= N`.
        self.samples.push_back(sample).is_ok()
    }

    pub fn newest(&self) -> Option<&T> {
        self.samples.back()
    }

    pub fn oldest(&self) -> Option<&T> {
        self.samples.front()
    }

    /// Removes and returns the newest sample measured at or before
    /// `horizon_us`, discarding everything older than it. Returns `None` if
    /// no such sample exists or if it is more than [`MAX_SAMPLE_AGE_US`]
    /// behind the horizon; a stale sample is discarded as well.
    pub fn pop_first_older_than(&mut self, horizon_us: TimeUs) -> Option<T> {
        let ready = self
            .samples
            .iter()
            .take_while(|s| s.time_us() <= horizon_us)
            .count();
        if ready == 0 {
            return None;
        }
        for _ in 1..ready {
            self.samples.pop_front();
        }
        let sample = self.samples.pop_front()?;
        if horizon_us - sample.time_us() < MAX_SAMPLE_AGE_US {
            Some(sample)
        } else {
            None
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.samples.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.samples.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baro(time_us: TimeUs, hgt: f32) -> BaroSample {
        BaroSample { time_us, hgt }
    }

    #[test]
    fn pop_returns_newest_sample_behind_horizon() {
        let mut buffer: ObservationBuffer<BaroSample, 8> = ObservationBuffer::default();
        for i in 1..=5 {
            assert!(buffer.push(baro(i * 10_000, i as f32)));
        }

        let popped = buffer.pop_first_older_than(35_000).map(|s| s.hgt);
        assert_eq!(popped, Some(3.0));
        // Older samples are gone, newer ones remain.
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.oldest().map(|s| s.time_us), Some(40_000));
        // Nothing left behind the same horizon.
        assert!(buffer.pop_first_older_than(35_000).is_none());
    }

    #[test]
    fn stale_samples_are_discarded() {
        let mut buffer: ObservationBuffer<BaroSample, 4> = ObservationBuffer::default();
        buffer.push(baro(10_000, 1.0));
        assert!(buffer.pop_first_older_than(10_000 + MAX_SAMPLE_AGE_US).is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn full_buffer_evicts_oldest() {
        let mut buffer: ObservationBuffer<BaroSample, 8> = ObservationBuffer::with_length(3);
        for i in 1..=4 {
            buffer.push(baro(i, i as f32));
        }
        assert!(buffer.is_full());
        assert_eq!(buffer.oldest().map(|s| s.time_us), Some(2));
        assert_eq!(buffer.newest().map(|s| s.time_us), Some(4));
    }

    #[test]
    fn out_of_order_sample_is_ignored() {
        let mut buffer: ObservationBuffer<BaroSample, 4> = ObservationBuffer::default();
        assert!(buffer.push(baro(20, 1.0)));
        assert!(!buffer.push(baro(10, 2.0)));
        assert!(!buffer.push(baro(20, 3.0)));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn length_is_clamped_to_capacity() {
        let buffer: ObservationBuffer<BaroSample, 4> = ObservationBuffer::with_length(100);
        assert_eq!(buffer.length(), 4);
        let buffer: ObservationBuffer<BaroSample, 4> = ObservationBuffer::with_length(0);
        assert_eq!(buffer.length(), 1);
    }
}
