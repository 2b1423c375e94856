//! The raw sample container.

use super::units::Timestamp;
use super::{MAX_DEVICES, MAX_EVENTS};

/// A fixed-arity set of raw counter slots, one per active event.
///
/// A sample is opaque: only the reader that filled it knows which slot holds
/// which (socket, domain) or device, and what unit the raw value is in. CPU
/// and GPU backends write disjoint slot families, so a single sample can be
/// filled by a composed reader. OCC slots additionally carry the sensor's
/// own timestamp; other backends leave the timestamp slot at zero.
#[derive(Clone, Copy, Debug)]
pub struct Sample {
    values: [u64; MAX_EVENTS],
    times: [u64; MAX_EVENTS],
    gpu: [u64; MAX_DEVICES],
}

impl Default for Sample {
    fn default() -> Self {
        Self {
            values: [0; MAX_EVENTS],
            times: [0; MAX_EVENTS],
            gpu: [0; MAX_DEVICES],
        }
    }
}

impl Sample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self, idx: usize) -> u64 {
        self.values[idx]
    }

    pub fn set_value(&mut self, idx: usize, value: u64) {
        self.values[idx] = value;
    }

    pub fn time(&self, idx: usize) -> u64 {
        self.times[idx]
    }

    pub fn set_time(&mut self, idx: usize, time_ns: u64) {
        self.times[idx] = time_ns;
    }

    pub fn gpu_value(&self, idx: usize) -> u64 {
        self.gpu[idx]
    }

    pub fn set_gpu_value(&mut self, idx: usize, value: u64) {
        self.gpu[idx] = value;
    }
}

/// A sample with the monotonic timestamp captured immediately before the
/// sensors were read.
#[derive(Clone, Copy, Debug)]
pub struct TimedSample {
    pub timestamp: Timestamp,
    pub sample: Sample,
}

impl TimedSample {
    pub fn new(timestamp: Timestamp, sample: Sample) -> Self {
        Self { timestamp, sample }
    }
}

/// The sequence of timed samples collected over one region execution.
pub type TimedExecution = Vec<TimedSample>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_independent() {
        let mut s = Sample::new();
        s.set_value(3, 42);
        s.set_time(3, 7);

        s.set_gpu_value(1, 9);

        assert_eq!(s.value(3), 42);
        assert_eq!(s.time(3), 7);
        assert_eq!(s.gpu_value(1), 9);
        for i in (0..MAX_EVENTS).filter(|&i| i != 3) {
            assert_eq!(s.value(i), 0);
            assert_eq!(s.time(i), 0);
        }
        for i in (0..MAX_DEVICES).filter(|&i| i != 1) {
            assert_eq!(s.gpu_value(i), 0);
        }
    }
}
