//! Strongly-typed sensor quantities.
//!
//! Counters are kept in the integral unit the hardware reports (microjoules,
//! microwatts, nanoseconds) and converted explicitly at the output boundary.

use std::fmt;
use std::ops::Sub;

use nix::sys::time::TimeValLike;
use nix::time::{clock_gettime, ClockId};

/// Energy in microjoules.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Energy(u64);

impl Energy {
    pub const fn from_microjoules(uj: u64) -> Self {
        Self(uj)
    }

    pub const fn microjoules(&self) -> u64 {
        self.0
    }

    pub fn joules(&self) -> f64 {
        self.0 as f64 / 1e6
    }
}

impl fmt::Display for Energy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} uJ", self.0)
    }
}

/// Power in microwatts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Power(u64);

impl Power {
    pub const fn from_microwatts(uw: u64) -> Self {
        Self(uw)
    }

    pub const fn from_milliwatts(mw: u64) -> Self {
        Self(mw * 1000)
    }

    pub const fn microwatts(&self) -> u64 {
        self.0
    }

    pub fn watts(&self) -> f64 {
        self.0 as f64 / 1e6
    }
}

impl fmt::Display for Power {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} uW", self.0)
    }
}

/// A monotonic clock reading in nanoseconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_nanoseconds(ns: u64) -> Self {
        Self(ns)
    }

    pub const fn nanoseconds(&self) -> u64 {
        self.0
    }

    /// Captures the current `CLOCK_MONOTONIC` reading.
    pub fn now() -> Self {
        // clock_gettime on CLOCK_MONOTONIC cannot fail on Linux
        let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).expect("CLOCK_MONOTONIC unavailable");
        Self(ts.num_nanoseconds() as u64)
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, rhs: Self) -> u64 {
        self.0.saturating_sub(rhs.0)
    }
}

/// A decoded sensor reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reading {
    Energy(Energy),
    Power(Power),
}

/// A reading paired with the sensor's own timestamp when the hardware
/// provides one (OCC does, RAPL does not).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SensorValue {
    pub reading: Reading,
    pub timestamp: Option<Timestamp>,
}

impl SensorValue {
    pub fn energy(energy: Energy) -> Self {
        Self {
            reading: Reading::Energy(energy),
            timestamp: None,
        }
    }

    pub fn power_at(power: Power, timestamp: Timestamp) -> Self {
        Self {
            reading: Reading::Power(power),
            timestamp: Some(timestamp),
        }
    }
}
