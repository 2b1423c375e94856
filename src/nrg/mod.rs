//! Energy reading backends.
//!
//! A reader produces raw counter samples from one sensor family: Intel RAPL
//! via powercap sysfs, the POWER9 On-Chip Controller via the OPAL inband
//! sensor export, or GPU board power via NVML. Readers share a small
//! capability surface (`EnergyReader`) so samplers can drive any of them,
//! and decode their own samples through typed accessors.

pub mod error;
pub mod gpu;
pub mod hybrid;
pub mod occ;
pub mod rapl;
pub mod sample;
pub mod units;

pub use error::{Error, ErrorCause, Result};
pub use gpu::GpuReader;
pub use hybrid::HybridReader;
pub use occ::OccReader;
pub use rapl::RaplReader;
pub use sample::{Sample, TimedExecution, TimedSample};
pub use units::{Energy, Power, Reading, SensorValue, Timestamp};

/// Maximum number of CPU sockets (or POWER chips) supported.
pub const MAX_SOCKETS: usize = 8;

/// Maximum number of GPU devices supported.
pub const MAX_DEVICES: usize = 8;

/// RAPL exposes up to 4 domains per socket (PSys is ignored).
pub const RAPL_DOMAINS: usize = 4;

/// The OCC exposes up to 6 power sensors per chip.
pub const OCC_DOMAINS: usize = 6;

/// Counter slots in a sample. Sized for the largest backend layout.
pub const MAX_EVENTS: usize = MAX_SOCKETS * OCC_DOMAINS;

/// Common capability set of all reader backends.
///
/// `read_all` fills every active event slot of the sample; `read_one` fills
/// exactly one. Slot indices are dense in `[0, num_events())`; how a slot
/// maps back to a (socket, domain) or device is private to the backend and
/// exposed through its accessors.
pub trait EnergyReader: Send + Sync {
    fn read_all(&self, sample: &mut Sample) -> Result<()>;

    fn read_one(&self, sample: &mut Sample, idx: usize) -> Result<()>;

    fn num_events(&self) -> usize;
}

/// CPU-side reader: exactly one of the two platform backends.
pub enum CpuReader {
    Rapl(RaplReader),
    Occ(OccReader),
}

impl CpuReader {
    /// Probes the platform backends in order: RAPL first, then OCC.
    ///
    /// A backend that reports no sensors at all makes probing move on; any
    /// other setup failure is fatal.
    pub fn probe(domain_mask: u32, socket_mask: u32) -> Result<Self> {
        match RaplReader::new(domain_mask, socket_mask) {
            Ok(r) => return Ok(CpuReader::Rapl(r)),
            Err(Error::NoSockets) => {}
            Err(e) => return Err(e),
        }
        OccReader::new(domain_mask, socket_mask).map(CpuReader::Occ)
    }
}

impl EnergyReader for CpuReader {
    fn read_all(&self, sample: &mut Sample) -> Result<()> {
        match self {
            CpuReader::Rapl(r) => r.read_all(sample),
            CpuReader::Occ(r) => r.read_all(sample),
        }
    }

    fn read_one(&self, sample: &mut Sample, idx: usize) -> Result<()> {
        match self {
            CpuReader::Rapl(r) => r.read_one(sample, idx),
            CpuReader::Occ(r) => r.read_one(sample, idx),
        }
    }

    fn num_events(&self) -> usize {
        match self {
            CpuReader::Rapl(r) => r.num_events(),
            CpuReader::Occ(r) => r.num_events(),
        }
    }
}
