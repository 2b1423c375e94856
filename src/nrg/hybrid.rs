//! Composition of the CPU and GPU readers.

use std::sync::Arc;

use super::error::{Error, Result};
use super::sample::Sample;
use super::{CpuReader, EnergyReader, GpuReader};

/// A fixed-shape composition of the active backends.
///
/// `read_all` is the ordered composition of each member's `read_all`,
/// short-circuiting on the first error. Per-event reads are not available:
/// slot indices would be ambiguous across members.
pub struct HybridReader {
    cpu: Option<Arc<CpuReader>>,
    gpu: Option<Arc<GpuReader>>,
}

impl HybridReader {
    pub fn new(cpu: Option<Arc<CpuReader>>, gpu: Option<Arc<GpuReader>>) -> Self {
        Self { cpu, gpu }
    }
}

impl EnergyReader for HybridReader {
    fn read_all(&self, sample: &mut Sample) -> Result<()> {
        if let Some(cpu) = &self.cpu {
            cpu.read_all(sample)?;
        }
        if let Some(gpu) = &self.gpu {
            gpu.read_all(sample)?;
        }
        Ok(())
    }

    fn read_one(&self, _sample: &mut Sample, _idx: usize) -> Result<()> {
        Err(Error::NotImplemented)
    }

    fn num_events(&self) -> usize {
        self.cpu.as_ref().map_or(0, |r| r.num_events())
            + self.gpu.as_ref().map_or(0, |r| r.num_events())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_hybrid() {
        let hybrid = HybridReader::new(None, None);
        let mut sample = Sample::new();

        assert_eq!(hybrid.num_events(), 0);
        assert!(hybrid.read_all(&mut sample).is_ok());
        assert!(matches!(
            hybrid.read_one(&mut sample, 0),
            Err(Error::NotImplemented)
        ));
    }
}
