//! GPU board power reader backed by NVML.
//!
//! One event slot per selected device. NVML reports instantaneous board
//! power; energy accessors therefore always report the energy-readings
//! support error on this backend.

use std::sync::Arc;

use log::{debug, info, warn};
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;

use super::error::{Error, Result};
use super::sample::Sample;
use super::units::{Energy, Power};
use super::{EnergyReader, MAX_DEVICES};

/// Energy reader over the NVML device library.
pub struct GpuReader {
    nvml: Arc<Nvml>,
    event_map: [i8; MAX_DEVICES],
    /// Device index per event slot.
    devices: Vec<u32>,
    /// Devices that answered the setup power probe.
    power_supported: [bool; MAX_DEVICES],
}

impl GpuReader {
    pub fn new(device_mask: u32) -> Result<Self> {
        if device_mask == 0 {
            return Err(Error::InvalidDeviceMask);
        }

        let nvml = Nvml::init().map_err(|e| match e {
            NvmlError::LibloadingError(_) | NvmlError::DriverNotLoaded => Error::NoDevices,
            other => Error::GpuLib(other),
        })?;

        let count = nvml.device_count()?;
        if count == 0 {
            return Err(Error::NoDevices);
        }
        if count as usize > MAX_DEVICES {
            return Err(Error::TooManyDevices);
        }
        info!("gpu: found {} devices", count);

        let mut reader = Self {
            nvml: Arc::new(nvml),
            event_map: [-1; MAX_DEVICES],
            devices: Vec::new(),
            power_supported: [false; MAX_DEVICES],
        };

        for dev in 0..count {
            if device_mask & (1 << dev) == 0 {
                continue;
            }
            let device = reader.nvml.device_by_index(dev)?;
            match device.power_usage() {
                Ok(_) => reader.power_supported[dev as usize] = true,
                Err(NvmlError::NotSupported) => {
                    warn!("gpu: device {} does not support power readings", dev);
                }
                Err(e) => return Err(Error::GpuLib(e)),
            }
            debug!("gpu: added device {}", dev);
            reader.event_map[dev as usize] = reader.devices.len() as i8;
            reader.devices.push(dev);
        }

        if reader.devices.is_empty() {
            return Err(Error::NoEventsAdded);
        }
        Ok(reader)
    }

    pub fn event_idx(&self, dev: usize) -> i8 {
        self.event_map[dev]
    }

    /// Board power of `dev` in `sample`.
    pub fn board_power(&self, sample: &Sample, dev: usize) -> Result<Power> {
        let idx = self.event_map[dev];
        if idx < 0 {
            return Err(Error::NoSuchEvent);
        }
        if !self.power_supported[dev] {
            return Err(Error::PowerReadingsNotSupported);
        }
        Ok(Power::from_microwatts(sample.gpu_value(idx as usize)))
    }

    /// NVML exposes no energy accumulator here.
    pub fn board_energy(&self, _sample: &Sample, dev: usize) -> Result<Energy> {
        if self.event_map[dev] < 0 {
            return Err(Error::NoSuchEvent);
        }
        Err(Error::EnergyReadingsNotSupported)
    }
}

impl EnergyReader for GpuReader {
    fn read_all(&self, sample: &mut Sample) -> Result<()> {
        for idx in 0..self.devices.len() {
            self.read_one(sample, idx)?;
        }
        Ok(())
    }

    fn read_one(&self, sample: &mut Sample, idx: usize) -> Result<()> {
        let dev = self.devices[idx];
        if !self.power_supported[dev as usize] {
            // unsupported devices keep a zeroed slot; the accessor reports
            // the support error
            sample.set_gpu_value(idx, 0);
            return Ok(());
        }
        let milliwatts = self.nvml.device_by_index(dev)?.power_usage()?;
        sample.set_gpu_value(idx, Power::from_milliwatts(milliwatts as u64).microwatts());
        Ok(())
    }

    fn num_events(&self) -> usize {
        self.devices.len()
    }
}
