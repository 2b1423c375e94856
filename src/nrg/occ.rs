//! POWER9 On-Chip Controller energy reader.
//!
//! The OCC exports its sensor space through
//! `/sys/firmware/opal/exports/occ_inband_sensors`: one fixed-size block per
//! chip, each holding a header, a buffer of sensor name records and two
//! (ping/pong) reading buffers the OCC alternates between. Unlike RAPL,
//! every reading carries the sensor's own timebase timestamp.
//!
//! Block parsing is factored over byte slices so the format can be exercised
//! off-target.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

use log::{debug, info};

use super::error::{Error, Result};
use super::sample::Sample;
use super::units::{Power, SensorValue, Timestamp};
use super::{EnergyReader, MAX_SOCKETS, OCC_DOMAINS};

const SENSORS_EXPORT: &str = "/sys/firmware/opal/exports/occ_inband_sensors";

/// Size of one chip's sensor block in the export.
pub const BLOCK_SIZE: usize = 600 * 1024;

const HEADER_SIZE: usize = 24;
const NAME_RECORD_SIZE: usize = 48;
const SUPPORTED_VERSION: u8 = 1;

/// Sensor type field value for power sensors.
const SENSOR_TYPE_POWER: u16 = 0x0080;

/// POWER timebase frequency: 512 MHz.
const TIMEBASE_HZ: u64 = 512_000_000;

/// One OCC power domain of a chip.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OccDomain {
    System,
    Gpu,
    ProcPkg,
    ProcVdd,
    ProcVdn,
    Memory,
}

impl OccDomain {
    pub const ALL: [OccDomain; OCC_DOMAINS] = [
        OccDomain::System,
        OccDomain::Gpu,
        OccDomain::ProcPkg,
        OccDomain::ProcVdd,
        OccDomain::ProcVdn,
        OccDomain::Memory,
    ];

    fn index(&self) -> usize {
        match self {
            OccDomain::System => 0,
            OccDomain::Gpu => 1,
            OccDomain::ProcPkg => 2,
            OccDomain::ProcVdd => 3,
            OccDomain::ProcVdn => 4,
            OccDomain::Memory => 5,
        }
    }

    /// Maps an OCC sensor name to its domain.
    fn from_sensor_name(name: &str) -> Option<Self> {
        if name.starts_with("PWRSYS") {
            Some(OccDomain::System)
        } else if name.starts_with("PWRGPU") {
            Some(OccDomain::Gpu)
        } else if name.starts_with("PWRPROC") {
            Some(OccDomain::ProcPkg)
        } else if name.starts_with("PWRVDD") {
            Some(OccDomain::ProcVdd)
        } else if name.starts_with("PWRVDN") {
            Some(OccDomain::ProcVdn)
        } else if name.starts_with("PWRMEM") {
            Some(OccDomain::Memory)
        } else {
            None
        }
    }

    /// Output column key, aligned with the RAPL naming where the domains
    /// correspond (vdd covers the cores, vdn the nest).
    pub fn json_key(&self) -> &'static str {
        match self {
            OccDomain::System => "sys",
            OccDomain::Gpu => "gpu",
            OccDomain::ProcPkg => "package",
            OccDomain::ProcVdd => "cores",
            OccDomain::ProcVdn => "uncore",
            OccDomain::Memory => "dram",
        }
    }
}

/// A power sensor selected from a chip block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct OccSensor {
    domain: OccDomain,
    scale: u32,
    /// Offset of the reading record relative to a reading buffer.
    reading_offset: u32,
}

/// Header and buffer offsets of one chip block.
#[derive(Clone, Copy, Debug)]
struct BlockLayout {
    nr_sensors: u16,
    ping_offset: u32,
    pong_offset: u32,
}

struct ChipEvent {
    /// Absolute offset of the chip's block in the export file.
    block_base: u64,
    layout: BlockLayout,
    sensor: OccSensor,
}

/// Energy reader over the OPAL inband sensor export.
pub struct OccReader {
    fd: File,
    event_map: [[i8; OCC_DOMAINS]; MAX_SOCKETS],
    events: Vec<ChipEvent>,
}

impl OccReader {
    pub fn new(domain_mask: u32, chip_mask: u32) -> Result<Self> {
        Self::with_export(domain_mask, chip_mask, Path::new(SENSORS_EXPORT))
    }

    fn with_export(domain_mask: u32, chip_mask: u32, export: &Path) -> Result<Self> {
        if chip_mask == 0 {
            return Err(Error::InvalidSocketMask);
        }
        if domain_mask == 0 {
            return Err(Error::InvalidLocationMask);
        }

        let fd = File::open(export).map_err(|_| Error::NoSockets)?;
        let len = fd
            .metadata()
            .map_err(|e| Error::system(export.display().to_string(), e))?
            .len() as usize;
        let chips = len / BLOCK_SIZE;
        if chips == 0 {
            return Err(Error::NoSockets);
        }
        if chips > MAX_SOCKETS {
            return Err(Error::TooManySockets);
        }
        info!("occ: found {} chips", chips);

        let mut reader = Self {
            fd,
            event_map: [[-1; OCC_DOMAINS]; MAX_SOCKETS],
            events: Vec::new(),
        };

        for chip in 0..chips {
            if chip_mask & (1 << chip) == 0 {
                continue;
            }
            let block_base = (chip * BLOCK_SIZE) as u64;
            let mut block = vec![0u8; BLOCK_SIZE];
            reader
                .fd
                .read_exact_at(&mut block, block_base)
                .map_err(|e| Error::system(export.display().to_string(), e))?;

            let (layout, sensors) = parse_chip_block(&block)?;
            for sensor in sensors {
                if domain_mask & (1 << sensor.domain.index()) == 0 {
                    continue;
                }
                if reader.event_map[chip][sensor.domain.index()] >= 0 {
                    continue;
                }
                debug!("occ: added chip {} sensor {:?}", chip, sensor.domain);
                reader.event_map[chip][sensor.domain.index()] = reader.events.len() as i8;
                reader.events.push(ChipEvent {
                    block_base,
                    layout,
                    sensor,
                });
            }
        }

        if reader.events.is_empty() {
            return Err(Error::NoEventsAdded);
        }
        Ok(reader)
    }

    pub fn event_idx(&self, chip: usize, domain: OccDomain) -> i8 {
        self.event_map[chip][domain.index()]
    }

    /// Decoded power of `(chip, domain)` in `sample`, with the sensor
    /// timestamp the OCC attached to the reading.
    pub fn power(&self, sample: &Sample, chip: usize, domain: OccDomain) -> Result<SensorValue> {
        let idx = self.event_map[chip][domain.index()];
        if idx < 0 {
            return Err(Error::NoSuchEvent);
        }
        let idx = idx as usize;
        Ok(SensorValue::power_at(
            Power::from_microwatts(sample.value(idx)),
            Timestamp::from_nanoseconds(sample.time(idx)),
        ))
    }
}

impl EnergyReader for OccReader {
    fn read_all(&self, sample: &mut Sample) -> Result<()> {
        for idx in 0..self.events.len() {
            self.read_one(sample, idx)?;
        }
        Ok(())
    }

    fn read_one(&self, sample: &mut Sample, idx: usize) -> Result<()> {
        let event = &self.events[idx];
        let read_record = |buffer_offset: u32| -> Result<[u8; 16]> {
            let mut rec = [0u8; 16];
            let off = event.block_base
                + buffer_offset as u64
                + event.sensor.reading_offset as u64;
            self.fd
                .read_exact_at(&mut rec, off)
                .map_err(|e| Error::system("error reading OCC sensor record", e))?;
            Ok(rec)
        };

        // the OCC flips between the two buffers; take the fresher reading
        let ping = decode_record(&read_record(event.layout.ping_offset)?);
        let pong = decode_record(&read_record(event.layout.pong_offset)?);
        let (timestamp, value) = if ping.0 >= pong.0 { ping } else { pong };
        if timestamp == 0 {
            return Err(Error::ReadingsNotValid);
        }

        sample.set_value(idx, value as u64 * event.sensor.scale as u64);
        sample.set_time(idx, timebase_to_ns(timestamp));
        Ok(())
    }

    fn num_events(&self) -> usize {
        self.events.len()
    }
}

fn timebase_to_ns(ticks: u64) -> u64 {
    // 512 MHz timebase; keep the division last for precision
    ticks.saturating_mul(1_000_000_000 / (TIMEBASE_HZ / 1_000_000)) / 1_000_000
}

/// Decodes a reading record: big-endian gsid (skipped), timebase timestamp
/// and the latest sample value.
fn decode_record(rec: &[u8; 16]) -> (u64, u16) {
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&rec[2..10]);
    let timestamp = u64::from_be_bytes(ts);
    let value = u16::from_be_bytes([rec[10], rec[11]]);
    (timestamp, value)
}

/// Parses one chip block: validates the header, walks the name records and
/// returns the power sensors with a recognized location.
fn parse_chip_block(block: &[u8]) -> Result<(BlockLayout, Vec<OccSensor>)> {
    if block.len() < HEADER_SIZE {
        return Err(Error::ReadingsNotValid);
    }
    let valid = block[0];
    let version = block[1];
    if valid == 0 {
        return Err(Error::ReadingsNotValid);
    }
    if version != SUPPORTED_VERSION {
        return Err(Error::FileFormatVersion);
    }

    let nr_sensors = u16::from_be_bytes([block[2], block[3]]);
    let names_offset = u32::from_be_bytes([block[8], block[9], block[10], block[11]]);
    let ping_offset = u32::from_be_bytes([block[12], block[13], block[14], block[15]]);
    let pong_offset = u32::from_be_bytes([block[16], block[17], block[18], block[19]]);

    let layout = BlockLayout {
        nr_sensors,
        ping_offset,
        pong_offset,
    };

    let mut sensors = Vec::new();
    for i in 0..nr_sensors as usize {
        let base = names_offset as usize + i * NAME_RECORD_SIZE;
        let Some(record) = block.get(base..base + NAME_RECORD_SIZE) else {
            return Err(Error::ReadingsNotValid);
        };

        let sensor_type = u16::from_be_bytes([record[30], record[31]]);
        if sensor_type != SENSOR_TYPE_POWER {
            continue;
        }
        let name_end = record[..16].iter().position(|&b| b == 0).unwrap_or(16);
        let Ok(name) = std::str::from_utf8(&record[..name_end]) else {
            continue;
        };
        let Some(domain) = OccDomain::from_sensor_name(name) else {
            continue;
        };
        let scale = u32::from_be_bytes([record[26], record[27], record[28], record[29]]);
        let reading_offset = u32::from_be_bytes([record[36], record[37], record[38], record[39]]);

        sensors.push(OccSensor {
            domain,
            scale,
            reading_offset,
        });
    }

    Ok((layout, sensors))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_name_record(
        block: &mut [u8],
        names_offset: usize,
        slot: usize,
        name: &str,
        sensor_type: u16,
        scale: u32,
        reading_offset: u32,
    ) {
        let base = names_offset + slot * NAME_RECORD_SIZE;
        block[base..base + name.len()].copy_from_slice(name.as_bytes());
        block[base + 26..base + 30].copy_from_slice(&scale.to_be_bytes());
        block[base + 30..base + 32].copy_from_slice(&sensor_type.to_be_bytes());
        block[base + 36..base + 40].copy_from_slice(&reading_offset.to_be_bytes());
    }

    fn header(block: &mut [u8], nr_sensors: u16, names: u32, ping: u32, pong: u32) {
        block[0] = 1;
        block[1] = SUPPORTED_VERSION;
        block[2..4].copy_from_slice(&nr_sensors.to_be_bytes());
        block[8..12].copy_from_slice(&names.to_be_bytes());
        block[12..16].copy_from_slice(&ping.to_be_bytes());
        block[16..20].copy_from_slice(&pong.to_be_bytes());
    }

    #[test]
    fn test_parse_block_selects_power_sensors() {
        let mut block = vec![0u8; 4096];
        header(&mut block, 3, 64, 1024, 2048);
        put_name_record(&mut block, 64, 0, "PWRSYS", SENSOR_TYPE_POWER, 1_000_000, 0);
        put_name_record(&mut block, 64, 1, "TEMPC01", 0x0008, 1, 16);
        put_name_record(&mut block, 64, 2, "PWRVDD", SENSOR_TYPE_POWER, 1_000_000, 32);

        let (layout, sensors) = parse_chip_block(&block).unwrap();
        assert_eq!(layout.nr_sensors, 3);
        assert_eq!(layout.ping_offset, 1024);
        assert_eq!(sensors.len(), 2);
        assert_eq!(sensors[0].domain, OccDomain::System);
        assert_eq!(sensors[1].domain, OccDomain::ProcVdd);
        assert_eq!(sensors[1].reading_offset, 32);
    }

    #[test]
    fn test_parse_block_rejects_bad_version() {
        let mut block = vec![0u8; 4096];
        header(&mut block, 0, 64, 1024, 2048);
        block[1] = 2;
        assert!(matches!(
            parse_chip_block(&block),
            Err(Error::FileFormatVersion)
        ));

        block[1] = SUPPORTED_VERSION;
        block[0] = 0;
        assert!(matches!(
            parse_chip_block(&block),
            Err(Error::ReadingsNotValid)
        ));
    }

    #[test]
    fn test_decode_record() {
        let mut rec = [0u8; 16];
        rec[2..10].copy_from_slice(&123_456u64.to_be_bytes());
        rec[10..12].copy_from_slice(&250u16.to_be_bytes());
        assert_eq!(decode_record(&rec), (123_456, 250));
    }

    #[test]
    fn test_timebase_conversion() {
        // 512 ticks = 1 microsecond
        assert_eq!(timebase_to_ns(512), 1_000);
        assert_eq!(timebase_to_ns(512_000_000), 1_000_000_000);
    }
}
