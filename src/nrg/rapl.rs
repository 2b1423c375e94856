//! Intel RAPL energy reader.
//!
//! Counters come from the powercap sysfs tree. Every selected domain keeps
//! its `energy_uj` file open for the lifetime of the reader; reads re-read
//! the descriptor at offset zero. RAPL counters are unsigned accumulators
//! that wrap at `max_energy_range_uj`, so each event slot tracks the
//! previous raw value and the accumulated wrap offset.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use log::{debug, info};

use super::error::{Error, Result};
use super::sample::Sample;
use super::units::{Energy, SensorValue};
use super::{EnergyReader, MAX_SOCKETS, RAPL_DOMAINS};

const POWERCAP_ROOT: &str = "/sys/class/powercap/intel-rapl";
const TOPOLOGY_ROOT: &str = "/sys/devices/system/cpu";

/// One RAPL domain of a socket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RaplDomain {
    Package,
    Cores,
    Uncore,
    Dram,
}

impl RaplDomain {
    pub const ALL: [RaplDomain; RAPL_DOMAINS] = [
        RaplDomain::Package,
        RaplDomain::Cores,
        RaplDomain::Uncore,
        RaplDomain::Dram,
    ];

    fn index(&self) -> usize {
        match self {
            RaplDomain::Package => 0,
            RaplDomain::Cores => 1,
            RaplDomain::Uncore => 2,
            RaplDomain::Dram => 3,
        }
    }

    /// Maps a powercap `name` file content by prefix. `core` covers the
    /// kernel's pp0 naming, `uncore` pp1.
    fn from_name(name: &str) -> Option<Self> {
        if name.starts_with("package") {
            Some(RaplDomain::Package)
        } else if name.starts_with("core") {
            Some(RaplDomain::Cores)
        } else if name.starts_with("uncore") {
            Some(RaplDomain::Uncore)
        } else if name.starts_with("dram") {
            Some(RaplDomain::Dram)
        } else {
            None
        }
    }

    pub fn json_key(&self) -> &'static str {
        match self {
            RaplDomain::Package => "package",
            RaplDomain::Cores => "cores",
            RaplDomain::Uncore => "uncore",
            RaplDomain::Dram => "dram",
        }
    }
}

/// Wraparound accumulation state of one event slot.
#[derive(Debug, Default)]
struct WrapState {
    prev: u64,
    accumulated: u64,
}

impl WrapState {
    /// Folds a new raw reading into the accumulated offset and returns the
    /// decoded energy value. A raw value lower than the previous one means
    /// the counter wrapped at `max`.
    fn accumulate(&mut self, raw: u64, max: u64) -> u64 {
        if raw < self.prev {
            debug!("rapl: detected wraparound");
            self.accumulated += max;
        }
        self.prev = raw;
        raw + self.accumulated
    }
}

struct EventData {
    fd: File,
    max: u64,
    wrap: Mutex<WrapState>,
}

/// Energy reader over the RAPL powercap interface.
pub struct RaplReader {
    event_map: [[i8; RAPL_DOMAINS]; MAX_SOCKETS],
    events: Vec<EventData>,
}

impl RaplReader {
    /// Sets up a reader for the domains and sockets selected by the masks.
    pub fn new(domain_mask: u32, socket_mask: u32) -> Result<Self> {
        Self::with_root(domain_mask, socket_mask, Path::new(POWERCAP_ROOT), Path::new(TOPOLOGY_ROOT))
    }

    pub(crate) fn with_root(
        domain_mask: u32,
        socket_mask: u32,
        powercap: &Path,
        topology: &Path,
    ) -> Result<Self> {
        if socket_mask == 0 {
            return Err(Error::InvalidSocketMask);
        }
        if domain_mask == 0 {
            return Err(Error::InvalidLocationMask);
        }
        // no powercap tree means no RAPL on this machine
        if !powercap.exists() {
            return Err(Error::NoSockets);
        }

        let mut reader = Self {
            event_map: [[-1; RAPL_DOMAINS]; MAX_SOCKETS],
            events: Vec::new(),
        };

        let sockets = count_sockets(topology)?;
        info!("rapl: found {} sockets", sockets);

        for skt in 0..sockets {
            if socket_mask & (1 << skt) == 0 {
                continue;
            }
            debug!("rapl: registered socket {}", skt);

            let base = powercap.join(format!("intel-rapl:{}", skt));
            reader.add_event(&base, domain_mask, skt)?;
            // the socket node itself is one domain; walk its children
            for sub in 0..RAPL_DOMAINS - 1 {
                let child = base.join(format!("intel-rapl:{}:{}", skt, sub));
                if child.exists() {
                    reader.add_event(&child, domain_mask, skt)?;
                }
            }
        }

        if reader.events.is_empty() {
            return Err(Error::NoEventsAdded);
        }
        Ok(reader)
    }

    fn add_event(&mut self, base: &Path, domain_mask: u32, skt: usize) -> Result<()> {
        let name = read_trimmed(&base.join("name"))?;
        let domain = RaplDomain::from_name(&name)
            .ok_or_else(|| Error::InvalidDomainName(name.clone()))?;
        if domain_mask & (1 << domain.index()) == 0 {
            return Ok(());
        }

        let max = read_u64_file(&base.join("max_energy_range_uj"))?;
        let counter = base.join("energy_uj");
        let fd = File::open(&counter)
            .map_err(|e| Error::system(counter.display().to_string(), e))?;

        debug!("rapl: added event {}", base.display());
        self.event_map[skt][domain.index()] = self.events.len() as i8;
        self.events.push(EventData {
            fd,
            max,
            wrap: Mutex::new(WrapState::default()),
        });
        Ok(())
    }

    /// Slot index of `(socket, domain)`, or -1 when inactive.
    pub fn event_idx(&self, skt: usize, domain: RaplDomain) -> i8 {
        self.event_map[skt][domain.index()]
    }

    /// Decoded energy of `(socket, domain)` in `sample`.
    pub fn energy(&self, sample: &Sample, skt: usize, domain: RaplDomain) -> Result<Energy> {
        let idx = self.event_map[skt][domain.index()];
        if idx < 0 {
            return Err(Error::NoSuchEvent);
        }
        Ok(Energy::from_microjoules(sample.value(idx as usize)))
    }

    /// Accessor used by the output writer: no sensor-side timestamp on RAPL.
    pub fn value(&self, sample: &Sample, skt: usize, domain: RaplDomain) -> Result<SensorValue> {
        self.energy(sample, skt, domain).map(SensorValue::energy)
    }
}

impl EnergyReader for RaplReader {
    fn read_all(&self, sample: &mut Sample) -> Result<()> {
        for idx in 0..self.events.len() {
            self.read_one(sample, idx)?;
        }
        Ok(())
    }

    fn read_one(&self, sample: &mut Sample, idx: usize) -> Result<()> {
        let event = &self.events[idx];
        let raw = read_u64_at(&event.fd)
            .map_err(|e| Error::system("error reading counters", e))?;
        let mut wrap = self.events[idx].wrap.lock().expect("wrap state poisoned");
        sample.set_value(idx, wrap.accumulate(raw, event.max));
        Ok(())
    }

    fn num_events(&self) -> usize {
        self.events.len()
    }
}

/// Counts distinct physical packages by scanning per-CPU topology nodes
/// until one is missing.
fn count_sockets(topology: &Path) -> Result<usize> {
    let mut found = [false; MAX_SOCKETS];
    let mut count = 0;
    for cpu in 0.. {
        let path = topology.join(format!("cpu{}/topology/physical_package_id", cpu));
        if !path.exists() {
            break;
        }
        let pkg = read_u64_file(&path)? as usize;
        if pkg >= MAX_SOCKETS {
            return Err(Error::TooManySockets);
        }
        if !found[pkg] {
            found[pkg] = true;
            count += 1;
        }
    }
    if count == 0 {
        return Err(Error::NoSockets);
    }
    Ok(count)
}

fn read_trimmed(path: &Path) -> Result<String> {
    let mut buf = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut buf))
        .map_err(|e| Error::system(path.display().to_string(), e))?;
    Ok(buf.trim().to_string())
}

fn read_u64_file(path: &Path) -> Result<u64> {
    let text = read_trimmed(path)?;
    text.parse().map_err(|_| {
        Error::system(
            path.display().to_string(),
            io::Error::new(io::ErrorKind::InvalidData, "not an integer"),
        )
    })
}

/// Re-reads an already open counter file from offset zero.
fn read_u64_at(fd: &File) -> io::Result<u64> {
    let mut buf = [0u8; 24];
    let n = fd.read_at(&mut buf, 0)?;
    let text = std::str::from_utf8(&buf[..n])
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 counter"))?;
    text.trim()
        .parse()
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "not an integer"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraparound_decoding() {
        // max = 100: [90, 95, 20, 30] decodes to [90, 95, 120, 130]
        let mut wrap = WrapState::default();
        let decoded: Vec<u64> = [90, 95, 20, 30]
            .iter()
            .map(|&raw| wrap.accumulate(raw, 100))
            .collect();
        assert_eq!(decoded, vec![90, 95, 120, 130]);
    }

    #[test]
    fn test_wraparound_is_non_decreasing() {
        // synthetic monotonic counter wrapping at 1000
        let mut wrap = WrapState::default();
        let mut counter = 0u64;
        let mut prev_decoded = 0u64;
        for step in [100, 450, 500, 999, 3, 1000, 2500] {
            counter += step;
            let decoded = wrap.accumulate(counter % 1000, 1000);
            assert!(decoded >= prev_decoded);
            prev_decoded = decoded;
        }
    }

    #[test]
    fn test_domain_names() {
        assert_eq!(RaplDomain::from_name("package-0"), Some(RaplDomain::Package));
        assert_eq!(RaplDomain::from_name("core"), Some(RaplDomain::Cores));
        assert_eq!(RaplDomain::from_name("uncore"), Some(RaplDomain::Uncore));
        assert_eq!(RaplDomain::from_name("dram"), Some(RaplDomain::Dram));
        assert_eq!(RaplDomain::from_name("psys"), None);
    }

    #[test]
    fn test_masks_validated() {
        assert!(matches!(
            RaplReader::new(!0, 0),
            Err(Error::InvalidSocketMask)
        ));
        assert!(matches!(
            RaplReader::new(0, !0),
            Err(Error::InvalidLocationMask)
        ));
    }

    #[test]
    fn test_synthetic_powercap_tree() {
        use std::fs;

        let root = std::env::temp_dir().join(format!("wattprof-rapl-{}", std::process::id()));
        let powercap = root.join("powercap");
        let topology = root.join("cpus");

        for cpu in 0..2 {
            let dir = topology.join(format!("cpu{}/topology", cpu));
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("physical_package_id"), "0\n").unwrap();
        }

        let skt = powercap.join("intel-rapl:0");
        fs::create_dir_all(&skt).unwrap();
        fs::write(skt.join("name"), "package-0\n").unwrap();
        fs::write(skt.join("max_energy_range_uj"), "262143328850\n").unwrap();
        fs::write(skt.join("energy_uj"), "123456\n").unwrap();

        let sub = skt.join("intel-rapl:0:0");
        fs::create_dir_all(&sub).unwrap();
        fs::write(sub.join("name"), "dram\n").unwrap();
        fs::write(sub.join("max_energy_range_uj"), "65712999613\n").unwrap();
        fs::write(sub.join("energy_uj"), "7890\n").unwrap();

        let reader = RaplReader::with_root(!0, !0, &powercap, &topology).unwrap();
        assert_eq!(reader.num_events(), 2);
        assert_eq!(reader.event_idx(0, RaplDomain::Package), 0);
        assert_eq!(reader.event_idx(0, RaplDomain::Dram), 1);
        assert_eq!(reader.event_idx(0, RaplDomain::Cores), -1);
        assert_eq!(reader.event_idx(1, RaplDomain::Package), -1);

        let mut sample = Sample::new();
        reader.read_all(&mut sample).unwrap();
        assert_eq!(
            reader.energy(&sample, 0, RaplDomain::Package).unwrap(),
            Energy::from_microjoules(123456)
        );
        assert_eq!(
            reader.energy(&sample, 0, RaplDomain::Dram).unwrap(),
            Energy::from_microjoules(7890)
        );
        assert!(matches!(
            reader.energy(&sample, 0, RaplDomain::Cores),
            Err(Error::NoSuchEvent)
        ));

        // domain mask selects dram only
        let reader = RaplReader::with_root(0b1000, !0, &powercap, &topology).unwrap();
        assert_eq!(reader.num_events(), 1);
        assert_eq!(reader.event_idx(0, RaplDomain::Dram), 0);
        assert_eq!(reader.event_idx(0, RaplDomain::Package), -1);

        fs::remove_dir_all(&root).unwrap();
    }
}
