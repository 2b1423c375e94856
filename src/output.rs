//! Profiling results and the JSON report writer.
//!
//! The result tree is append-only while the trace runs and written out once
//! at the end; handing it to the writer by shared reference after the
//! tracer is done is the freeze point, no further mutation happens.

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::config::{ConfigData, Target};
use crate::nrg::{
    CpuReader, GpuReader, OccReader, RaplReader, TimedExecution, Timestamp, MAX_DEVICES,
    MAX_SOCKETS,
};
use crate::nrg::occ::OccDomain;
use crate::nrg::rapl::RaplDomain;
use crate::nrg::units::Reading;

/// One completed execution of a region.
pub struct ExecutionRecord {
    pub start: Timestamp,
    pub end: Timestamp,
    pub samples: TimedExecution,
}

/// All executions of one configured section.
pub struct SectionResult {
    pub label: Option<String>,
    pub extra: Option<String>,
    pub target: Target,
    pub start_label: String,
    pub end_label: String,
    pub executions: Vec<ExecutionRecord>,
}

/// One `<sections>` block of the configuration.
pub struct GroupResult {
    pub label: Option<String>,
    pub extra: Option<String>,
    pub sections: Vec<SectionResult>,
}

/// Baseline samples taken with the tracee stopped.
pub struct IdleRecord {
    pub target: Target,
    pub samples: TimedExecution,
}

/// The full result tree, mirroring the configuration's group structure.
#[derive(Default)]
pub struct ProfilingResults {
    pub idle: Vec<IdleRecord>,
    pub groups: Vec<GroupResult>,
}

impl ProfilingResults {
    /// Builds the (empty) skeleton for every configured section, so that
    /// recording only ever appends to existing leaves.
    pub fn from_config(config: &ConfigData) -> Self {
        Self {
            idle: Vec::new(),
            groups: config
                .groups
                .iter()
                .map(|group| GroupResult {
                    label: group.label.clone(),
                    extra: group.extra.clone(),
                    sections: group
                        .sections
                        .iter()
                        .map(|section| SectionResult {
                            label: section.name.clone(),
                            extra: section.extra.clone(),
                            target: section.target,
                            start_label: String::new(),
                            end_label: String::new(),
                            executions: Vec::new(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }

    pub fn record_idle(&mut self, record: IdleRecord) {
        self.idle.push(record);
    }

    pub fn record_execution(&mut self, group: usize, section: usize, record: ExecutionRecord) {
        self.groups[group].sections[section].executions.push(record);
    }

    pub fn section_mut(&mut self, group: usize, section: usize) -> &mut SectionResult {
        &mut self.groups[group].sections[section]
    }
}

#[derive(Serialize)]
struct UnitsBlock {
    time: &'static str,
    energy: &'static str,
    power: &'static str,
}

impl Default for UnitsBlock {
    fn default() -> Self {
        Self {
            time: "ns",
            energy: "J",
            power: "W",
        }
    }
}

#[derive(Serialize)]
struct RangeBlock<'a> {
    start: &'a str,
    end: &'a str,
}

/// Serializes a frozen result tree into the report document.
pub struct ReportWriter {
    pub cpu: Option<Arc<CpuReader>>,
    pub gpu: Option<Arc<GpuReader>>,
}

impl ReportWriter {
    pub fn write_to(&self, results: &ProfilingResults, writer: impl Write) -> Result<()> {
        serde_json::to_writer_pretty(writer, &self.document(results))
            .context("writing JSON report")
    }

    /// Builds the whole report document.
    pub fn document(&self, results: &ProfilingResults) -> Value {
        json!({
            "units": UnitsBlock::default(),
            "format": self.format(),
            "idle": results.idle.iter().map(|i| self.idle_entry(i)).collect::<Vec<_>>(),
            "groups": results.groups.iter().map(|g| self.group(g)).collect::<Vec<_>>(),
        })
    }

    /// Column names depend on the backend that produced the series: OCC
    /// readings carry a sensor timestamp, RAPL readings do not.
    fn format(&self) -> Value {
        let cpu = match self.cpu.as_deref() {
            Some(CpuReader::Rapl(_)) => json!(["sample_time", "energy"]),
            Some(CpuReader::Occ(_)) => json!(["sample_time", "sensor_time", "power"]),
            None => json!([]),
        };
        let gpu = match self.gpu {
            Some(_) => json!(["sample_time", "power"]),
            None => json!([]),
        };
        json!({ "cpu": cpu, "gpu": gpu })
    }

    fn idle_entry(&self, idle: &IdleRecord) -> Value {
        let mut entry = Map::new();
        match idle.target {
            Target::Cpu => {
                if let Some(cpu) = self.cpu.as_deref() {
                    entry.insert("cpu".into(), cpu_series(cpu, &idle.samples));
                }
            }
            Target::Gpu => {
                if let Some(gpu) = self.gpu.as_deref() {
                    entry.insert("gpu".into(), gpu_series(gpu, &idle.samples));
                }
            }
        }
        Value::Object(entry)
    }

    fn group(&self, group: &GroupResult) -> Value {
        json!({
            "label": group.label,
            "extra": group.extra,
            "sections": group.sections.iter().map(|s| self.section(s)).collect::<Vec<_>>(),
        })
    }

    fn section(&self, section: &SectionResult) -> Value {
        let executions: Vec<Value> = section
            .executions
            .iter()
            .map(|exec| {
                let mut entry = Map::new();
                entry.insert(
                    "range".into(),
                    json!(RangeBlock {
                        start: &section.start_label,
                        end: &section.end_label,
                    }),
                );
                match section.target {
                    Target::Cpu => {
                        if let Some(cpu) = self.cpu.as_deref() {
                            entry.insert("cpu".into(), cpu_series(cpu, &exec.samples));
                        }
                    }
                    Target::Gpu => {
                        if let Some(gpu) = self.gpu.as_deref() {
                            entry.insert("gpu".into(), gpu_series(gpu, &exec.samples));
                        }
                    }
                }
                Value::Object(entry)
            })
            .collect();

        json!({
            "label": section.label,
            "extra": section.extra,
            "executions": executions,
        })
    }
}

fn cpu_series(reader: &CpuReader, samples: &TimedExecution) -> Value {
    match reader {
        CpuReader::Rapl(rapl) => rapl_series(rapl, samples),
        CpuReader::Occ(occ) => occ_series(occ, samples),
    }
}

fn rapl_series(reader: &RaplReader, samples: &TimedExecution) -> Value {
    let mut sockets = Vec::new();
    for skt in 0..MAX_SOCKETS {
        let mut entry = Map::new();
        entry.insert("socket".into(), json!(skt));
        let mut any = false;
        for domain in RaplDomain::ALL {
            if reader.event_idx(skt, domain) < 0 {
                continue;
            }
            let series: Vec<Value> = samples
                .iter()
                .filter_map(|ts| {
                    let energy = reader.energy(&ts.sample, skt, domain).ok()?;
                    Some(json!([ts.timestamp.nanoseconds(), energy.joules()]))
                })
                .collect();
            any = true;
            entry.insert(domain.json_key().into(), Value::Array(series));
        }
        if any {
            sockets.push(Value::Object(entry));
        }
    }
    Value::Array(sockets)
}

fn occ_series(reader: &OccReader, samples: &TimedExecution) -> Value {
    let mut chips = Vec::new();
    for chip in 0..MAX_SOCKETS {
        let mut entry = Map::new();
        entry.insert("socket".into(), json!(chip));
        let mut any = false;
        for domain in OccDomain::ALL {
            if reader.event_idx(chip, domain) < 0 {
                continue;
            }
            let series: Vec<Value> = samples
                .iter()
                .filter_map(|ts| {
                    let value = reader.power(&ts.sample, chip, domain).ok()?;
                    let Reading::Power(power) = value.reading else {
                        return None;
                    };
                    let sensor_time = value.timestamp.map_or(0, |t| t.nanoseconds());
                    Some(json!([
                        ts.timestamp.nanoseconds(),
                        sensor_time,
                        power.watts()
                    ]))
                })
                .collect();
            any = true;
            entry.insert(domain.json_key().into(), Value::Array(series));
        }
        if any {
            chips.push(Value::Object(entry));
        }
    }
    Value::Array(chips)
}

fn gpu_series(reader: &GpuReader, samples: &TimedExecution) -> Value {
    let mut devices = Vec::new();
    for dev in 0..MAX_DEVICES {
        if reader.event_idx(dev) < 0 {
            continue;
        }
        let series: Vec<Value> = samples
            .iter()
            .filter_map(|ts| {
                let power = reader.board_power(&ts.sample, dev).ok()?;
                Some(json!([ts.timestamp.nanoseconds(), power.watts()]))
            })
            .collect();
        if series.is_empty() {
            continue;
        }
        devices.push(json!({ "device": dev, "board": series }));
    }
    Value::Array(devices)
}
