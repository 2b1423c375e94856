//! Region resolution.
//!
//! Turns configured sections into breakpoint addresses plus the sampler to
//! run per execution. Everything resolves up front: a position that does
//! not resolve fails the whole run before the tracee is ever resumed.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use log::debug;

use crate::config::{Bounds, ConfigData, ProfilingMethod, Section, Target};
use crate::dbg::query::{
    find_compilation_unit, find_function, find_lines, function_return_sites,
    lowest_address_line,
};
use crate::dbg::{CompilationUnit, ObjectInfo, QueryError};
use crate::sampler::SamplerSpec;

/// A section resolved against the target's debug info.
#[derive(Clone, Debug)]
pub struct ResolvedRegion {
    pub id: usize,
    /// Index of the configured group this region belongs to.
    pub group: usize,
    /// Index of the section within its group.
    pub section: usize,
    pub entry_addr: u64,
    /// A line-bounded region has one exit; a function-bounded region has
    /// one per return site.
    pub exit_addrs: Vec<u64>,
    pub sampler: SamplerSpec,
    pub target: Target,
    /// 0 means unbounded.
    pub executions: u32,
    /// Human-readable bound positions for the report.
    pub start_label: String,
    pub end_label: String,
}

fn query_context(what: &str, err: QueryError) -> anyhow::Error {
    anyhow!("{}: {} ({:?})", what, err, err.cause())
}

/// Picks the sampler factory for a section.
fn sampler_spec(section: &Section) -> SamplerSpec {
    match section.method {
        ProfilingMethod::EnergyTotal => SamplerSpec::Short,
        ProfilingMethod::EnergyProfile if section.samples > 0 => SamplerSpec::BoundedPeriodic {
            period: section.interval,
            samples: section.samples as usize,
        },
        ProfilingMethod::EnergyProfile => SamplerSpec::UnboundedPeriodic {
            period: section.interval,
        },
    }
}

/// Resolves a position to the first instruction address of its statement.
fn resolve_position(oi: &ObjectInfo, cu_path: &str, line: u32) -> Result<u64> {
    let what = format!("{}:{}", cu_path, line);
    let cu = find_compilation_unit(oi, Path::new(cu_path))
        .map_err(|e| query_context(&what, e))?;
    let rows = find_lines(cu, None, line, false, 0, false)
        .map_err(|e| query_context(&what, e))?;
    let row = lowest_address_line(rows, true).map_err(|e| query_context(&what, e))?;
    Ok(row.address)
}

fn resolve_function(
    oi: &ObjectInfo,
    cu_name: Option<&str>,
    name: &str,
) -> Result<(u64, Vec<u64>)> {
    let unit: Option<&CompilationUnit> = match cu_name {
        Some(cu) => Some(
            find_compilation_unit(oi, Path::new(cu)).map_err(|e| query_context(cu, e))?,
        ),
        None => None,
    };
    let (func, _symbol) =
        find_function(oi, unit, name, false).map_err(|e| query_context(name, e))?;
    let entry = func
        .low_pc()
        .ok_or_else(|| anyhow!("{}: function has no addresses", name))?;

    let unit = match unit {
        Some(unit) => unit,
        None => oi
            .compilation_units
            .iter()
            .find(|cu| cu.contains(entry))
            .ok_or_else(|| query_context(name, QueryError::CuNotFound))?,
    };
    let exits =
        function_return_sites(unit, func).map_err(|e| query_context(name, e))?;
    Ok((entry, exits))
}

/// Resolves every configured section. Any failure aborts the run during
/// startup, never mid-trace.
pub fn resolve_regions(config: &ConfigData, oi: &ObjectInfo) -> Result<Vec<ResolvedRegion>> {
    let mut regions = Vec::new();
    for (group_idx, group) in config.groups.iter().enumerate() {
        for (section_idx, section) in group.sections.iter().enumerate() {
            let id = regions.len();
            let (entry_addr, exit_addrs, start_label, end_label) = match &section.bounds {
                Bounds::Positions { start, end } => {
                    let entry = resolve_position(oi, &start.compilation_unit, start.line)
                        .context("resolving region start")?;
                    let exit = resolve_position(oi, &end.compilation_unit, end.line)
                        .context("resolving region end")?;
                    (entry, vec![exit], start.to_string(), end.to_string())
                }
                Bounds::Function { cu, name } => {
                    let (entry, exits) = resolve_function(oi, cu.as_deref(), name)
                        .context("resolving region function")?;
                    let label = match cu {
                        Some(cu) => format!("{}:{}", cu, name),
                        None => name.clone(),
                    };
                    (entry, exits, label.clone(), label)
                }
            };

            debug!(
                "region {}: entry {:#x}, exits {:x?}",
                id, entry_addr, exit_addrs
            );
            regions.push(ResolvedRegion {
                id,
                group: group_idx,
                section: section_idx,
                entry_addr,
                exit_addrs,
                sampler: sampler_spec(section),
                target: section.target,
                executions: section.executions,
                start_label,
                end_label,
            });
        }
    }
    Ok(regions)
}
