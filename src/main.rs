use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info, warn};

use wattprof::cli::Cli;
use wattprof::config::{load_config, ConfigData, Target};
use wattprof::dbg::ObjectInfo;
use wattprof::nrg::{CpuReader, EnergyReader, Error, GpuReader, HybridReader, Sample};
use wattprof::output::{IdleRecord, ProfilingResults, ReportWriter};
use wattprof::resolver::resolve_regions;
use wattprof::tracer::{evaluate_idle, load_bias, spawn_traced, Readers, Tracer};
use wattprof::paths;

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(&cli) {
        error!("{:#}", e);
        eprintln!("wattprof: {:#}", e);
        std::process::exit(1);
    }
}

/// Opens the sensor backends the configuration needs. A missing backend is
/// fatal only when a section targets it.
fn open_readers(config: &ConfigData) -> Result<Readers> {
    let needs_cpu = config.sections().any(|s| s.target == Target::Cpu);
    let needs_gpu = config.sections().any(|s| s.target == Target::Gpu);
    let params = config.parameters;

    let cpu = match CpuReader::probe(params.domain_mask, params.socket_mask) {
        Ok(reader) => Some(Arc::new(reader)),
        Err(e) if needs_cpu => {
            return Err(anyhow!(e).context("setting up the CPU energy reader"))
        }
        Err(e) => {
            info!("no CPU energy reader: {}", e);
            None
        }
    };

    let gpu = if needs_gpu {
        Some(Arc::new(
            GpuReader::new(params.device_mask).context("setting up the GPU power reader")?,
        ))
    } else {
        match GpuReader::new(params.device_mask) {
            Ok(reader) => Some(Arc::new(reader)),
            Err(Error::NoDevices) => None,
            Err(e) => {
                info!("no GPU power reader: {}", e);
                None
            }
        }
    };

    Ok(Readers { cpu, gpu })
}

fn collect_idle(readers: &Readers, sleep_for: Duration, results: &mut ProfilingResults) {
    let mut one = |target, reader: Arc<dyn EnergyReader>| {
        let samples = match evaluate_idle(reader, sleep_for) {
            Ok(samples) => samples,
            Err(failure) => {
                warn!("idle sampling failed: {}", failure.error);
                failure.partial
            }
        };
        if !samples.is_empty() {
            results.record_idle(IdleRecord { target, samples });
        }
    };

    if let Some(cpu) = &readers.cpu {
        one(Target::Cpu, cpu.clone() as Arc<dyn EnergyReader>);
    }
    if let Some(gpu) = &readers.gpu {
        one(Target::Gpu, gpu.clone() as Arc<dyn EnergyReader>);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = load_config(&cli.config)
        .map_err(|e| anyhow!("{}", e).context("loading configuration"))?;

    let executable = Path::new(&cli.command[0]);
    let object_info = ObjectInfo::load(executable)?;
    let regions = resolve_regions(&config, &object_info)?;
    let readers = open_readers(&config)?;

    // one probe read across every active backend before touching the tracee
    let hybrid = HybridReader::new(readers.cpu.clone(), readers.gpu.clone());
    let mut probe = Sample::new();
    hybrid
        .read_all(&mut probe)
        .map_err(|e| anyhow!("{} ({})", e, e.cause().as_str()).context("initial sensor read"))?;
    info!("sensors ready: {} active events", hybrid.num_events());

    let mut results = ProfilingResults::from_config(&config);
    for region in &regions {
        let section = results.section_mut(region.group, region.section);
        section.start_label = region.start_label.clone();
        section.end_label = region.end_label.clone();
    }

    let tracee = spawn_traced(&cli.command)?;
    let bias = if object_info.pie {
        load_bias(tracee, executable)?
    } else {
        0
    };
    info!("tracing {} (pid {}, load bias {:#x})", executable.display(), tracee, bias);

    if !cli.no_idle {
        info!("collecting idle baseline for {} s", cli.idle_duration);
        collect_idle(
            &readers,
            Duration::from_secs(cli.idle_duration),
            &mut results,
        );
    }

    let mut tracer = Tracer::new(regions, readers.clone(), tracee, bias);
    match tracer.run(&mut results) {
        Ok(code) if code != 0 => warn!("target exited with status {}", code),
        Ok(_) => {}
        // partial results are still written below
        Err(e) => error!("trace aborted: {:#}", e),
    }

    let path = match &cli.output {
        Some(path) => path.clone(),
        None => paths::unique_report_path(None::<&Path>)
            .context("could not build an output file name")?,
    };
    let file =
        File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    let writer = ReportWriter {
        cpu: readers.cpu,
        gpu: readers.gpu,
    };
    writer.write_to(&results, BufWriter::new(file))?;
    info!("results saved in {}", path.display());
    Ok(())
}
