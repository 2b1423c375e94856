//! The execution control loop.
//!
//! A single thread drives the tracee: it blocks in `waitpid`, classifies
//! each stop, and brackets configured regions with breakpoints. Entering a
//! region starts that region's sampler; the matching exit awaits it and
//! records the execution. All ptrace requests are issued from this thread.
//!
//! Region entries may nest (recursion, or a function region inside a line
//! region): every entry pushes a frame with its own running sampler, every
//! exit pops the innermost frame of its region.

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::personality::{self, Persona};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use nom::bytes::complete::{tag, take_while1};
use nom::character::complete::{digit1, hex_digit1, space1};
use nom::IResult;

use crate::config::Target;
use crate::nrg::{CpuReader, EnergyReader, GpuReader, Timestamp};
use crate::output::{ExecutionRecord, ProfilingResults};
use crate::resolver::ResolvedRegion;
use crate::sampler::{RunningSampler, SamplerResult, SamplerSpec};
use crate::trap::{self, Breakpoint, TrapContext};

/// Cadence of the idle baseline sampler.
pub const IDLE_PERIOD: Duration = Duration::from_secs(1);

/// The active readers, shared immutably for the whole run.
#[derive(Clone, Default)]
pub struct Readers {
    pub cpu: Option<Arc<CpuReader>>,
    pub gpu: Option<Arc<GpuReader>>,
}

impl Readers {
    pub fn for_target(&self, target: Target) -> Option<Arc<dyn EnergyReader>> {
        match target {
            Target::Cpu => self.cpu.clone().map(|r| r as Arc<dyn EnergyReader>),
            Target::Gpu => self.gpu.clone().map(|r| r as Arc<dyn EnergyReader>),
        }
    }
}

/// Nesting stack of active region executions of one traced task.
///
/// Entries push, exits pop the innermost frame of their region; region ids
/// may interleave arbitrarily as long as each exit matches an open entry.
pub struct RegionStack<T> {
    frames: Vec<(usize, T)>,
}

impl<T> Default for RegionStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RegionStack<T> {
    pub fn new() -> Self {
        Self { frames: Vec::new() }
    }

    pub fn push(&mut self, region: usize, payload: T) {
        self.frames.push((region, payload));
    }

    /// Pops the innermost open frame of `region`, if any.
    pub fn pop(&mut self, region: usize) -> Option<T> {
        let idx = self.frames.iter().rposition(|(r, _)| *r == region)?;
        Some(self.frames.remove(idx).1)
    }

    pub fn depth(&self, region: usize) -> usize {
        self.frames.iter().filter(|(r, _)| *r == region).count()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Pops every open frame, innermost first.
    pub fn drain(&mut self) -> Vec<(usize, T)> {
        let mut frames = std::mem::take(&mut self.frames);
        frames.reverse();
        frames
    }
}

/// Spawns the target command stopped under ptrace, with ASLR disabled so
/// resolved addresses are stable.
pub fn spawn_traced(argv: &[String]) -> Result<Pid> {
    let (program, args) = argv.split_first().context("empty command")?;
    let mut command = Command::new(program);
    command.args(args);
    unsafe {
        command.pre_exec(|| {
            ptrace::traceme().map_err(to_io)?;
            let persona = personality::get().map_err(to_io)?;
            personality::set(persona | Persona::ADDR_NO_RANDOMIZE).map_err(to_io)?;
            Ok(())
        });
    }
    let child = command
        .spawn()
        .with_context(|| format!("launching {}", program))?;
    let pid = Pid::from_raw(child.id() as i32);

    // the tracee stops with SIGTRAP on exec
    match waitpid(pid, None).context("waiting for tracee to stop")? {
        WaitStatus::Stopped(_, Signal::SIGTRAP) => Ok(pid),
        status => bail!("tracee did not stop at exec: {:?}", status),
    }
}

fn to_io(e: Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

#[derive(Debug, PartialEq, Eq)]
struct MapsEntry {
    start: u64,
    offset: u64,
    path: Option<String>,
}

/// Parses one `/proc/<pid>/maps` line.
fn parse_maps_line(line: &str) -> IResult<&str, MapsEntry> {
    let (i, start) = hex_digit1(line)?;
    let (i, _) = tag("-")(i)?;
    let (i, _end) = hex_digit1(i)?;
    let (i, _) = space1(i)?;
    let (i, _perms) = take_while1(|c| "rwxps-".contains(c))(i)?;
    let (i, _) = space1(i)?;
    let (i, offset) = hex_digit1(i)?;
    let (i, _) = space1(i)?;
    let (i, _dev) = take_while1(|c: char| c.is_ascii_hexdigit() || c == ':')(i)?;
    let (i, _) = space1(i)?;
    let (i, _inode) = digit1(i)?;

    let path = i.trim();
    Ok((
        "",
        MapsEntry {
            start: u64::from_str_radix(start, 16).unwrap_or(0),
            offset: u64::from_str_radix(offset, 16).unwrap_or(0),
            path: (!path.is_empty()).then(|| path.to_string()),
        },
    ))
}

/// Finds the executable's lowest file mapping in the maps text.
fn find_exe_base(maps: &str, exe: &Path) -> Option<u64> {
    let name = exe.file_name()?.to_str()?;
    maps.lines()
        .filter_map(|line| parse_maps_line(line).ok().map(|(_, e)| e))
        .filter(|entry| {
            entry.offset == 0
                && entry
                    .path
                    .as_deref()
                    .is_some_and(|p| Path::new(p).file_name().and_then(|f| f.to_str()) == Some(name))
        })
        .map(|entry| entry.start)
        .min()
}

/// Runtime load base of the (position independent) executable.
pub fn load_bias(pid: Pid, exe: &Path) -> Result<u64> {
    let maps = std::fs::read_to_string(format!("/proc/{}/maps", pid))
        .context("reading tracee maps")?;
    find_exe_base(&maps, exe)
        .with_context(|| format!("no mapping of {} in tracee", exe.display()))
}

struct RegionRuntime {
    info: ResolvedRegion,
    /// None for unbounded sections.
    remaining: Option<u32>,
    entry: Option<Breakpoint>,
    /// Installed while the region has open executions.
    exits: Vec<Breakpoint>,
}

struct ActiveExecution {
    sampler: RunningSampler,
    start: Timestamp,
}

/// The wait-for-trap state machine.
pub struct Tracer {
    regions: Vec<RegionRuntime>,
    readers: Readers,
    tracee: Pid,
    bias: u64,
    stacks: HashMap<Pid, RegionStack<ActiveExecution>>,
    /// Children announced by a clone/fork/vfork event but not yet seen
    /// stopping; their first SIGSTOP is swallowed.
    pending_tasks: HashSet<Pid>,
    children: HashSet<Pid>,
}

impl Tracer {
    pub fn new(regions: Vec<ResolvedRegion>, readers: Readers, tracee: Pid, bias: u64) -> Self {
        Self {
            regions: regions
                .into_iter()
                .map(|info| RegionRuntime {
                    remaining: (info.executions > 0).then_some(info.executions),
                    info,
                    entry: None,
                    exits: Vec::new(),
                })
                .collect(),
            readers,
            tracee,
            bias,
            stacks: HashMap::new(),
            pending_tasks: HashSet::new(),
            children: HashSet::new(),
        }
    }

    /// Drives the tracee to completion, recording executions into
    /// `results`. Results accumulated before a fatal ptrace failure remain
    /// recorded.
    pub fn run(&mut self, results: &mut ProfilingResults) -> Result<i32> {
        ptrace::setoptions(
            self.tracee,
            ptrace::Options::PTRACE_O_EXITKILL
                | ptrace::Options::PTRACE_O_TRACECLONE
                | ptrace::Options::PTRACE_O_TRACEFORK
                | ptrace::Options::PTRACE_O_TRACEVFORK,
        )
        .context("PTRACE_SETOPTIONS")?;

        for region in &mut self.regions {
            let addr = region.info.entry_addr + self.bias;
            region.entry = Some(
                Breakpoint::install(self.tracee, addr)
                    .with_context(|| format!("installing entry breakpoint at {:#x}", addr))?,
            );
            debug!("region {}: entry breakpoint at {:#x}", region.info.id, addr);
        }

        ptrace::cont(self.tracee, None).context("resuming tracee")?;
        let code = loop {
            let status = match waitpid(None, None) {
                Ok(status) => status,
                Err(Errno::ECHILD) => break 0,
                Err(e) => return Err(e).context("wait"),
            };
            match status {
                WaitStatus::Stopped(pid, Signal::SIGTRAP) => {
                    self.handle_trap(pid, results)?;
                }
                WaitStatus::Stopped(pid, Signal::SIGSTOP)
                    if self.pending_tasks.remove(&pid) =>
                {
                    // birth stop of a tracked child
                    let _ = ptrace::cont(pid, None);
                }
                WaitStatus::Stopped(pid, signal) => {
                    debug!("{}", TrapContext::Signal(signal).describe(pid));
                    let _ = ptrace::cont(pid, signal);
                }
                WaitStatus::PtraceEvent(pid, _, event) => {
                    self.handle_ptrace_event(pid, event)?;
                }
                WaitStatus::Exited(pid, code) => {
                    if pid == self.tracee {
                        self.drain(results);
                        break code;
                    }
                    self.reap(pid, results);
                }
                WaitStatus::Signaled(pid, signal, _) => {
                    if pid == self.tracee {
                        warn!("tracee killed by {}", signal);
                        self.drain(results);
                        break 128 + signal as i32;
                    }
                    self.reap(pid, results);
                }
                _ => {}
            }
        };

        info!("tracee exited with status {}", code);
        Ok(code)
    }

    fn region_by_entry(&self, addr: u64) -> Option<usize> {
        self.regions
            .iter()
            .position(|r| r.entry.is_some_and(|bp| bp.addr == addr))
    }

    fn region_by_exit(&self, addr: u64) -> Option<(usize, Breakpoint)> {
        self.regions.iter().enumerate().find_map(|(idx, r)| {
            r.exits
                .iter()
                .find(|bp| bp.addr == addr)
                .map(|bp| (idx, *bp))
        })
    }

    fn depth(&self, region: usize) -> usize {
        self.stacks.values().map(|s| s.depth(region)).sum()
    }

    fn handle_trap(&mut self, pid: Pid, results: &mut ProfilingResults) -> Result<()> {
        let addr = trap::trap_addr(pid)?;

        if let Some(idx) = self.region_by_entry(addr) {
            self.handle_entry(pid, idx)?;
        } else if let Some((idx, breakpoint)) = self.region_by_exit(addr) {
            self.handle_exit(pid, idx, breakpoint, results)?;
        } else {
            // not one of ours (e.g. a child's exec trap)
            debug!("unhandled SIGTRAP of {} near {:#x}", pid, addr);
            let _ = ptrace::cont(pid, None);
        }
        Ok(())
    }

    fn handle_entry(&mut self, pid: Pid, idx: usize) -> Result<()> {
        let breakpoint = self.regions[idx].entry.expect("entry breakpoint armed");
        debug!(
            "{}",
            TrapContext::RegionEntry {
                region: idx,
                breakpoint
            }
            .describe(pid)
        );
        breakpoint.step_over(pid)?;

        if self.depth(idx) == 0 {
            let exits: Result<Vec<Breakpoint>> = self.regions[idx]
                .info
                .exit_addrs
                .iter()
                .map(|a| {
                    Breakpoint::install(pid, a + self.bias)
                        .with_context(|| format!("installing exit breakpoint at {:#x}", a))
                })
                .collect();
            self.regions[idx].exits = exits?;
        }

        // the execution's start precedes every sampler reading, and both
        // land before the tracee resumes
        let reader = self.readers.for_target(self.regions[idx].info.target);
        let start = Timestamp::now();
        let sampler = self.regions[idx].info.sampler.spawn(reader);
        self.stacks
            .entry(pid)
            .or_default()
            .push(idx, ActiveExecution { sampler, start });

        ptrace::cont(pid, None).context("resuming into region")?;
        Ok(())
    }

    fn handle_exit(
        &mut self,
        pid: Pid,
        idx: usize,
        breakpoint: Breakpoint,
        results: &mut ProfilingResults,
    ) -> Result<()> {
        debug!(
            "{}",
            TrapContext::RegionExit {
                region: idx,
                breakpoint
            }
            .describe(pid)
        );
        breakpoint.step_over(pid)?;

        // the exit may arrive on a different task than the entry
        let frame = self
            .stacks
            .get_mut(&pid)
            .and_then(|s| s.pop(idx))
            .or_else(|| self.stacks.values_mut().find_map(|s| s.pop(idx)));

        match frame {
            Some(execution) => {
                self.record(idx, execution, results);

                if self.depth(idx) == 0 {
                    for bp in std::mem::take(&mut self.regions[idx].exits) {
                        bp.uninstall(pid)
                            .with_context(|| format!("removing exit breakpoint at {:#x}", bp.addr))?;
                    }
                }
                if let Some(remaining) = self.regions[idx].remaining.as_mut() {
                    *remaining -= 1;
                    if *remaining == 0 {
                        info!("region {} completed all executions", idx);
                        if let Some(entry) = self.regions[idx].entry.take() {
                            entry.uninstall(pid)?;
                        }
                    }
                }
            }
            None => warn!("exit trap at {:#x} without a matching entry", breakpoint.addr),
        }

        ptrace::cont(pid, None).context("resuming past region exit")?;
        Ok(())
    }

    fn handle_ptrace_event(&mut self, pid: Pid, event: i32) -> Result<()> {
        if let Some(kind) = trap::creation_event(event) {
            let child = Pid::from_raw(ptrace::getevent(pid).context("PTRACE_GETEVENTMSG")? as i32);
            debug!("{}", TrapContext::TaskCreated { kind, child }.describe(pid));
            // breakpoints travel with the address space: clones share it,
            // fork children copy it
            self.children.insert(child);
            self.pending_tasks.insert(child);
        }
        let _ = ptrace::cont(pid, None);
        Ok(())
    }

    /// Joins the sampler of a finished execution and records it; a failed
    /// sampler still contributes its partial sequence. The end timestamp is
    /// taken after the join, so every sample lies within the recorded
    /// interval.
    fn record(&self, idx: usize, execution: ActiveExecution, results: &mut ProfilingResults) {
        let info = &self.regions[idx].info;
        let samples = match execution.sampler.join() {
            Ok(samples) => samples,
            Err(failure) => {
                warn!(
                    "sampler of region {} failed: {} ({})",
                    idx,
                    failure.error,
                    failure.error.cause().as_str()
                );
                failure.partial
            }
        };
        results.record_execution(
            info.group,
            info.section,
            ExecutionRecord {
                start: execution.start,
                end: Timestamp::now(),
                samples,
            },
        );
    }

    fn reap(&mut self, pid: Pid, results: &mut ProfilingResults) {
        self.children.remove(&pid);
        if let Some(mut stack) = self.stacks.remove(&pid) {
            for (idx, execution) in stack.drain() {
                self.record(idx, execution, results);
            }
        }
    }

    /// Ends every still-open execution; called when the tracee is gone.
    fn drain(&mut self, results: &mut ProfilingResults) {
        let stacks: Vec<_> = self.stacks.drain().collect();
        for (_, mut stack) in stacks {
            for (idx, execution) in stack.drain() {
                self.record(idx, execution, results);
            }
        }
    }
}

/// Collects the idle baseline: a bounded periodic sampler run over a
/// stopped system for `sleep_for`.
pub fn evaluate_idle(reader: Arc<dyn EnergyReader>, sleep_for: Duration) -> SamplerResult {
    let samples = sleep_for.as_secs().max(1) as usize + 1;
    let running = SamplerSpec::BoundedPeriodic {
        period: IDLE_PERIOD,
        samples,
    }
    .spawn(Some(reader));
    std::thread::sleep(sleep_for);
    running.join()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nrg::{Result as NrgResult, Sample};

    struct CountingReader;

    impl EnergyReader for CountingReader {
        fn read_all(&self, sample: &mut Sample) -> NrgResult<()> {
            sample.set_value(0, 1);
            Ok(())
        }

        fn read_one(&self, sample: &mut Sample, _idx: usize) -> NrgResult<()> {
            self.read_all(sample)
        }

        fn num_events(&self) -> usize {
            1
        }
    }

    #[test]
    fn test_execution_start_precedes_samples() {
        // same ordering as handle_entry: the execution's start timestamp is
        // captured before the sampler takes its first reading, so every
        // sample lies within [start, end]
        let reader: Arc<dyn EnergyReader> = Arc::new(CountingReader);
        let specs = [
            SamplerSpec::Short,
            SamplerSpec::BoundedPeriodic {
                period: Duration::from_millis(5),
                samples: 4,
            },
        ];
        for spec in specs {
            let start = Timestamp::now();
            let sampler = spec.spawn(Some(reader.clone()));
            let execution = ActiveExecution { sampler, start };

            std::thread::sleep(Duration::from_millis(20));
            // as in record(): the sampler joins first, the end timestamp
            // comes after
            let samples = execution.sampler.join().unwrap();
            let end = Timestamp::now();

            assert!(!samples.is_empty());
            for sample in &samples {
                assert!(execution.start <= sample.timestamp);
                assert!(sample.timestamp <= end);
            }
        }
    }

    #[test]
    fn test_region_stack_matching() {
        let mut stack = RegionStack::new();
        // entries/exits drawn from a properly nested id sequence
        stack.push(0, "a");
        stack.push(1, "b");
        stack.push(0, "c");

        assert_eq!(stack.depth(0), 2);
        assert_eq!(stack.depth(1), 1);

        // innermost frame of region 0 pops first
        assert_eq!(stack.pop(0), Some("c"));
        assert_eq!(stack.pop(0), Some("a"));
        assert_eq!(stack.pop(0), None);
        assert_eq!(stack.pop(1), Some("b"));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_region_stack_record_count() {
        // for any sequence of matched entry/exit pairs, the number of pops
        // equals the number of matched pairs per region
        let sequence = [(0, true), (1, true), (1, false), (0, true), (0, false), (0, false)];
        let mut stack = RegionStack::new();
        let mut records = [0usize; 2];
        for (region, is_entry) in sequence {
            if is_entry {
                stack.push(region, ());
            } else if stack.pop(region).is_some() {
                records[region] += 1;
            }
        }
        // region 0: two entries, two exits; region 1: one of each, one open
        assert_eq!(records, [2, 1]);
        assert_eq!(stack.drain().len(), 1);
    }

    #[test]
    fn test_maps_parsing() {
        let line = "55ad10564000-55ad10565000 r-xp 00001000 fd:01 393235 /usr/bin/target";
        let (_, entry) = parse_maps_line(line).unwrap();
        assert_eq!(entry.start, 0x55ad10564000);
        assert_eq!(entry.offset, 0x1000);
        assert_eq!(entry.path.as_deref(), Some("/usr/bin/target"));

        let anon = "7ffd1c3bc000-7ffd1c3dd000 rw-p 00000000 00:00 0";
        let (_, entry) = parse_maps_line(anon).unwrap();
        assert_eq!(entry.path, None);

        assert!(parse_maps_line("not a maps line").is_err());
    }

    #[test]
    fn test_exe_base_lookup() {
        let maps = "\
55ad10564000-55ad10565000 r--p 00000000 fd:01 393235 /usr/bin/target
55ad10565000-55ad10566000 r-xp 00001000 fd:01 393235 /usr/bin/target
7f0000000000-7f0000001000 r-xp 00000000 fd:01 11111  /usr/lib/libc.so.6
7ffd1c3bc000-7ffd1c3dd000 rw-p 00000000 00:00 0      [stack]
";
        assert_eq!(
            find_exe_base(maps, Path::new("./target")),
            Some(0x55ad10564000)
        );
        assert_eq!(find_exe_base(maps, Path::new("missing")), None);
    }
}
