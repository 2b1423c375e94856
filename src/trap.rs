//! Software breakpoints in the tracee.
//!
//! A breakpoint replaces the least significant byte of the instruction word
//! at its address with the x86-64 trap opcode and remembers the original
//! word. Stepping over an armed breakpoint restores the word, rewinds the
//! program counter onto it, single-steps, and re-arms.

use anyhow::{bail, Context, Result};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

/// x86-64 `int3`.
pub const TRAP_OPCODE: u64 = 0xCC;

/// Preserves everything but the least significant byte on x86-64.
pub const LSB_MASK: u64 = 0xFFFF_FFFF_FFFF_FF00;

/// The instruction word with its first byte replaced by the trap opcode.
pub fn patch_word(original: u64) -> u64 {
    (original & LSB_MASK) | TRAP_OPCODE
}

fn read_word(pid: Pid, addr: u64) -> Result<u64> {
    let word = ptrace::read(pid, addr as ptrace::AddressType)
        .with_context(|| format!("PTRACE_PEEKDATA at {:#x}", addr))?;
    Ok(word as u64)
}

fn write_word(pid: Pid, addr: u64, word: u64) -> Result<()> {
    unsafe {
        ptrace::write(
            pid,
            addr as ptrace::AddressType,
            word as *mut std::ffi::c_void,
        )
    }
    .with_context(|| format!("PTRACE_POKEDATA at {:#x}", addr))
}

/// The address the tracee trapped on: the program counter backed up over
/// the trap opcode.
pub fn trap_addr(pid: Pid) -> Result<u64> {
    let regs = ptrace::getregs(pid).context("PTRACE_GETREGS")?;
    Ok(regs.rip - 1)
}

/// An installed software breakpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Breakpoint {
    pub addr: u64,
    original: u64,
}

impl Breakpoint {
    /// Reads the original word at `addr` and arms the trap.
    pub fn install(pid: Pid, addr: u64) -> Result<Self> {
        let original = read_word(pid, addr)?;
        write_word(pid, addr, patch_word(original))?;
        Ok(Self { addr, original })
    }

    /// Restores the original instruction word.
    pub fn uninstall(&self, pid: Pid) -> Result<()> {
        write_word(pid, self.addr, self.original)
    }

    /// Executes the tracee past this breakpoint and re-arms it. The tracee
    /// must be stopped on the trap.
    pub fn step_over(&self, pid: Pid) -> Result<()> {
        self.uninstall(pid)?;

        let mut regs = ptrace::getregs(pid).context("PTRACE_GETREGS")?;
        regs.rip = self.addr;
        ptrace::setregs(pid, regs).context("PTRACE_SETREGS")?;

        ptrace::step(pid, None).context("PTRACE_SINGLESTEP")?;
        match waitpid(pid, None).context("waiting for single-step")? {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
            status => bail!("unexpected status while stepping: {:?}", status),
        }

        write_word(pid, self.addr, patch_word(self.original))
    }
}

/// How a traced task came into being.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskCreation {
    Clone,
    Fork,
    Vfork,
}

/// Classified trap, carrying the affected breakpoint (and with it the
/// original instruction bytes) where one is involved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapContext {
    /// An entry breakpoint fired: a function entry or the first statement
    /// of a line-bounded region.
    RegionEntry {
        region: usize,
        breakpoint: Breakpoint,
    },
    /// An exit breakpoint fired: a return site or the region's end line.
    RegionExit {
        region: usize,
        breakpoint: Breakpoint,
    },
    /// The tracee created a new task.
    TaskCreated { kind: TaskCreation, child: Pid },
    /// An unrelated signal to forward.
    Signal(Signal),
}

impl TrapContext {
    /// One-line trace description for logging.
    pub fn describe(&self, pid: Pid) -> String {
        match self {
            TrapContext::RegionEntry { region, breakpoint } => format!(
                "task {}: entered region {} at {:#x}",
                pid, region, breakpoint.addr
            ),
            TrapContext::RegionExit { region, breakpoint } => format!(
                "task {}: left region {} at {:#x}",
                pid, region, breakpoint.addr
            ),
            TrapContext::TaskCreated { kind, child } => {
                format!("task {}: {:?} created task {}", pid, kind, child)
            }
            TrapContext::Signal(signal) => format!("task {}: received {}", pid, signal),
        }
    }
}

/// Maps a `PTRACE_EVENT_*` stop to the task-creation kind.
pub fn creation_event(event: i32) -> Option<TaskCreation> {
    match event {
        libc::PTRACE_EVENT_CLONE => Some(TaskCreation::Clone),
        libc::PTRACE_EVENT_FORK => Some(TaskCreation::Fork),
        libc::PTRACE_EVENT_VFORK => Some(TaskCreation::Vfork),
        _ => None,
    }
}
