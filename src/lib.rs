//! An energy profiler for source-level code regions.
//!
//! wattprof launches a target executable under ptrace, brackets
//! user-declared source regions with software breakpoints, and records
//! energy and power readings from hardware sensors while each region
//! executes. The result is a single JSON report correlating every region
//! execution with its timestamped sensor samples.
//!
//! The main components:
//! - `nrg` reads the sensors: RAPL and OCC counters on the CPU side, NVML
//!   board power on the GPU side, composable into one hybrid read.
//! - `sampler` collects timed sample sequences while a region runs.
//! - `dbg` loads the target's debug info and resolves source positions and
//!   function names to addresses.
//! - `trap` installs and arms the breakpoints.
//! - `resolver` turns configured sections into resolved regions.
//! - `tracer` is the wait-for-trap control loop driving it all.
//! - `output` aggregates results and writes the report.

pub mod cli;
pub mod config;
pub mod dbg;
pub mod nrg;
pub mod output;
pub mod paths;
pub mod resolver;
pub mod sampler;
pub mod tracer;
pub mod trap;
