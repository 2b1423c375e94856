//! Command line interface.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "wattprof")]
#[command(about = "Energy profiler for source-level code regions")]
pub struct Cli {
    /// Path to the XML profiling configuration
    #[arg(short, long)]
    pub config: PathBuf,

    /// Output file for the JSON report; a dated name is generated when
    /// omitted
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Skip the idle baseline evaluation
    #[arg(long)]
    pub no_idle: bool,

    /// Idle baseline duration in seconds
    #[arg(long, default_value = "5")]
    pub idle_duration: u64,

    /// Command to launch under the tracer
    #[arg(required = true, trailing_var_arg = true)]
    pub command: Vec<String>,
}
