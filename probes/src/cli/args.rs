//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "probes",
    about = "Record kernel ftrace events for one or more tracing sessions",
    after_help = "\
EXAMPLES:
    sudo probes --config session.json                 Record until Ctrl+C
    sudo probes --config a.json --config b.json --duration 10
    sudo probes --frozen-instance persistent --output trace.jsonl
    sudo probes --hard-reset                          Clean up leftover state"
)]
pub struct Args {
    /// Session config file (JSON); may be repeated for concurrent sessions
    #[arg(short, long, value_name = "FILE")]
    pub config: Vec<PathBuf>,

    /// Write records to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Stop after N seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Drain a stopped instance's preserved ring buffers and exit
    #[arg(long, value_name = "NAME", conflicts_with_all = &["config", "duration"])]
    pub frozen_instance: Option<String>,

    /// Best-effort reset of global ftrace state, then exit
    #[arg(long, conflicts_with_all = &["config", "frozen_instance"])]
    pub hard_reset: bool,
}
