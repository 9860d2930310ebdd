//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "vigil",
    about = "Run a simulated workload under the vigil operation monitor",
    after_help = "\
EXAMPLES:
    vigil                                   Default workload, reports logged
    vigil --export reports.jsonl            Also write reports as JSON Lines
    vigil --config vigil.json --workers 8   Custom thresholds, more threads"
)]
pub struct Args {
    /// JSON monitor configuration (demo-friendly defaults if omitted)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Write every report to a JSON Lines file
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Requests handled by each worker
    #[arg(long, default_value = "20")]
    pub requests: u32,

    /// Worker threads
    #[arg(short, long, default_value = "4")]
    pub workers: u32,

    /// Every Nth request is slow, every (3*N)th gets stuck (0 = never)
    #[arg(long, default_value = "5")]
    pub slow_every: u32,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}
