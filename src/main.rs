use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser};
use tracing_subscriber::EnvFilter;

use tmt::producer::{DrainPolicy, ProducerKind};
use tmt::tracer::{self, default_bpf_dir};
use tmt::Config;

/// Trace a command's process lifetime and CPU occupancy with BPF.
#[derive(Debug, Parser)]
#[command(name = "tmt", version)]
struct Command {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
    /// How long a collector blocks waiting for records
    #[arg(long, default_value = "100")]
    poll_timeout_ms: u64,
    /// Directory holding the *.bpf.o images (defaults to the binary's directory)
    #[arg(long)]
    bpf_dir: Option<PathBuf>,
    #[arg(short, long, default_value = "out")]
    output_dir: PathBuf,
    /// Comma separated producers to install, or "all"
    #[arg(long, default_value = "all")]
    producers: String,
    /// Entries per CPU in the runtime ranking
    #[arg(long, default_value = "10")]
    top_n: usize,
    /// Unit of the runtime ranking: ns, us, ms or s
    #[arg(long, default_value = "ms")]
    time_unit: String,
    /// Idle drain attempts before giving up on a producer
    #[arg(long, default_value = "5000")]
    drain_max_idle: u32,
    /// Sleep between drain attempts
    #[arg(long, default_value = "1000")]
    drain_interval_us: u64,
    /// Record scheduling events of every task, not only the traced command's
    #[arg(long)]
    no_pid_filter: bool,
    /// Print every fused event
    #[arg(long)]
    print_raw: bool,
    /// Print the reconstructed process tree
    #[arg(long)]
    print_tree: bool,
    /// Print the alive-count series
    #[arg(long)]
    print_intervals: bool,
    /// Command to run and trace
    #[arg(last = true, required = true)]
    run_command: Vec<String>,
}

impl Command {
    fn into_config(self) -> Result<Config> {
        Ok(Config {
            verbosity: self.verbose,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            bpf_dir: self.bpf_dir.unwrap_or_else(default_bpf_dir),
            output_dir: self.output_dir,
            producers: ProducerKind::parse_list(&self.producers)?,
            top_n: self.top_n,
            time_unit: self.time_unit,
            drain: DrainPolicy {
                max_idle_polls: self.drain_max_idle,
                interval: Duration::from_micros(self.drain_interval_us),
            },
            pid_filter: !self.no_pid_filter,
            print_raw: self.print_raw,
            print_tree: self.print_tree,
            print_intervals: self.print_intervals,
            run_command: self.run_command,
        })
    }
}

fn init_tracing(verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let config = Command::parse().into_config()?;
    init_tracing(config.verbosity);

    let exit_code = tracer::run(&config)?;
    process::exit(exit_code);
}
