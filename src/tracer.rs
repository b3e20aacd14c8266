//! End to end run: launch the command, collect while it runs, reconstruct and
//! report once it exits.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::sys::signal::Signal;

use crate::coordinator::{Coordinator, FusedTrace};
use crate::event::BootClock;
use crate::liveness::LivenessReconstructor;
use crate::occupancy::{OccupancyReconstructor, TimeUnit};
use crate::output::{self, Summary};
use crate::producer::{BpfProducer, DrainPolicy, Producer, ProducerKind, ProducerOptions};
use crate::traced_command::{signal_pid, TracedCommand};

const MEMLOCK_RLIMIT_BYTES: u64 = 128 << 20;

/// Runtime options, decoupled from CLI parsing.
#[derive(Debug, Clone)]
pub struct Config {
    pub verbosity: u8,
    pub poll_timeout: Duration,
    /// Directory holding the `.bpf.o` images
    pub bpf_dir: PathBuf,
    pub output_dir: PathBuf,
    pub producers: Vec<ProducerKind>,
    pub top_n: usize,
    /// Unit of the per-CPU runtime ranking (ns, us, ms or s)
    pub time_unit: String,
    pub drain: DrainPolicy,
    /// Scope scheduling events to the traced command and its descendants
    pub pid_filter: bool,
    pub print_raw: bool,
    pub print_tree: bool,
    pub print_intervals: bool,
    /// Command to run and trace (everything after --)
    pub run_command: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            verbosity: 0,
            poll_timeout: Duration::from_millis(100),
            bpf_dir: default_bpf_dir(),
            output_dir: PathBuf::from("out"),
            producers: ProducerKind::ALL.to_vec(),
            top_n: 10,
            time_unit: "ms".to_string(),
            drain: DrainPolicy::default(),
            pid_filter: true,
            print_raw: false,
            print_tree: false,
            print_intervals: false,
            run_command: Vec::new(),
        }
    }
}

/// The images ship next to the binary.
pub fn default_bpf_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Bump the memory lock rlimit for BPF maps and programs.
pub fn bump_memlock_rlimit() -> Result<()> {
    let rlimit = libc::rlimit {
        rlim_cur: MEMLOCK_RLIMIT_BYTES,
        rlim_max: MEMLOCK_RLIMIT_BYTES,
    };

    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlimit) } != 0 {
        bail!(
            "Failed to increase RLIMIT_MEMLOCK to {} MiB",
            MEMLOCK_RLIMIT_BYTES >> 20
        );
    }
    Ok(())
}

/// Trace `config.run_command` until it exits. Returns the command's exit code.
pub fn run(config: &Config) -> Result<i32> {
    let unit: TimeUnit = config.time_unit.parse()?;
    if config.run_command.is_empty() {
        bail!("No command specified, pass it after --");
    }
    if !nix::unistd::geteuid().is_root() {
        bail!("tmt must be run as root to load BPF programs");
    }
    bump_memlock_rlimit()?;
    fs::create_dir_all(&config.output_dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            config.output_dir.display()
        )
    })?;

    // Fork before any collector thread exists
    let mut child = TracedCommand::spawn(&config.run_command)?;
    let root_pid = child.pid();

    let clock = BootClock::from_system();
    let opts = ProducerOptions {
        bpf_dir: config.bpf_dir.clone(),
        poll_timeout: config.poll_timeout,
        root_pid: Some(root_pid),
        pid_filter: config.pid_filter,
    };
    let producers: Vec<Box<dyn Producer>> = config
        .producers
        .iter()
        .map(|&kind| Box::new(BpfProducer::new(kind, opts.clone(), clock)) as Box<dyn Producer>)
        .collect();

    let mut coordinator = Coordinator::new(producers, config.drain);
    coordinator.install_all()?;

    // Ignore MultipleHandlers, e.g. when embedded in a test harness
    let _ = ctrlc::set_handler(move || {
        if let Err(err) = signal_pid(root_pid, Signal::SIGINT) {
            tracing::warn!("{:#}", err);
        }
    });

    child.release()?;
    eprintln!("Tracing command (PID {root_pid})...");
    eprintln!("Press Ctrl-C to interrupt it");
    let exit_code = child.wait()?;

    eprintln!("Stopping...");
    let trace = coordinator.coordinated_stop();
    let summary = report(trace, Some(root_pid), exit_code, config, unit)?;
    eprintln!(
        "{} events, {} alive samples, {} slices written to {}",
        summary.events,
        summary.intervals,
        summary.slices,
        config.output_dir.display()
    );
    if summary.missing_events > 0 {
        eprintln!(
            "Warning: {} events were emitted but never collected",
            summary.missing_events
        );
    }
    Ok(exit_code)
}

/// Reconstruct liveness and CPU occupancy from a fused trace, print what was
/// asked for and write every report file into `config.output_dir`.
pub fn report(
    trace: FusedTrace,
    root_pid: Option<u32>,
    exit_code: i32,
    config: &Config,
    unit: TimeUnit,
) -> Result<Summary> {
    let dir = &config.output_dir;
    let missing_events = trace.missing();
    let FusedTrace { events, drains } = trace;

    if config.print_raw {
        for event in &events {
            println!("{event}");
        }
    }

    let mut occupancy = OccupancyReconstructor::new(&events);
    occupancy.build_slices();

    let event_count = events.len();
    let mut liveness = LivenessReconstructor::new(events, root_pid);
    liveness.build_tree();
    let intervals = liveness.compute_intervals().to_vec();

    if config.print_tree {
        print!("{}", liveness.render_tree());
    }
    if config.print_intervals {
        println!("time,alive");
        for interval in &intervals {
            println!("{},{}", interval.time, interval.alive);
        }
    }

    output::write_alive_series(&dir.join(output::ALIVE_SERIES_FILE), &intervals)?;
    output::write_slices(&dir.join(output::SLICES_FILE), occupancy.slices())?;

    let ranked = occupancy.top_runtime_per_cpu(config.top_n, unit);
    if !ranked.is_empty() {
        print!("{}", output::format_top_runtime(&ranked, unit));
    }
    output::write_top_runtime(dir, &ranked, unit)?;

    let summary = Summary {
        exit_code,
        events: event_count,
        intervals: intervals.len(),
        slices: occupancy.slices().len(),
        attach_misses: liveness.attach_misses(),
        missing_events,
        producers: drains,
    };
    output::write_summary(&dir.join(output::SUMMARY_FILE), &summary)?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TraceError;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.poll_timeout, Duration::from_millis(100));
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert_eq!(config.producers.len(), 7);
        assert_eq!(config.top_n, 10);
        assert_eq!(config.time_unit, "ms");
        assert_eq!(config.drain.max_idle_polls, 5000);
        assert!(config.pid_filter);
    }

    #[test]
    fn test_run_rejects_unit_before_anything_else() {
        let config = Config {
            time_unit: "minutes".to_string(),
            run_command: vec!["true".to_string()],
            ..Default::default()
        };
        let err = run(&config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TraceError>(),
            Some(TraceError::InvalidUnit(_))
        ));
    }

    #[test]
    fn test_run_requires_command() {
        let config = Config::default();
        assert!(run(&config).is_err());
    }

    #[test]
    fn test_report_on_empty_trace() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let summary = report(FusedTrace::default(), None, 0, &config, TimeUnit::Millis).unwrap();
        assert_eq!(summary.events, 0);
        assert_eq!(summary.intervals, 0);
        assert_eq!(
            fs::read_to_string(dir.path().join(output::ALIVE_SERIES_FILE)).unwrap(),
            "time,alive\n"
        );
        assert!(dir.path().join(output::SUMMARY_FILE).exists());
    }
}
