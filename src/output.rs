//! Report files written at the end of a run.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::liveness::TimeInterval;
use crate::occupancy::{RankedEntry, Slice, TimeUnit};
use crate::producer::DrainOutcome;

pub const ALIVE_SERIES_FILE: &str = "alive_series.csv";
pub const SLICES_FILE: &str = "oncpu_slices.csv";
pub const SUMMARY_FILE: &str = "summary.json";
pub const TOP_RUNTIME_PREFIX: &str = "top_runtime_cpu_";

/// Quote a CSV field if it contains a separator, quote or newline.
fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

pub fn write_alive_series(path: &Path, intervals: &[TimeInterval]) -> Result<()> {
    let mut out = create(path)?;
    writeln!(out, "time,alive")?;
    for interval in intervals {
        writeln!(out, "{},{}", interval.time, interval.alive)?;
    }
    out.flush()?;
    Ok(())
}

pub fn write_slices(path: &Path, slices: &[Slice]) -> Result<()> {
    let mut out = create(path)?;
    writeln!(out, "pid,cpu,command,start_ns,end_ns,delta_ns,reason")?;
    for s in slices {
        writeln!(
            out,
            "{},{},{},{},{},{},{}",
            s.pid,
            s.cpu,
            escape_field(&s.command),
            s.start_ns,
            s.end_ns,
            s.delta_ns,
            escape_field(&s.reason)
        )?;
    }
    out.flush()?;
    Ok(())
}

/// One `top_runtime_cpu_<cpu>.csv` per CPU. Returns the files written.
pub fn write_top_runtime(
    dir: &Path,
    ranked: &BTreeMap<u32, Vec<RankedEntry>>,
    unit: TimeUnit,
) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for (cpu, entries) in ranked {
        let path = dir.join(format!("{TOP_RUNTIME_PREFIX}{cpu}.csv"));
        let mut out = create(&path)?;
        writeln!(out, "label,total_{unit}")?;
        for entry in entries {
            writeln!(out, "{},{}", escape_field(&entry.label), entry.total)?;
        }
        out.flush()?;
        written.push(path);
    }
    Ok(written)
}

/// Human readable per-CPU ranking, as printed to stdout.
pub fn format_top_runtime(ranked: &BTreeMap<u32, Vec<RankedEntry>>, unit: TimeUnit) -> String {
    let mut out = format!("Top per-CPU runtime (unit={unit})\n");
    for (cpu, entries) in ranked {
        out.push_str(&format!("CPU {cpu}:\n"));
        for entry in entries {
            out.push_str(&format!("  {} -> {:.3} {}\n", entry.label, entry.total, unit));
        }
    }
    out
}

/// Machine readable run summary.
#[derive(Debug, Default, Serialize)]
pub struct Summary {
    pub exit_code: i32,
    pub events: usize,
    pub intervals: usize,
    pub slices: usize,
    pub attach_misses: u64,
    pub missing_events: u64,
    pub producers: Vec<DrainOutcome>,
}

pub fn write_summary(path: &Path, summary: &Summary) -> Result<()> {
    let mut out = create(path)?;
    serde_json::to_writer_pretty(&mut out, summary)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}
