//! CPU occupancy slices and per-CPU runtime ranking from scheduling events.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::error::TraceError;
use crate::event::{Event, EventKind};

/// Close reason for slices still open when the trace ends.
pub const END_OF_TRACE: &str = "end_of_trace";

/// A contiguous interval during which one task occupied one CPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slice {
    pub pid: u32,
    pub cpu: u32,
    pub command: String,
    pub start_ns: u64,
    pub end_ns: u64,
    pub delta_ns: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Nanos,
    Micros,
    Millis,
    Secs,
}

impl TimeUnit {
    /// Nanoseconds per unit.
    pub fn scale(&self) -> f64 {
        match self {
            TimeUnit::Nanos => 1.0,
            TimeUnit::Micros => 1e3,
            TimeUnit::Millis => 1e6,
            TimeUnit::Secs => 1e9,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Nanos => "ns",
            TimeUnit::Micros => "us",
            TimeUnit::Millis => "ms",
            TimeUnit::Secs => "s",
        }
    }
}

impl FromStr for TimeUnit {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ns" => Ok(TimeUnit::Nanos),
            "us" => Ok(TimeUnit::Micros),
            "ms" => Ok(TimeUnit::Millis),
            "s" => Ok(TimeUnit::Secs),
            other => Err(TraceError::InvalidUnit(other.to_string())),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `<command>:<pid>` entry of a per-CPU ranking.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedEntry {
    pub label: String,
    pub total: f64,
}

struct OpenRun {
    start: u64,
    cpu: u32,
    command: String,
}

pub struct OccupancyReconstructor {
    events: Vec<Event>,
    slices: Vec<Slice>,
}

impl OccupancyReconstructor {
    /// Keeps only run/desched events, in timestamp order.
    pub fn new(events: &[Event]) -> Self {
        let mut events: Vec<Event> = events
            .iter()
            .filter(|event| event.kind.is_sched())
            .cloned()
            .collect();
        events.sort_by_key(|event| event.timestamp);
        OccupancyReconstructor {
            events,
            slices: Vec::new(),
        }
    }

    /// Pair run/desched events per pid into slices.
    ///
    /// A second run for a pid replaces its open interval. Intervals that do
    /// not move forward in time are dropped. Whatever is still open at the end
    /// is closed at the last scheduling timestamp.
    pub fn build_slices(&mut self) -> &[Slice] {
        let mut open: BTreeMap<u32, OpenRun> = BTreeMap::new();
        self.slices.clear();

        for event in &self.events {
            match event.kind {
                EventKind::Run => {
                    open.insert(
                        event.pid,
                        OpenRun {
                            start: event.timestamp,
                            cpu: event.cpu,
                            command: event.command.clone(),
                        },
                    );
                }
                EventKind::Desched => {
                    let Some(run) = open.remove(&event.pid) else {
                        continue;
                    };
                    if event.timestamp > run.start {
                        self.slices.push(Slice {
                            pid: event.pid,
                            cpu: run.cpu,
                            command: run.command,
                            start_ns: run.start,
                            end_ns: event.timestamp,
                            delta_ns: event.timestamp - run.start,
                            reason: event.reason.clone().unwrap_or_default(),
                        });
                    }
                }
                _ => {}
            }
        }

        let end = self.events.iter().map(|e| e.timestamp).max().unwrap_or(0);
        for (pid, run) in open {
            tracing::debug!("closing pending slice for pid {} at end of trace", pid);
            self.slices.push(Slice {
                pid,
                cpu: run.cpu,
                command: run.command,
                start_ns: run.start,
                end_ns: end,
                delta_ns: end - run.start,
                reason: END_OF_TRACE.to_string(),
            });
        }

        tracing::info!(
            "built {} slices from {} scheduling events",
            self.slices.len(),
            self.events.len()
        );
        &self.slices
    }

    pub fn slices(&self) -> &[Slice] {
        &self.slices
    }

    /// Total runtime per task on each CPU, largest first, cut to `top_n`.
    pub fn top_runtime_per_cpu(
        &self,
        top_n: usize,
        unit: TimeUnit,
    ) -> BTreeMap<u32, Vec<RankedEntry>> {
        let mut totals: BTreeMap<(u32, u32, &str), u64> = BTreeMap::new();
        for slice in &self.slices {
            *totals
                .entry((slice.cpu, slice.pid, slice.command.as_str()))
                .or_default() += slice.delta_ns;
        }

        let scale = unit.scale();
        let mut per_cpu: BTreeMap<u32, Vec<RankedEntry>> = BTreeMap::new();
        for ((cpu, pid, command), total_ns) in totals {
            per_cpu.entry(cpu).or_default().push(RankedEntry {
                label: format!("{command}:{pid}"),
                total: total_ns as f64 / scale,
            });
        }

        for entries in per_cpu.values_mut() {
            entries.sort_by(|a, b| {
                b.total
                    .total_cmp(&a.total)
                    .then_with(|| a.label.cmp(&b.label))
            });
            entries.truncate(top_n);
        }
        per_cpu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(pid: u32, cpu: u32, ts: u64) -> Event {
        Event::new(EventKind::Run, pid, ts)
            .with_cpu(cpu)
            .with_command("worker")
    }

    fn desched(pid: u32, cpu: u32, ts: u64, reason: &str) -> Event {
        Event::new(EventKind::Desched, pid, ts)
            .with_cpu(cpu)
            .with_command("worker")
            .with_reason(reason)
    }

    fn slice(pid: u32, start: u64, end: u64, reason: &str) -> Slice {
        Slice {
            pid,
            cpu: 0,
            command: "worker".to_string(),
            start_ns: start,
            end_ns: end,
            delta_ns: end - start,
            reason: reason.to_string(),
        }
    }

    #[test]
    fn test_run_desched_and_end_of_trace() {
        let events = vec![
            run(5, 0, 100),
            desched(5, 0, 150, "sleep"),
            run(5, 0, 200),
            Event::new(EventKind::Exit, 9, 250),
            run(6, 0, 290),
            desched(6, 0, 300, "preempt"),
        ];
        let mut occupancy = OccupancyReconstructor::new(&events);
        let slices = occupancy.build_slices();
        assert_eq!(
            slices,
            &[
                slice(5, 100, 150, "sleep"),
                slice(6, 290, 300, "preempt"),
                slice(5, 200, 300, END_OF_TRACE),
            ]
        );
    }

    #[test]
    fn test_unmatched_and_empty_intervals_dropped() {
        let events = vec![
            desched(7, 0, 10, "sleep"),
            run(8, 1, 20),
            desched(8, 1, 20, "preempt"),
        ];
        let mut occupancy = OccupancyReconstructor::new(&events);
        assert!(occupancy.build_slices().is_empty());
    }

    #[test]
    fn test_second_run_overwrites_open_interval() {
        let events = vec![run(5, 0, 10), run(5, 2, 40), desched(5, 2, 50, "sleep")];
        let mut occupancy = OccupancyReconstructor::new(&events);
        let slices = occupancy.build_slices();
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].cpu, 2);
        assert_eq!(slices[0].delta_ns, 10);
    }

    #[test]
    fn test_top_runtime_ranking() {
        let events = vec![
            run(1, 0, 0),
            desched(1, 0, 3_000_000, "preempt"),
            run(2, 0, 3_000_000),
            desched(2, 0, 8_000_000, "sleep"),
            run(1, 0, 8_000_000),
            desched(1, 0, 9_000_000, "sleep"),
            run(3, 1, 0),
            desched(3, 1, 2_500_000, "sleep"),
        ];
        let mut occupancy = OccupancyReconstructor::new(&events);
        occupancy.build_slices();

        let ranked = occupancy.top_runtime_per_cpu(10, TimeUnit::Millis);
        assert_eq!(ranked.len(), 2);
        assert_eq!(
            ranked[&0],
            vec![
                RankedEntry {
                    label: "worker:2".to_string(),
                    total: 5.0
                },
                RankedEntry {
                    label: "worker:1".to_string(),
                    total: 4.0
                },
            ]
        );
        assert_eq!(ranked[&1][0].total, 2.5);

        let top1 = occupancy.top_runtime_per_cpu(1, TimeUnit::Millis);
        assert_eq!(top1[&0].len(), 1);
        assert_eq!(top1[&0][0].label, "worker:2");
    }

    #[test]
    fn test_units_are_consistent() {
        let events = vec![run(1, 0, 0), desched(1, 0, 1_234_567, "sleep")];
        let mut occupancy = OccupancyReconstructor::new(&events);
        occupancy.build_slices();
        let ns = occupancy.top_runtime_per_cpu(1, TimeUnit::Nanos)[&0][0].total;
        let ms = occupancy.top_runtime_per_cpu(1, TimeUnit::Millis)[&0][0].total;
        assert!((ms - ns / 1e6).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_unit() {
        let err = "min".parse::<TimeUnit>().unwrap_err();
        assert!(matches!(err, TraceError::InvalidUnit(ref u) if u == "min"));
        assert_eq!("us".parse::<TimeUnit>().unwrap(), TimeUnit::Micros);
    }
}
