//! Canonical trace events and the kernel wire records they are decoded from.

use std::ffi::CStr;
use std::fmt;

use chrono::{Local, LocalResult, TimeZone};
use plain::Plain;
use serde::Serialize;

use crate::error::TraceError;

pub const TASK_COMM_LEN: usize = 16;

/// Scheduling record `type` values.
const SCHED_SWITCH_IN: u32 = 1;
const SCHED_SWITCH_OUT: u32 = 2;

/// Scheduling record `reason` value for a task that blocked when switched out.
const SCHED_REASON_BLOCKED: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventKind {
    ExecEnter,
    ExecExit,
    Fork,
    Clone,
    Clone3,
    Exit,
    ExitGroup,
    Run,
    Desched,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ExecEnter => "execve-entry",
            EventKind::ExecExit => "execve-exit",
            EventKind::Fork => "fork",
            EventKind::Clone => "clone",
            EventKind::Clone3 => "clone3",
            EventKind::Exit => "exit",
            EventKind::ExitGroup => "exit_group",
            EventKind::Run => "run",
            EventKind::Desched => "desched",
        }
    }

    /// Whether this event creates a new task (and thus a process tree node).
    pub fn is_creation(&self) -> bool {
        matches!(self, EventKind::Fork | EventKind::Clone | EventKind::Clone3)
    }

    pub fn is_sched(&self) -> bool {
        matches!(self, EventKind::Run | EventKind::Desched)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded trace event.
///
/// `timestamp` is in the producing machine's monotonic clock until the
/// coordinator fuses all producers and rebases the stream to start at zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub parent_pid: u32,
    pub pid: u32,
    pub child_pid: u32,
    pub pgid: u32,
    pub tid: u32,
    pub tgid: u32,
    /// Only meaningful for run/desched.
    pub cpu: u32,
    pub command: String,
    pub timestamp: u64,
    pub timestamp_human: String,
    /// Switch-out reason for desched events.
    pub reason: Option<String>,
}

impl Event {
    /// A bare event of the given kind, mostly useful to build synthetic streams.
    pub fn new(kind: EventKind, pid: u32, timestamp: u64) -> Self {
        Event {
            kind,
            parent_pid: 0,
            pid,
            child_pid: 0,
            pgid: 0,
            tid: pid,
            tgid: pid,
            cpu: 0,
            command: String::new(),
            timestamp,
            timestamp_human: String::new(),
            reason: None,
        }
    }

    pub fn with_child(mut self, child_pid: u32) -> Self {
        self.child_pid = child_pid;
        self
    }

    pub fn with_parent(mut self, parent_pid: u32) -> Self {
        self.parent_pid = parent_pid;
        self
    }

    pub fn with_cpu(mut self, cpu: u32) -> Self {
        self.cpu = cpu;
        self
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.command = command.to_string();
        self
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} pid={} child={} comm={}",
            self.timestamp, self.kind, self.pid, self.child_pid, self.command
        )?;
        if self.kind.is_sched() {
            write!(f, " cpu={}", self.cpu)?;
        }
        if let Some(reason) = &self.reason {
            write!(f, " reason={reason}")?;
        }
        Ok(())
    }
}

/// Generic lifecycle record shared by the exec, fork, clone and exit producers.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct LifecycleRecord {
    pub parent_pid: u32,
    pub pid: u32,
    pub child_pid: u32,
    pub pgid: u32,
    pub tid: u32,
    pub tgid: u32,
    pub command: [u8; TASK_COMM_LEN],
    pub timestamp: u64,
}
unsafe impl Plain for LifecycleRecord {}

/// Scheduling record emitted on every context switch of an allowed task.
///
/// The trailing lifecycle fields are zeroed by the kernel side, they only
/// keep the schema uniform with [`LifecycleRecord`].
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SchedRecord {
    pub ts: u64,
    pub cpu: u32,
    pub pid: u32,
    pub r#type: u32,
    pub reason: u32,
    pub comm: [u8; TASK_COMM_LEN],
    pub parent_pid: u32,
    pub child_pid: u32,
    pub pgid: u32,
    pub tid: u32,
    pub tgid: u32,
    pub command: [u8; TASK_COMM_LEN],
    pub timestamp: u64,
}
unsafe impl Plain for SchedRecord {}

/// How the bytes of one channel are laid out and which kind they decode to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    Lifecycle(EventKind),
    Sched,
}

impl RecordLayout {
    pub fn size(&self) -> usize {
        match self {
            RecordLayout::Lifecycle(_) => std::mem::size_of::<LifecycleRecord>(),
            RecordLayout::Sched => std::mem::size_of::<SchedRecord>(),
        }
    }

    /// Decode one raw record.
    ///
    /// Returns `Ok(None)` for a well-formed record that does not map to an
    /// event (an unknown scheduling type).
    pub fn decode(&self, data: &[u8], clock: &BootClock) -> Result<Option<Event>, TraceError> {
        let too_short = || TraceError::Decode {
            len: data.len(),
            expected: self.size(),
        };
        match *self {
            RecordLayout::Lifecycle(kind) => {
                let mut rec = LifecycleRecord::default();
                plain::copy_from_bytes(&mut rec, data).map_err(|_| too_short())?;
                Ok(Some(Event {
                    kind,
                    parent_pid: rec.parent_pid,
                    pid: rec.pid,
                    child_pid: rec.child_pid,
                    pgid: rec.pgid,
                    tid: rec.tid,
                    tgid: rec.tgid,
                    cpu: 0,
                    command: comm_to_string(&rec.command),
                    timestamp: rec.timestamp,
                    timestamp_human: clock.human(rec.timestamp),
                    reason: None,
                }))
            }
            RecordLayout::Sched => {
                let mut rec = SchedRecord::default();
                plain::copy_from_bytes(&mut rec, data).map_err(|_| too_short())?;
                let (kind, reason) = match rec.r#type {
                    SCHED_SWITCH_IN => (EventKind::Run, None),
                    SCHED_SWITCH_OUT => {
                        let reason = if rec.reason == SCHED_REASON_BLOCKED {
                            "sleep"
                        } else {
                            "preempt"
                        };
                        (EventKind::Desched, Some(reason.to_string()))
                    }
                    _ => return Ok(None),
                };
                Ok(Some(Event {
                    kind,
                    parent_pid: rec.parent_pid,
                    pid: rec.pid,
                    child_pid: rec.child_pid,
                    pgid: rec.pgid,
                    tid: rec.tid,
                    tgid: rec.tgid,
                    cpu: rec.cpu,
                    command: comm_to_string(&rec.comm),
                    timestamp: rec.ts,
                    timestamp_human: clock.human(rec.ts),
                    reason,
                }))
            }
        }
    }
}

/// Convert a NUL padded kernel comm into a string.
pub fn comm_to_string(comm: &[u8]) -> String {
    match CStr::from_bytes_until_nul(comm) {
        Ok(s) => s.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(comm).into_owned(),
    }
}

/// Maps monotonic kernel timestamps onto wall clock time.
///
/// `bpf_ktime_get_ns` counts from boot, so the wall clock time of an event is
/// the boot time plus the event timestamp.
#[derive(Debug, Clone, Copy)]
pub struct BootClock {
    boot_secs: u64,
}

impl BootClock {
    pub fn from_system() -> Self {
        BootClock {
            boot_secs: sysinfo::System::boot_time(),
        }
    }

    pub fn fixed(boot_secs: u64) -> Self {
        BootClock { boot_secs }
    }

    pub fn human(&self, ts_ns: u64) -> String {
        let secs = (self.boot_secs + ts_ns / 1_000_000_000) as i64;
        let micros = (ts_ns / 1_000) % 1_000_000;

        match Local.timestamp_opt(secs, 0) {
            LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
                format!("{}.{micros:06}", dt.format("%Y-%m-%d %H:%M:%S"))
            }
            LocalResult::None => format!("{secs}.{micros:06}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comm(value: &str) -> [u8; TASK_COMM_LEN] {
        let mut out = [0u8; TASK_COMM_LEN];
        out[..value.len()].copy_from_slice(value.as_bytes());
        out
    }

    fn as_bytes<T: Plain>(rec: &T) -> Vec<u8> {
        unsafe { plain::as_bytes(rec) }.to_vec()
    }

    #[test]
    fn test_record_sizes_match_kernel_layout() {
        assert_eq!(std::mem::size_of::<LifecycleRecord>(), 48);
        assert_eq!(std::mem::size_of::<SchedRecord>(), 88);
    }

    #[test]
    fn test_decode_lifecycle() {
        let rec = LifecycleRecord {
            parent_pid: 1,
            pid: 100,
            child_pid: 200,
            pgid: 100,
            tid: 100,
            tgid: 100,
            command: comm("bash"),
            timestamp: 42,
        };
        let clock = BootClock::fixed(0);
        let event = RecordLayout::Lifecycle(EventKind::Fork)
            .decode(&as_bytes(&rec), &clock)
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::Fork);
        assert_eq!(event.pid, 100);
        assert_eq!(event.child_pid, 200);
        assert_eq!(event.command, "bash");
        assert_eq!(event.timestamp, 42);
        assert!(event.reason.is_none());
    }

    #[test]
    fn test_decode_sched() {
        let mut rec = SchedRecord {
            ts: 1000,
            cpu: 3,
            pid: 55,
            r#type: 2,
            reason: 1,
            comm: comm("worker"),
            ..Default::default()
        };
        let clock = BootClock::fixed(0);
        let event = RecordLayout::Sched
            .decode(&as_bytes(&rec), &clock)
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::Desched);
        assert_eq!(event.cpu, 3);
        assert_eq!(event.reason.as_deref(), Some("sleep"));

        rec.reason = 0;
        let event = RecordLayout::Sched
            .decode(&as_bytes(&rec), &clock)
            .unwrap()
            .unwrap();
        assert_eq!(event.reason.as_deref(), Some("preempt"));

        rec.r#type = 1;
        let event = RecordLayout::Sched
            .decode(&as_bytes(&rec), &clock)
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::Run);
        assert!(event.reason.is_none());

        rec.r#type = 7;
        assert!(RecordLayout::Sched
            .decode(&as_bytes(&rec), &clock)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_decode_short_record() {
        let clock = BootClock::fixed(0);
        let err = RecordLayout::Sched.decode(&[0u8; 10], &clock).unwrap_err();
        assert!(matches!(
            err,
            TraceError::Decode {
                len: 10,
                expected: 88
            }
        ));
    }

    #[test]
    fn test_comm_to_string() {
        assert_eq!(comm_to_string(&comm("sleep")), "sleep");
        assert_eq!(comm_to_string(b"exactly16bytes!!"), "exactly16bytes!!");
        assert_eq!(comm_to_string(&[0u8; TASK_COMM_LEN]), "");
    }

    #[test]
    fn test_human_timestamp_micros() {
        let clock = BootClock::fixed(0);
        let human = clock.human(1_000_123_456);
        assert!(human.ends_with(".000123"), "{human}");
    }

    #[test]
    fn test_human_timestamp_matches_local_time() {
        let clock = BootClock::fixed(1_700_000_000);
        let expected = Local
            .timestamp_opt(1_700_000_002, 0)
            .unwrap()
            .format("%Y-%m-%d %H:%M:%S")
            .to_string();
        assert_eq!(clock.human(2_500_000_000), format!("{expected}.500000"));
    }
}
