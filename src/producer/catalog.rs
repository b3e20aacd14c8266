use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};

use crate::event::{EventKind, RecordLayout};

/// Enabled-flag control map, key 0 -> u32 (1 = on).
pub const CFG_ENABLED_MAP: &str = "cfg_enabled";
/// Per-CPU emitted-event counter, key 0 -> one u64 per possible CPU.
pub const EV_COUNT_MAP: &str = "ev_count";

/// A BPF program and the tracepoint it attaches to.
#[derive(Debug, Clone, Copy)]
pub struct ProgramSpec {
    pub program: &'static str,
    pub category: &'static str,
    pub tracepoint: &'static str,
}

/// A ring buffer map and how its records decode.
#[derive(Debug, Clone, Copy)]
pub struct ChannelSpec {
    pub map: &'static str,
    pub layout: RecordLayout,
}

/// Maps scoping emission to the traced command and its descendants.
#[derive(Debug, Clone, Copy)]
pub struct FilterSpec {
    /// pid -> u8, 1 = allowed.
    pub allow_map: &'static str,
    /// key 0 -> u32, 1 = filter enabled.
    pub enable_map: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProducerKind {
    Execve,
    Fork,
    Exit,
    ExitGroup,
    Clone,
    Clone3,
    Switch,
}

impl ProducerKind {
    pub const ALL: [ProducerKind; 7] = [
        ProducerKind::Execve,
        ProducerKind::Fork,
        ProducerKind::Exit,
        ProducerKind::ExitGroup,
        ProducerKind::Clone,
        ProducerKind::Clone3,
        ProducerKind::Switch,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProducerKind::Execve => "execve",
            ProducerKind::Fork => "fork",
            ProducerKind::Exit => "exit",
            ProducerKind::ExitGroup => "exit_group",
            ProducerKind::Clone => "clone",
            ProducerKind::Clone3 => "clone3",
            ProducerKind::Switch => "switch",
        }
    }

    /// File name of the instrumentation image.
    pub fn object_file(&self) -> &'static str {
        match self {
            ProducerKind::Execve => "execve.bpf.o",
            ProducerKind::Fork => "fork.bpf.o",
            ProducerKind::Exit => "exit.bpf.o",
            ProducerKind::ExitGroup => "exit_group.bpf.o",
            ProducerKind::Clone => "clone.bpf.o",
            ProducerKind::Clone3 => "clone3.bpf.o",
            ProducerKind::Switch => "sched_switch.bpf.o",
        }
    }

    pub fn programs(&self) -> &'static [ProgramSpec] {
        match self {
            ProducerKind::Execve => &[
                ProgramSpec {
                    program: "trace_execve",
                    category: "syscalls",
                    tracepoint: "sys_enter_execve",
                },
                ProgramSpec {
                    program: "trace_execve_exit",
                    category: "syscalls",
                    tracepoint: "sys_exit_execve",
                },
            ],
            ProducerKind::Fork => &[ProgramSpec {
                program: "handle_sched_fork",
                category: "sched",
                tracepoint: "sched_process_fork",
            }],
            ProducerKind::Exit => &[ProgramSpec {
                program: "trace_exit_enter",
                category: "syscalls",
                tracepoint: "sys_enter_exit",
            }],
            ProducerKind::ExitGroup => &[ProgramSpec {
                program: "trace_exit_group",
                category: "syscalls",
                tracepoint: "sys_enter_exit_group",
            }],
            ProducerKind::Clone => &[ProgramSpec {
                program: "trace_clone_exit",
                category: "syscalls",
                tracepoint: "sys_exit_clone",
            }],
            ProducerKind::Clone3 => &[ProgramSpec {
                program: "trace_clone3_exit",
                category: "syscalls",
                tracepoint: "sys_exit_clone3",
            }],
            ProducerKind::Switch => &[
                ProgramSpec {
                    program: "trace_sched_switch",
                    category: "sched",
                    tracepoint: "sched_switch",
                },
                ProgramSpec {
                    program: "propagate_allow_on_fork",
                    category: "sched",
                    tracepoint: "sched_process_fork",
                },
            ],
        }
    }

    pub fn channels(&self) -> &'static [ChannelSpec] {
        match self {
            ProducerKind::Execve => &[
                ChannelSpec {
                    map: "execve_output_in",
                    layout: RecordLayout::Lifecycle(EventKind::ExecEnter),
                },
                ChannelSpec {
                    map: "execve_output_out",
                    layout: RecordLayout::Lifecycle(EventKind::ExecExit),
                },
            ],
            ProducerKind::Fork => &[ChannelSpec {
                map: "fork_output",
                layout: RecordLayout::Lifecycle(EventKind::Fork),
            }],
            ProducerKind::Exit => &[ChannelSpec {
                map: "exit_output",
                layout: RecordLayout::Lifecycle(EventKind::Exit),
            }],
            ProducerKind::ExitGroup => &[ChannelSpec {
                map: "exit_group_output",
                layout: RecordLayout::Lifecycle(EventKind::ExitGroup),
            }],
            ProducerKind::Clone => &[ChannelSpec {
                map: "clone_output",
                layout: RecordLayout::Lifecycle(EventKind::Clone),
            }],
            ProducerKind::Clone3 => &[ChannelSpec {
                map: "clone3_output",
                layout: RecordLayout::Lifecycle(EventKind::Clone3),
            }],
            ProducerKind::Switch => &[ChannelSpec {
                map: "sched_output",
                layout: RecordLayout::Sched,
            }],
        }
    }

    pub fn filter(&self) -> Option<FilterSpec> {
        match self {
            ProducerKind::Switch => Some(FilterSpec {
                allow_map: "allow_pids",
                enable_map: "cfg_useFilter",
            }),
            _ => None,
        }
    }

    /// Parse a `--producers` list. `all` (or an empty list) selects every producer.
    pub fn parse_list(list: &str) -> Result<Vec<ProducerKind>> {
        let list = list.trim();
        if list.is_empty() || list.eq_ignore_ascii_case("all") {
            return Ok(Self::ALL.to_vec());
        }
        let mut kinds = Vec::new();
        for name in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let kind = name.parse::<ProducerKind>()?;
            if !kinds.contains(&kind) {
                kinds.push(kind);
            }
        }
        if kinds.is_empty() {
            bail!("no producer selected");
        }
        Ok(kinds)
    }
}

impl FromStr for ProducerKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| {
                let names: Vec<&str> = Self::ALL.iter().map(|k| k.name()).collect();
                anyhow::anyhow!("unknown producer '{}', expected one of {}", s, names.join(","))
            })
    }
}

impl fmt::Display for ProducerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_all() {
        assert_eq!(ProducerKind::parse_list("all").unwrap().len(), 7);
        assert_eq!(ProducerKind::parse_list("").unwrap().len(), 7);
    }

    #[test]
    fn test_parse_list_subset() {
        let kinds = ProducerKind::parse_list("fork, exit,fork,switch").unwrap();
        assert_eq!(
            kinds,
            vec![ProducerKind::Fork, ProducerKind::Exit, ProducerKind::Switch]
        );
    }

    #[test]
    fn test_parse_list_unknown() {
        assert!(ProducerKind::parse_list("fork,vfork").is_err());
        assert!(ProducerKind::parse_list(",,").is_err());
    }

    #[test]
    fn test_only_switch_is_filtered() {
        for kind in ProducerKind::ALL {
            assert_eq!(kind.filter().is_some(), kind == ProducerKind::Switch);
            assert!(!kind.channels().is_empty());
            assert!(!kind.programs().is_empty());
        }
    }
}
