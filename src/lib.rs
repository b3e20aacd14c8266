//! tmt - thread monitoring tool.
//!
//! Traces a command with a set of BPF producers (exec, fork, clone, exit and
//! scheduler switch events), fuses what they collected into one ordered event
//! stream and reconstructs from it:
//!
//! - [`liveness`] - the command's process tree and how many of its tasks were
//!   alive over time
//! - [`occupancy`] - per-thread on-CPU slices and per-CPU runtime rankings
//!
//! # Example
//!
//! ```no_run
//! use tmt::{tracer, Config};
//!
//! let config = Config {
//!     run_command: vec!["make".to_string(), "-j8".to_string()],
//!     ..Default::default()
//! };
//! let exit_code = tracer::run(&config).expect("tracing failed");
//! std::process::exit(exit_code);
//! ```

pub mod coordinator;
pub mod error;
pub mod event;
pub mod liveness;
pub mod occupancy;
pub mod output;
pub mod producer;
pub mod traced_command;
pub mod tracer;

pub use coordinator::{fuse, Coordinator, FusedTrace};
pub use error::{ChannelError, TraceError};
pub use event::{Event, EventKind};
pub use tracer::{bump_memlock_rlimit, Config};
