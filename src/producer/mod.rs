//! Event producers: one per kernel event source.
//!
//! A producer owns the attachment of one instrumentation image and the
//! channel(s) it emits into, plus a [`Collector`] thread that drains those
//! channels into a local buffer. The [`Coordinator`](crate::coordinator::Coordinator)
//! drives every producer through the same lifecycle:
//!
//! ```text
//! Uninstalled -> Running -> Frozen -> Drained -> Detached -> Stopped
//! ```

use std::time::Duration;

use anyhow::Result;
use serde::Serialize;

use crate::error::TraceError;
use crate::event::Event;

mod bpf;
mod catalog;
mod collector;

pub use bpf::{BpfProducer, ProducerOptions};
pub use catalog::{ChannelSpec, FilterSpec, ProducerKind, ProgramSpec};
pub use collector::{Collector, EventBuffer, EventChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProducerState {
    Uninstalled,
    Running,
    Frozen,
    Drained,
    Detached,
    Stopped,
}

impl ProducerState {
    /// Move to `next`, which must be the immediate successor of the current state.
    ///
    /// The only shortcut allowed is stopping directly from any state, which is
    /// what teardown of a half installed producer needs.
    pub fn advance(&mut self, producer: &str, next: ProducerState) -> Result<(), TraceError> {
        let ok = match (*self, next) {
            (ProducerState::Uninstalled, ProducerState::Running)
            | (ProducerState::Running, ProducerState::Frozen)
            | (ProducerState::Frozen, ProducerState::Drained)
            | (ProducerState::Drained, ProducerState::Detached) => true,
            (_, ProducerState::Stopped) => true,
            _ => false,
        };
        if !ok {
            return Err(TraceError::InvalidTransition {
                producer: producer.to_string(),
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }
}

/// Bounds the wait for a producer's observed count to catch up with its
/// emitted total.
#[derive(Debug, Clone, Copy)]
pub struct DrainPolicy {
    /// Attempts without progress before giving up.
    pub max_idle_polls: u32,
    /// Sleep between attempts.
    pub interval: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        DrainPolicy {
            max_idle_polls: 5000,
            interval: Duration::from_millis(1),
        }
    }
}

/// Result of draining one producer.
#[derive(Debug, Clone, Serialize)]
pub struct DrainOutcome {
    pub producer: String,
    pub expected: u64,
    pub observed: u64,
    pub complete: bool,
}

impl DrainOutcome {
    /// Records the producer reported but that never reached userspace.
    pub fn missing(&self) -> u64 {
        self.expected.saturating_sub(self.observed)
    }
}

/// Uniform lifecycle of an event producer.
pub trait Producer {
    fn name(&self) -> &str;

    fn state(&self) -> ProducerState;

    /// Load and attach the instrumentation, enable emission and start the collector.
    ///
    /// A failure leaves the producer inert, it is not fatal to the run.
    fn install(&mut self) -> Result<()>;

    /// Stop new emissions at the source. Already queued records stay intact.
    fn freeze(&mut self) -> Result<()>;

    /// Number of records the kernel side believes it emitted.
    fn snapshot_total(&self) -> u64;

    /// Number of records the collector decoded so far.
    fn observed(&self) -> u64;

    /// Wait for the collector to observe `expected` records, bounded by `policy`.
    fn drain_until(&mut self, expected: u64, policy: &DrainPolicy) -> DrainOutcome;

    /// Release the kernel attachment.
    fn detach(&mut self);

    /// Stop the collector thread and release the channels.
    fn stop(&mut self);

    /// Copy of every event buffered so far.
    fn collect(&self) -> Vec<Event>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_transitions_in_order() {
        let mut state = ProducerState::Uninstalled;
        for next in [
            ProducerState::Running,
            ProducerState::Frozen,
            ProducerState::Drained,
            ProducerState::Detached,
            ProducerState::Stopped,
        ] {
            state.advance("test", next).unwrap();
        }
        assert_eq!(state, ProducerState::Stopped);
    }

    #[test]
    fn test_detach_before_freeze_rejected() {
        let mut state = ProducerState::Running;
        let err = state.advance("fork", ProducerState::Detached).unwrap_err();
        assert!(matches!(err, TraceError::InvalidTransition { .. }));
        assert_eq!(state, ProducerState::Running);
    }

    #[test]
    fn test_freeze_before_install_rejected() {
        let mut state = ProducerState::Uninstalled;
        assert!(state.advance("fork", ProducerState::Frozen).is_err());
        state.advance("fork", ProducerState::Stopped).unwrap();
    }

    #[test]
    fn test_drain_outcome_missing() {
        let outcome = DrainOutcome {
            producer: "switch".to_string(),
            expected: 10,
            observed: 7,
            complete: false,
        };
        assert_eq!(outcome.missing(), 3);
    }
}
