//! Error taxonomy for the collection and reconstruction pipeline.
//!
//! Only [`TraceError::NoProducerInstalled`] stops a run. Everything else is
//! either recovered per producer by the coordinator or absorbed locally by the
//! reconstructors.

use thiserror::Error;

use crate::producer::ProducerState;

#[derive(Debug, Error)]
pub enum TraceError {
    /// A producer could not resolve, load or attach its instrumentation.
    #[error("failed to install producer {producer}: {reason}")]
    Install { producer: String, reason: String },

    /// Every producer failed to install, nothing would be collected.
    #[error("no producer installed successfully")]
    NoProducerInstalled,

    /// Unrecognized time unit passed to the runtime aggregation.
    #[error("invalid time unit: {0} (expected one of ns, us, ms, s)")]
    InvalidUnit(String),

    /// A lifecycle step was requested out of order.
    #[error("producer {producer}: invalid transition {from:?} -> {to:?}")]
    InvalidTransition {
        producer: String,
        from: ProducerState,
        to: ProducerState,
    },

    /// A raw record was shorter than its wire layout.
    #[error("record too short: got {len} bytes, expected {expected}")]
    Decode { len: usize, expected: usize },
}

/// Failure reported by an event channel poll.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The poll was interrupted or otherwise retryable, the loop keeps going.
    #[error("transient poll error: {0}")]
    Transient(String),

    /// The channel is unusable, the collector stops polling it.
    #[error("fatal poll error: {0}")]
    Fatal(String),
}
