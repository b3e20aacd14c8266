use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;

use super::{DrainOutcome, DrainPolicy};
use crate::error::ChannelError;
use crate::event::{BootClock, Event, RecordLayout};

/// Source of raw records for a collector.
///
/// Implementations invoke their sample callbacks from inside `poll`/`consume`,
/// so they only ever run on the collector thread.
pub trait EventChannel: Send {
    /// Wait up to `timeout` for records and dispatch whatever arrived.
    fn poll(&mut self, timeout: Duration) -> Result<(), ChannelError>;

    /// Dispatch whatever is queued without waiting.
    fn consume(&mut self) -> Result<(), ChannelError>;
}

// ring_buffer__poll only fails outside EINTR when epoll_wait itself does
// (EBADF, EINVAL, EFAULT), and every later poll on that ring fails the same way.
fn channel_error(err: libbpf_rs::Error) -> ChannelError {
    if err.kind() == libbpf_rs::ErrorKind::Interrupted {
        ChannelError::Transient(err.to_string())
    } else {
        ChannelError::Fatal(err.to_string())
    }
}

impl EventChannel for libbpf_rs::RingBuffer<'static> {
    fn poll(&mut self, timeout: Duration) -> Result<(), ChannelError> {
        libbpf_rs::RingBuffer::poll(self, timeout).map_err(channel_error)
    }

    fn consume(&mut self) -> Result<(), ChannelError> {
        libbpf_rs::RingBuffer::consume(self)
            .map(|_| ())
            .map_err(channel_error)
    }
}

/// Per producer event buffer.
///
/// Written by the producer's collector thread only, read by the coordinator
/// once collection is over.
pub struct EventBuffer {
    producer: String,
    clock: BootClock,
    events: Mutex<Vec<Event>>,
    observed: AtomicU64,
    malformed: AtomicU64,
}

impl EventBuffer {
    pub fn new(producer: &str, clock: BootClock) -> Self {
        EventBuffer {
            producer: producer.to_string(),
            clock,
            events: Mutex::new(Vec::new()),
            observed: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    /// Ring buffer sample callback: decode one record and append it.
    ///
    /// Always returns 0 so libbpf keeps consuming the rest of the batch.
    pub fn on_sample(&self, layout: RecordLayout, data: &[u8]) -> i32 {
        match layout.decode(data, &self.clock) {
            Ok(Some(event)) => {
                self.events.lock().unwrap().push(event);
                self.observed.fetch_add(1, Ordering::Release);
            }
            Ok(None) => {
                self.observed.fetch_add(1, Ordering::Release);
            }
            Err(err) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("[{}] dropping record: {}", self.producer, err);
            }
        }
        0
    }

    pub fn observed(&self) -> u64 {
        self.observed.load(Ordering::Acquire)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

/// Dedicated polling thread for one producer's channels.
pub struct Collector {
    name: String,
    buffer: Arc<EventBuffer>,
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Collector {
    pub fn start(
        name: &str,
        buffer: Arc<EventBuffer>,
        channels: Vec<Box<dyn EventChannel>>,
        poll_timeout: Duration,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread_name = name.to_string();
        let thread = thread::Builder::new()
            .name(format!("collect_{name}"))
            .spawn(move || poll_loop(&thread_name, channels, &thread_stop, poll_timeout))?;

        Ok(Collector {
            name: name.to_string(),
            buffer,
            stop,
            thread: Some(thread),
        })
    }

    pub fn observed(&self) -> u64 {
        self.buffer.observed()
    }

    /// Wait until the collector has observed `expected` records.
    ///
    /// Gives up after `policy.max_idle_polls` consecutive checks without
    /// progress, in which case the outcome is marked incomplete.
    pub fn drain_until(&self, expected: u64, policy: &DrainPolicy) -> DrainOutcome {
        let mut observed = self.observed();
        let mut idle = 0;
        while observed < expected && idle < policy.max_idle_polls {
            thread::sleep(policy.interval);
            let now = self.observed();
            if now > observed {
                observed = now;
                idle = 0;
            } else {
                idle += 1;
            }
        }

        DrainOutcome {
            producer: self.name.clone(),
            expected,
            observed,
            complete: observed >= expected,
        }
    }

    /// Signal the polling thread and wait for it to exit.
    ///
    /// The thread flushes its channels once more before dropping them.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("[{}] collector thread panicked", self.name);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.stop();
    }
}

fn poll_loop(
    name: &str,
    mut channels: Vec<Box<dyn EventChannel>>,
    stop: &AtomicBool,
    timeout: Duration,
) {
    while !stop.load(Ordering::Acquire) && !channels.is_empty() {
        channels.retain_mut(|channel| match channel.poll(timeout) {
            Ok(()) => true,
            Err(ChannelError::Transient(msg)) => {
                tracing::warn!("[{name}] poll error: {msg}");
                true
            }
            Err(ChannelError::Fatal(msg)) => {
                tracing::error!("[{name}] channel failed, no longer polling it: {msg}");
                false
            }
        });
    }

    // Flush whatever is left in the channels
    for channel in channels.iter_mut() {
        if let Err(err) = channel.consume() {
            tracing::warn!("[{name}] final flush failed: {err}");
        }
    }
}
