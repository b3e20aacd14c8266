use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use libbpf_rs::{
    Link, MapCore, MapFlags, MapHandle, Object, ObjectBuilder, RingBufferBuilder,
    TracepointCategory,
};

use super::catalog::{FilterSpec, ProducerKind, CFG_ENABLED_MAP, EV_COUNT_MAP};
use super::{
    Collector, DrainOutcome, DrainPolicy, EventBuffer, EventChannel, Producer, ProducerState,
};
use crate::error::TraceError;
use crate::event::{BootClock, Event};

const KEY_ZERO: [u8; 4] = 0u32.to_ne_bytes();

/// Settings shared by every kernel backed producer.
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    /// Directory holding the compiled `.bpf.o` images.
    pub bpf_dir: PathBuf,
    pub poll_timeout: Duration,
    /// Pid of the traced command, seeds the scheduling allow-list.
    pub root_pid: Option<u32>,
    pub pid_filter: bool,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        ProducerOptions {
            bpf_dir: PathBuf::from("."),
            poll_timeout: Duration::from_millis(100),
            root_pid: None,
            pid_filter: true,
        }
    }
}

/// Everything that only exists once the image is loaded and attached.
///
/// Field order is drop order: the collector thread goes first, then the
/// attachments, then the maps and finally the object itself.
struct Attachment {
    collector: Collector,
    links: Vec<Link>,
    enabled: MapHandle,
    counter: Option<MapHandle>,
    _object: Object,
}

/// A producer backed by one compiled BPF object.
pub struct BpfProducer {
    kind: ProducerKind,
    opts: ProducerOptions,
    state: ProducerState,
    buffer: Arc<EventBuffer>,
    attachment: Option<Attachment>,
}

impl BpfProducer {
    pub fn new(kind: ProducerKind, opts: ProducerOptions, clock: BootClock) -> Self {
        BpfProducer {
            kind,
            opts,
            state: ProducerState::Uninstalled,
            buffer: Arc::new(EventBuffer::new(kind.name(), clock)),
            attachment: None,
        }
    }

    fn object_path(&self) -> PathBuf {
        self.opts.bpf_dir.join(self.kind.object_file())
    }

    fn attach(&self) -> Result<Attachment> {
        let path = self.object_path();
        let mut object = ObjectBuilder::default()
            .open_file(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?
            .load()
            .with_context(|| format!("Failed to load {}", path.display()))?;

        let enabled = map_handle(&object, CFG_ENABLED_MAP)?;
        let counter = match map_handle(&object, EV_COUNT_MAP) {
            Ok(handle) => Some(handle),
            Err(err) => {
                tracing::debug!("[{}] no emitted counter: {:#}", self.kind, err);
                None
            }
        };

        if let Some(filter) = self.kind.filter() {
            self.setup_filter(&object, &filter)?;
        }

        let mut links = Vec::new();
        for spec in self.kind.programs() {
            let prog = object
                .progs_mut()
                .find(|prog| prog.name() == OsStr::new(spec.program))
                .with_context(|| format!("Program {} not found", spec.program))?;
            let link = prog
                .attach_tracepoint(
                    TracepointCategory::Custom(spec.category.to_string()),
                    spec.tracepoint,
                )
                .with_context(|| {
                    format!(
                        "Failed to attach {} to {}:{}",
                        spec.program, spec.category, spec.tracepoint
                    )
                })?;
            links.push(link);
        }

        let mut builder = RingBufferBuilder::new();
        let mut channel_maps = Vec::new();
        for spec in self.kind.channels() {
            channel_maps.push((map_handle(&object, spec.map)?, spec.layout));
        }
        for (map, layout) in &channel_maps {
            let buffer = self.buffer.clone();
            let layout = *layout;
            builder.add(map, move |data: &[u8]| buffer.on_sample(layout, data))?;
        }
        let ring = builder.build()?;

        enabled
            .update(&KEY_ZERO, &1u32.to_ne_bytes(), MapFlags::ANY)
            .context("Failed to enable emission")?;

        let channels: Vec<Box<dyn EventChannel>> = vec![Box::new(ring)];
        let collector = Collector::start(
            self.kind.name(),
            self.buffer.clone(),
            channels,
            self.opts.poll_timeout,
        )?;

        Ok(Attachment {
            collector,
            links,
            enabled,
            counter,
            _object: object,
        })
    }

    /// Seed the allow-list with the traced command and its current threads.
    fn setup_filter(&self, object: &Object, filter: &FilterSpec) -> Result<()> {
        let flag = map_handle(object, filter.enable_map)?;
        let Some(root) = self.opts.root_pid.filter(|_| self.opts.pid_filter) else {
            flag.update(&KEY_ZERO, &0u32.to_ne_bytes(), MapFlags::ANY)?;
            return Ok(());
        };

        let allow = map_handle(object, filter.allow_map)?;
        let mut pids = vec![root];
        pids.extend(task_threads(Path::new("/proc"), root));
        pids.sort_unstable();
        pids.dedup();
        for pid in &pids {
            allow
                .update(&pid.to_ne_bytes(), &[1u8], MapFlags::ANY)
                .with_context(|| format!("Failed to allow pid {pid}"))?;
        }
        flag.update(&KEY_ZERO, &1u32.to_ne_bytes(), MapFlags::ANY)?;
        tracing::debug!("[{}] allow-list seeded with {:?}", self.kind, pids);
        Ok(())
    }
}

impl Producer for BpfProducer {
    fn name(&self) -> &str {
        self.kind.name()
    }

    fn state(&self) -> ProducerState {
        self.state
    }

    fn install(&mut self) -> Result<()> {
        let mut next = self.state;
        next.advance(self.kind.name(), ProducerState::Running)?;
        let attachment = self.attach().map_err(|err| TraceError::Install {
            producer: self.kind.name().to_string(),
            reason: format!("{err:#}"),
        })?;
        self.attachment = Some(attachment);
        self.state = next;
        tracing::info!("[{}] installed", self.kind);
        Ok(())
    }

    fn freeze(&mut self) -> Result<()> {
        self.state.advance(self.kind.name(), ProducerState::Frozen)?;
        if let Some(attachment) = &self.attachment {
            attachment
                .enabled
                .update(&KEY_ZERO, &0u32.to_ne_bytes(), MapFlags::ANY)
                .with_context(|| format!("Failed to freeze {}", self.kind))?;
        }
        Ok(())
    }

    fn snapshot_total(&self) -> u64 {
        let counter = self
            .attachment
            .as_ref()
            .and_then(|attachment| attachment.counter.as_ref());
        let Some(counter) = counter else {
            return self.observed();
        };
        match counter.lookup_percpu(&KEY_ZERO, MapFlags::ANY) {
            Ok(Some(per_cpu)) => per_cpu
                .iter()
                .map(|bytes| {
                    let mut count: u64 = 0;
                    // A short value only happens with a mismatched image, count it as zero
                    let _ = plain::copy_from_bytes(&mut count, bytes);
                    count
                })
                .sum(),
            Ok(None) => 0,
            Err(err) => {
                tracing::warn!("[{}] failed to read emitted counter: {}", self.kind, err);
                self.observed()
            }
        }
    }

    fn observed(&self) -> u64 {
        self.buffer.observed()
    }

    fn drain_until(&mut self, expected: u64, policy: &DrainPolicy) -> DrainOutcome {
        if let Err(err) = self.state.advance(self.kind.name(), ProducerState::Drained) {
            tracing::warn!("{}", err);
        }
        match &self.attachment {
            Some(attachment) => attachment.collector.drain_until(expected, policy),
            None => {
                let observed = self.observed();
                DrainOutcome {
                    producer: self.kind.name().to_string(),
                    expected,
                    observed,
                    complete: observed >= expected,
                }
            }
        }
    }

    fn detach(&mut self) {
        if let Err(err) = self.state.advance(self.kind.name(), ProducerState::Detached) {
            tracing::warn!("{}", err);
        }
        if let Some(attachment) = self.attachment.as_mut() {
            attachment.links.clear();
        }
    }

    fn stop(&mut self) {
        if let Some(mut attachment) = self.attachment.take() {
            attachment.collector.stop();
        }
        let malformed = self.buffer.malformed();
        if malformed > 0 {
            tracing::warn!("[{}] dropped {} short records", self.kind, malformed);
        }
        // Stopped is reachable from any state
        let _ = self.state.advance(self.kind.name(), ProducerState::Stopped);
    }

    fn collect(&self) -> Vec<Event> {
        self.buffer.snapshot()
    }
}

fn map_handle(object: &Object, name: &str) -> Result<MapHandle> {
    let map = object
        .maps()
        .find(|map| map.name() == OsStr::new(name))
        .with_context(|| format!("Map {name} not found"))?;
    MapHandle::try_from(&map).with_context(|| format!("Failed to get handle to map {name}"))
}

/// Thread ids of `pid` currently listed under `<proc_root>/<pid>/task`.
fn task_threads(proc_root: &Path, pid: u32) -> Vec<u32> {
    let dir = proc_root.join(pid.to_string()).join("task");
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_threads() {
        let dir = tempfile::tempdir().unwrap();
        let task = dir.path().join("42").join("task");
        fs::create_dir_all(task.join("42")).unwrap();
        fs::create_dir_all(task.join("43")).unwrap();
        fs::create_dir_all(task.join("not-a-tid")).unwrap();

        let mut tids = task_threads(dir.path(), 42);
        tids.sort();
        assert_eq!(tids, vec![42, 43]);
        assert!(task_threads(dir.path(), 7).is_empty());
    }

    #[test]
    fn test_install_missing_object_leaves_producer_inert() {
        let dir = tempfile::tempdir().unwrap();
        let opts = ProducerOptions {
            bpf_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let mut producer = BpfProducer::new(ProducerKind::Fork, opts, BootClock::fixed(0));
        let err = producer.install().unwrap_err();
        let err = err.downcast::<TraceError>().unwrap();
        assert!(matches!(err, TraceError::Install { .. }));
        assert_eq!(producer.state(), ProducerState::Uninstalled);
        assert!(producer.collect().is_empty());

        producer.stop();
        assert_eq!(producer.state(), ProducerState::Stopped);
    }
}
