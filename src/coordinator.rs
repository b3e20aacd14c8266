//! Drives every producer through install and the ordered stop protocol, then
//! fuses their buffers into one timestamp ordered stream.

use anyhow::Result;

use crate::error::TraceError;
use crate::event::Event;
use crate::producer::{DrainOutcome, DrainPolicy, Producer, ProducerState};

/// The fused event stream of a finished run plus how completely each
/// producer was drained.
#[derive(Debug, Default)]
pub struct FusedTrace {
    pub events: Vec<Event>,
    pub drains: Vec<DrainOutcome>,
}

impl FusedTrace {
    /// Records reported emitted by the kernel that never made it into the trace.
    pub fn missing(&self) -> u64 {
        self.drains.iter().map(DrainOutcome::missing).sum()
    }
}

pub struct Coordinator {
    producers: Vec<Box<dyn Producer>>,
    policy: DrainPolicy,
}

impl Coordinator {
    pub fn new(producers: Vec<Box<dyn Producer>>, policy: DrainPolicy) -> Self {
        Coordinator { producers, policy }
    }

    pub fn producers(&self) -> &[Box<dyn Producer>] {
        &self.producers
    }

    /// Install every producer independently.
    ///
    /// Returns how many installed. Fails only if none did, in which case every
    /// producer has already been stopped.
    pub fn install_all(&mut self) -> Result<usize> {
        let mut installed = 0;
        for producer in self.producers.iter_mut() {
            match producer.install() {
                Ok(()) => installed += 1,
                Err(err) => {
                    tracing::warn!("[{}] {:#}", producer.name(), err);
                    producer.stop();
                }
            }
        }

        if installed == 0 {
            return Err(TraceError::NoProducerInstalled.into());
        }
        tracing::info!(
            "{} of {} producers installed",
            installed,
            self.producers.len()
        );
        Ok(installed)
    }

    /// Stop collection without losing anything emitted before the freeze.
    ///
    /// Freeze all, snapshot all, drain each against its snapshot, detach,
    /// stop the collectors, then fuse. Producers that never installed are
    /// skipped by every step but the last.
    pub fn coordinated_stop(&mut self) -> FusedTrace {
        let mut frozen = vec![false; self.producers.len()];
        for (i, producer) in self.producers.iter_mut().enumerate() {
            if producer.state() != ProducerState::Running {
                continue;
            }
            match producer.freeze() {
                Ok(()) => {
                    tracing::debug!("[{}] frozen", producer.name());
                    frozen[i] = true;
                }
                Err(err) => tracing::warn!("[{}] freeze failed: {:#}", producer.name(), err),
            }
        }

        let totals: Vec<u64> = self
            .producers
            .iter()
            .zip(&frozen)
            .map(|(producer, &frozen)| if frozen { producer.snapshot_total() } else { 0 })
            .collect();

        let mut drains = Vec::new();
        for (i, producer) in self.producers.iter_mut().enumerate() {
            if !frozen[i] {
                continue;
            }
            let outcome = producer.drain_until(totals[i], &self.policy);
            if outcome.complete {
                tracing::debug!(
                    "[{}] drained {} events",
                    outcome.producer,
                    outcome.observed
                );
            } else {
                tracing::warn!(
                    "[{}] drain gave up: expected {} events, observed {}",
                    outcome.producer,
                    outcome.expected,
                    outcome.observed
                );
            }
            drains.push(outcome);

            producer.detach();
            tracing::debug!("[{}] detached", producer.name());
        }

        for producer in self.producers.iter_mut() {
            producer.stop();
        }

        let buffers = self
            .producers
            .iter()
            .map(|producer| producer.collect())
            .collect();
        FusedTrace {
            events: fuse(buffers),
            drains,
        }
    }
}

/// Concatenate per producer buffers, order by timestamp and rebase so the
/// earliest event sits at zero.
///
/// The sort is stable, so events with equal timestamps keep producer order.
pub fn fuse(buffers: Vec<Vec<Event>>) -> Vec<Event> {
    let mut events: Vec<Event> = buffers.into_iter().flatten().collect();
    events.sort_by_key(|event| event.timestamp);

    if let Some(base) = events.first().map(|event| event.timestamp) {
        for event in events.iter_mut() {
            event.timestamp -= base;
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use std::sync::{Arc, Mutex};

    /// Records the order lifecycle calls arrive in across producers.
    struct ScriptedProducer {
        name: String,
        state: ProducerState,
        install_ok: bool,
        emitted: u64,
        observed: u64,
        events: Vec<Event>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedProducer {
        fn boxed(
            name: &str,
            install_ok: bool,
            emitted: u64,
            observed: u64,
            events: Vec<Event>,
            log: &Arc<Mutex<Vec<String>>>,
        ) -> Box<dyn Producer> {
            Box::new(ScriptedProducer {
                name: name.to_string(),
                state: ProducerState::Uninstalled,
                install_ok,
                emitted,
                observed,
                events,
                log: log.clone(),
            })
        }

        fn record(&self, step: &str) {
            self.log.lock().unwrap().push(format!("{step}:{}", self.name));
        }
    }

    impl Producer for ScriptedProducer {
        fn name(&self) -> &str {
            &self.name
        }

        fn state(&self) -> ProducerState {
            self.state
        }

        fn install(&mut self) -> Result<()> {
            if !self.install_ok {
                return Err(TraceError::Install {
                    producer: self.name.clone(),
                    reason: "missing image".to_string(),
                }
                .into());
            }
            self.state.advance(&self.name, ProducerState::Running)?;
            Ok(())
        }

        fn freeze(&mut self) -> Result<()> {
            self.record("freeze");
            self.state.advance(&self.name, ProducerState::Frozen)?;
            Ok(())
        }

        fn snapshot_total(&self) -> u64 {
            self.record("snapshot");
            self.emitted
        }

        fn observed(&self) -> u64 {
            self.observed
        }

        fn drain_until(&mut self, expected: u64, _policy: &DrainPolicy) -> DrainOutcome {
            self.record("drain");
            self.state.advance(&self.name, ProducerState::Drained).unwrap();
            DrainOutcome {
                producer: self.name.clone(),
                expected,
                observed: self.observed,
                complete: self.observed >= expected,
            }
        }

        fn detach(&mut self) {
            self.record("detach");
            self.state.advance(&self.name, ProducerState::Detached).unwrap();
        }

        fn stop(&mut self) {
            self.record("stop");
            self.state.advance(&self.name, ProducerState::Stopped).unwrap();
        }

        fn collect(&self) -> Vec<Event> {
            self.events.clone()
        }
    }

    #[test]
    fn test_install_all_tolerates_partial_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = Coordinator::new(
            vec![
                ScriptedProducer::boxed("fork", false, 0, 0, vec![], &log),
                ScriptedProducer::boxed("exit", true, 0, 0, vec![], &log),
            ],
            DrainPolicy::default(),
        );
        assert_eq!(coordinator.install_all().unwrap(), 1);
        assert_eq!(
            coordinator.producers()[0].state(),
            ProducerState::Stopped
        );
        assert_eq!(
            coordinator.producers()[1].state(),
            ProducerState::Running
        );
    }

    #[test]
    fn test_install_all_fails_when_nothing_installs() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = Coordinator::new(
            vec![
                ScriptedProducer::boxed("fork", false, 0, 0, vec![], &log),
                ScriptedProducer::boxed("exit", false, 0, 0, vec![], &log),
            ],
            DrainPolicy::default(),
        );
        let err = coordinator.install_all().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TraceError>(),
            Some(TraceError::NoProducerInstalled)
        ));
    }

    #[test]
    fn test_stop_protocol_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = Coordinator::new(
            vec![
                ScriptedProducer::boxed("a", true, 1, 1, vec![], &log),
                ScriptedProducer::boxed("b", true, 2, 2, vec![], &log),
            ],
            DrainPolicy::default(),
        );
        coordinator.install_all().unwrap();
        coordinator.coordinated_stop();

        let log = log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec![
                "freeze:a",
                "freeze:b",
                "snapshot:a",
                "snapshot:b",
                "drain:a",
                "detach:a",
                "drain:b",
                "detach:b",
                "stop:a",
                "stop:b",
            ]
        );
        for producer in coordinator.producers() {
            assert_eq!(producer.state(), ProducerState::Stopped);
        }
    }

    #[test]
    fn test_stop_reports_drain_shortfall() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = Coordinator::new(
            vec![
                ScriptedProducer::boxed("switch", true, 10, 7, vec![], &log),
                ScriptedProducer::boxed("fork", false, 0, 0, vec![], &log),
            ],
            DrainPolicy::default(),
        );
        coordinator.install_all().unwrap();
        let trace = coordinator.coordinated_stop();
        assert_eq!(trace.drains.len(), 1);
        assert!(!trace.drains[0].complete);
        assert_eq!(trace.missing(), 3);
    }

    #[test]
    fn test_stop_fuses_buffers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = Coordinator::new(
            vec![
                ScriptedProducer::boxed(
                    "fork",
                    true,
                    2,
                    2,
                    vec![
                        Event::new(EventKind::Fork, 1, 1_030),
                        Event::new(EventKind::Fork, 1, 1_010),
                    ],
                    &log,
                ),
                ScriptedProducer::boxed(
                    "exit",
                    true,
                    1,
                    1,
                    vec![Event::new(EventKind::Exit, 2, 1_020)],
                    &log,
                ),
            ],
            DrainPolicy::default(),
        );
        coordinator.install_all().unwrap();
        let trace = coordinator.coordinated_stop();
        let stamps: Vec<u64> = trace.events.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![0, 10, 20]);
        assert_eq!(trace.events[1].kind, EventKind::Exit);
    }

    #[test]
    fn test_fuse_rebases_to_zero() {
        let fused = fuse(vec![
            vec![
                Event::new(EventKind::Run, 5, 500),
                Event::new(EventKind::Desched, 5, 900),
            ],
            vec![Event::new(EventKind::Fork, 1, 300)],
            vec![],
        ]);
        assert_eq!(fused.len(), 3);
        assert_eq!(fused[0].timestamp, 0);
        assert!(fused.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_eq!(fused[2].timestamp, 600);
    }

    #[test]
    fn test_fuse_empty() {
        assert!(fuse(vec![vec![], vec![]]).is_empty());
    }
}
