// tripwire/src/client/detector.rs
//
// Client-side detectors and their cooperative tasks.
//
// A detector is a fixed interface (name, base interval, check, optional
// start/stop hooks), registered once in a typed registry that refuses
// duplicate names. Each registered detector runs as its own tokio task:
//
//   loop {
//       sleep(current_interval)          ← the only suspension point
//       if stop flag set → exit
//       check()                          ← runs to completion, no I/O
//       Triggered → sink.submit(..)      ← fire-and-forget
//       scheduler.record_run(..)         ← next interval
//   }
//
// Tasks share nothing but the load probe and the report sink.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::client::agent::ReportSink;
use crate::client::load::LoadProbe;
use crate::client::scheduler::{AdaptiveScheduler, SchedulerState};
use crate::error::RegistryError;
use crate::events::Payload;

#[derive(Debug, Clone, PartialEq)]
pub enum CheckOutcome {
    Clean,
    Triggered { detection_type: String, payload: Payload },
}

pub trait Detector: Send {
    fn name(&self) -> &str;
    fn base_interval(&self) -> Duration;
    fn check(&mut self) -> CheckOutcome;
    fn start(&mut self) {}
    fn stop(&mut self) {}
}

// ── Cancellation ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self { Self::default() }
    pub fn stop(&self) { self.0.store(true, Ordering::Release); }
    pub fn is_stopped(&self) -> bool { self.0.load(Ordering::Acquire) }
}

// ── Registry ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct DetectorRegistry {
    detectors: Vec<Box<dyn Detector>>,
    names:     HashSet<String>,
}

impl DetectorRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, detector: Box<dyn Detector>) -> Result<(), RegistryError> {
        let name = detector.name().to_string();
        if !self.names.insert(name.clone()) {
            return Err(RegistryError::Duplicate(name));
        }
        self.detectors.push(detector);
        Ok(())
    }

    pub fn len(&self) -> usize { self.detectors.len() }
    pub fn is_empty(&self) -> bool { self.detectors.is_empty() }

    pub fn names(&self) -> Vec<String> {
        self.detectors.iter().map(|d| d.name().to_string()).collect()
    }

    /// Spawn one task per detector. Each handle yields the task's final state.
    pub fn spawn_all(
        self,
        scheduler: Arc<AdaptiveScheduler>,
        load:      Arc<dyn LoadProbe>,
        sink:      Arc<dyn ReportSink>,
        stop:      StopSignal,
    ) -> Vec<JoinHandle<SchedulerState>> {
        self.detectors
            .into_iter()
            .map(|detector| {
                let task = DetectorTask {
                    detector,
                    scheduler: Arc::clone(&scheduler),
                    load:      Arc::clone(&load),
                    sink:      Arc::clone(&sink),
                    stop:      stop.clone(),
                };
                tokio::spawn(task.run())
            })
            .collect()
    }
}

// ── Task ──────────────────────────────────────────────────────────────────────

pub struct DetectorTask {
    pub detector:  Box<dyn Detector>,
    pub scheduler: Arc<AdaptiveScheduler>,
    pub load:      Arc<dyn LoadProbe>,
    pub sink:      Arc<dyn ReportSink>,
    pub stop:      StopSignal,
}

impl DetectorTask {
    pub async fn run(mut self) -> SchedulerState {
        self.detector.start();
        let mut state = self.scheduler.new_state(self.detector.base_interval());
        info!(detector = self.detector.name(), interval = ?state.current_interval, "detector started");

        loop {
            let wait = state.current_interval;
            let slept_from = Instant::now();
            tokio::time::sleep(wait).await;
            self.load.observe_wakeup(wait, slept_from.elapsed());

            if self.stop.is_stopped() {
                break;
            }

            let triggered = match self.detector.check() {
                CheckOutcome::Clean => false,
                CheckOutcome::Triggered { detection_type, payload } => {
                    debug!(detector = self.detector.name(), detection_type = %detection_type, "triggered");
                    self.sink.submit(detection_type, payload);
                    true
                }
            };
            self.scheduler.record_run(&mut state, triggered, self.load.load_factor(), Instant::now());
        }

        self.detector.stop();
        info!(detector = self.detector.name(), runs = state.runs, triggers = state.triggers, "detector stopped");
        state
    }
}
