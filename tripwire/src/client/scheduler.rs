// tripwire/src/client/scheduler.rs
//
// AdaptiveScheduler: per-detector check interval from suspicion and load.
//
//   interval    = clamp(base · scale(suspicion) · load, min, max)
//   scale(s)    = 1 − (s / max_suspicion) · (1 − min_scale)      1 → min_scale
//   trigger     : suspicion += increment
//   clean run   : suspicion *= (1 − decay)
//
// Detectors that keep firing get polled harder; quiet ones back off.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct SchedulerState {
    pub base_interval:    Duration,
    pub current_interval: Duration,
    pub suspicion:        f32,
    pub last_run_at:      Option<Instant>,
    pub runs:             u64,
    pub triggers:         u64,
}

#[derive(Debug, Clone)]
pub struct AdaptiveScheduler {
    min_interval:    Duration,
    max_interval:    Duration,
    max_suspicion:   f32,
    increment:       f32,
    decay:           f32,
    min_scale:       f32,
    max_load_factor: f32,
}

impl AdaptiveScheduler {
    pub fn from_config(cfg: &SchedulerConfig) -> Self {
        Self {
            min_interval:    Duration::from_millis(cfg.min_interval_ms),
            max_interval:    Duration::from_millis(cfg.max_interval_ms.max(cfg.min_interval_ms)),
            max_suspicion:   cfg.max_suspicion.max(f32::EPSILON),
            increment:       cfg.suspicion_increment,
            decay:           cfg.suspicion_decay.clamp(0.0, 1.0),
            min_scale:       cfg.min_scale.clamp(f32::EPSILON, 1.0),
            max_load_factor: cfg.max_load_factor.max(1.0),
        }
    }

    pub fn max_suspicion(&self) -> f32 { self.max_suspicion }

    pub fn new_state(&self, base_interval: Duration) -> SchedulerState {
        SchedulerState {
            base_interval,
            current_interval: self.compute_interval(base_interval, 0.0, 1.0),
            suspicion:        0.0,
            last_run_at:      None,
            runs:             0,
            triggers:         0,
        }
    }

    /// Monotonically decreasing in suspicion: 1 at zero, `min_scale` at max.
    pub fn scale_factor(&self, suspicion: f32) -> f32 {
        let s = suspicion.clamp(0.0, self.max_suspicion);
        1.0 - (s / self.max_suspicion) * (1.0 - self.min_scale)
    }

    pub fn compute_interval(&self, base: Duration, suspicion: f32, load_factor: f32) -> Duration {
        let load = if load_factor.is_finite() { load_factor.clamp(1.0, self.max_load_factor) } else { 1.0 };
        let secs = base.as_secs_f64() * self.scale_factor(suspicion) as f64 * load as f64;
        // Products too large for a Duration saturate at the ceiling.
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_interval)
            .clamp(self.min_interval, self.max_interval)
    }

    /// Nudge suspicion by `delta`, bounded to [0, max_suspicion].
    pub fn adjust_suspicion(&self, state: &mut SchedulerState, delta: f32) {
        state.suspicion = (state.suspicion + delta).clamp(0.0, self.max_suspicion);
    }

    /// Account for one completed run and derive the next wait.
    pub fn record_run(&self, state: &mut SchedulerState, triggered: bool, load_factor: f32, now: Instant) -> Duration {
        state.runs += 1;
        state.last_run_at = Some(now);
        if triggered {
            state.triggers += 1;
            self.adjust_suspicion(state, self.increment);
        } else {
            let shed = state.suspicion * self.decay;
            self.adjust_suspicion(state, -shed);
        }
        state.current_interval = self.compute_interval(state.base_interval, state.suspicion, load_factor);
        state.current_interval
    }
}
