// tripwire/src/client/load.rs
//
// Host load estimate for the adaptive scheduler. A load factor of 1.0 means
// idle; larger values stretch check intervals.
//
// SchedulerLagProbe infers load from the runtime itself: a wakeup scheduled
// for T that fires at T + lag means the host is busy. Ratio actual/expected
// is smoothed (EWMA) and shared by every detector task of one client.

use std::time::Duration;

use parking_lot::Mutex;

pub trait LoadProbe: Send + Sync {
    fn load_factor(&self) -> f32;

    /// Called after each suspension with the wait asked for and the wait observed.
    fn observe_wakeup(&self, _expected: Duration, _actual: Duration) {}
}

/// Constant load. Tests and hosts with their own load source.
#[derive(Debug, Clone, Copy)]
pub struct FixedLoad(pub f32);

impl LoadProbe for FixedLoad {
    fn load_factor(&self) -> f32 { self.0.max(1.0) }
}

const EWMA_ALPHA: f32 = 0.3;

pub struct SchedulerLagProbe {
    max_load_factor: f32,
    smoothed:        Mutex<f32>,
}

impl SchedulerLagProbe {
    pub fn new(max_load_factor: f32) -> Self {
        Self { max_load_factor: max_load_factor.max(1.0), smoothed: Mutex::new(1.0) }
    }
}

impl LoadProbe for SchedulerLagProbe {
    fn load_factor(&self) -> f32 {
        *self.smoothed.lock()
    }

    fn observe_wakeup(&self, expected: Duration, actual: Duration) {
        if expected.is_zero() { return; }
        let ratio = (actual.as_secs_f32() / expected.as_secs_f32()).clamp(1.0, self.max_load_factor);
        let mut s = self.smoothed.lock();
        *s = (*s + EWMA_ALPHA * (ratio - *s)).clamp(1.0, self.max_load_factor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_time_wakeups_stay_at_one() {
        let p = SchedulerLagProbe::new(4.0);
        for _ in 0..10 {
            p.observe_wakeup(Duration::from_millis(100), Duration::from_millis(100));
        }
        assert_eq!(p.load_factor(), 1.0);
    }

    #[test]
    fn late_wakeups_raise_load_up_to_cap() {
        let p = SchedulerLagProbe::new(4.0);
        p.observe_wakeup(Duration::from_millis(100), Duration::from_millis(300));
        let first = p.load_factor();
        assert!(first > 1.0 && first < 3.0);
        for _ in 0..100 {
            p.observe_wakeup(Duration::from_millis(100), Duration::from_secs(10));
        }
        assert!((p.load_factor() - 4.0).abs() < 1e-3);
    }

    #[test]
    fn fixed_load_never_below_one() {
        assert_eq!(FixedLoad(0.2).load_factor(), 1.0);
        assert_eq!(FixedLoad(2.5).load_factor(), 2.5);
    }
}
