//! Clocks, timebases, and pipeline deadlines.
//!
//! Pipeline time is expressed in seconds as `f64`. A target either derives
//! it on its own (wall clock since start, or elapsed frames over frame rate)
//! or delegates to an attached [`Timebase`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Nanoseconds per second.
pub const SEC2NS: f64 = 1_000_000_000.0;

/// A pluggable clock supplying pipeline time.
pub trait Timebase: Send + Sync {
    /// Current time in seconds.
    fn time(&self) -> f64;

    /// Whether this clock follows wall-clock time.
    fn is_real_time(&self) -> bool;
}

/// A point in pipeline time to wait for.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Deadline {
    /// Do not wait at all.
    Asap,
    /// Wait until the target stops rendering.
    NotRendering,
    /// Wait until pipeline time reaches the given number of seconds.
    At(f64),
}

impl Deadline {
    /// Whether pipeline time `now` satisfies this deadline while rendering.
    pub fn reached(&self, now: f64) -> bool {
        match self {
            Deadline::Asap => true,
            Deadline::NotRendering => false,
            Deadline::At(t) => now >= *t,
        }
    }
}

/// A monotonic wall clock anchored to a fixed epoch.
#[derive(Debug, Clone)]
pub struct WallClock {
    /// The instant the clock started.
    epoch: Instant,

    /// Wall-clock time at epoch (RFC 3339 string).
    epoch_wall: String,
}

impl WallClock {
    /// Create a new clock anchored to now.
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
            epoch_wall: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// Nanoseconds elapsed since the epoch.
    pub fn elapsed_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    /// Seconds elapsed since the epoch.
    pub fn elapsed_secs(&self) -> f64 {
        Self::ns_to_secs(self.elapsed_ns())
    }

    /// Wall-clock time at the epoch.
    pub fn epoch_wall(&self) -> &str {
        &self.epoch_wall
    }

    pub fn ns_to_secs(ns: u64) -> f64 {
        ns as f64 / SEC2NS
    }

    pub fn secs_to_ns(secs: f64) -> u64 {
        (secs.max(0.0) * SEC2NS) as u64
    }
}

impl Timebase for WallClock {
    fn time(&self) -> f64 {
        self.elapsed_secs()
    }

    fn is_real_time(&self) -> bool {
        true
    }
}

/// An externally driven timebase, e.g. slaved to an audio device position
/// or stepped by hand in offline renders.
#[derive(Debug, Default)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(time: f64) -> Self {
        Self {
            bits: AtomicU64::new(time.to_bits()),
        }
    }

    pub fn set(&self, time: f64) {
        self.bits.store(time.to_bits(), Ordering::SeqCst);
    }

    /// Move the clock forward by `delta` seconds and return the new time.
    pub fn advance(&self, delta: f64) -> f64 {
        let mut current = self.bits.load(Ordering::SeqCst);
        loop {
            let next = (f64::from_bits(current) + delta).to_bits();
            match self
                .bits
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return f64::from_bits(next),
                Err(actual) => current = actual,
            }
        }
    }
}

impl Timebase for ManualClock {
    fn time(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }

    fn is_real_time(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_elapsed() {
        let clock = WallClock::start();
        assert!(clock.elapsed_ns() < 1_000_000_000);
        assert!(clock.is_real_time());
    }

    #[test]
    fn test_ns_to_secs_conversion() {
        assert!((WallClock::ns_to_secs(1_500_000_000) - 1.5).abs() < 1e-9);
        assert_eq!(WallClock::secs_to_ns(2.0), 2_000_000_000);
        assert_eq!(WallClock::secs_to_ns(-1.0), 0);
    }

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(0.25);
        assert_eq!(clock.advance(0.5), 0.75);
        clock.set(2.0);
        assert_eq!(clock.time(), 2.0);
        assert!(!clock.is_real_time());
    }

    proptest::proptest! {
        #[test]
        fn test_manual_clock_never_runs_backwards(deltas in proptest::collection::vec(0.0f64..10.0, 0..50)) {
            let clock = ManualClock::default();
            let mut previous = clock.time();
            for delta in &deltas {
                let now = clock.advance(*delta);
                proptest::prop_assert!(now >= previous);
                previous = now;
            }
            let sum: f64 = deltas.iter().sum();
            proptest::prop_assert!((clock.time() - sum).abs() < 1e-6);
        }
    }

    #[test]
    fn test_deadline_reached() {
        assert!(Deadline::Asap.reached(0.0));
        assert!(!Deadline::NotRendering.reached(1e9));
        assert!(!Deadline::At(0.5).reached(0.2));
        assert!(Deadline::At(0.5).reached(0.5));
    }
}
