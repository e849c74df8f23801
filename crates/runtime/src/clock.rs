//! clock

use std::{
    sync::atomic::{AtomicU64, Ordering},
    time::{Instant, SystemTime, UNIX_EPOCH},
};

/// Source of the millisecond timestamps the reactor uses to order timers.
///
/// The reactor only ever asks for `now_millis()`; everything else (interval
/// advancement, overload detection) is built on top of that single value.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// The default clock: backed by [`Instant`], which the standard library
/// already guarantees is monotonic on every supported platform. No drift
/// correction is needed.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
    origin_millis: u64,
}

impl MonotonicClock {
    pub fn new() -> Self {
        let origin_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            origin: Instant::now(),
            origin_millis,
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.origin_millis + self.origin.elapsed().as_millis() as u64
    }
}

/// A clock for platforms whose only time source is a wall clock that can
/// jump backward (NTP slew, VM snapshot resume, operator correction).
///
/// Each call samples the wall clock and compares it against the last sample.
/// A backward jump is absorbed by holding the exposed time steady until the
/// wall clock catches back up; a forward jump larger than `max_forward_jump`
/// is treated the same way a backward jump is, since it almost certainly
/// indicates the same kind of external correction rather than real elapsed
/// time. This keeps timer ordering monotonic even though the underlying
/// source is not.
pub struct DriftCorrectedClock<F> {
    wall_clock: F,
    max_forward_jump_millis: u64,
    last_wall: AtomicU64,
    exposed: AtomicU64,
}

impl<F> DriftCorrectedClock<F>
where
    F: Fn() -> u64 + Send + Sync,
{
    pub fn new(wall_clock: F, max_forward_jump_millis: u64) -> Self {
        let initial = wall_clock();
        Self {
            wall_clock,
            max_forward_jump_millis,
            last_wall: AtomicU64::new(initial),
            exposed: AtomicU64::new(initial),
        }
    }
}

impl<F> Clock for DriftCorrectedClock<F>
where
    F: Fn() -> u64 + Send + Sync,
{
    fn now_millis(&self) -> u64 {
        let sample = (self.wall_clock)();
        let last = self.last_wall.swap(sample, Ordering::AcqRel);
        let forward_delta = sample.saturating_sub(last);
        let jumped = sample < last || forward_delta > self.max_forward_jump_millis;
        if jumped {
            // Hold the exposed clock steady rather than stepping it backward
            // or leaping it forward; subsequent calls resume advancing from
            // whatever we last exposed once the wall clock re-settles.
            self.exposed.load(Ordering::Acquire)
        } else {
            self.exposed.fetch_add(forward_delta, Ordering::AcqRel) + forward_delta
        }
    }
}
