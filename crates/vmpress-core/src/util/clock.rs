use std::cell::Cell;
use std::time::{Duration, Instant};

/// Source of coarse ticks and fine-grained cycle counts.
///
/// Ticks play the role of the scheduler tick: rate limiting and give-up
/// ceilings are expressed in them. Cycles time a single allocation attempt.
pub trait Clock {
    /// Ticks per second.
    fn hz(&self) -> u64;

    /// Monotonic tick counter.
    fn ticks(&self) -> u64;

    /// High-resolution cycle counter.
    fn cycles(&self) -> u64;

    /// Returns once the tick counter has reached `tick`, sleeping rather
    /// than spinning in between.
    fn wait_until(&self, tick: u64);
}

/// Wall clock backed by [`Instant`] with millisecond ticks.
///
/// Cycles come from the time stamp counter on x86_64 and from elapsed
/// nanoseconds elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    /// Creates a clock whose tick zero is now.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn hz(&self) -> u64 {
        1000
    }

    fn ticks(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    #[cfg(target_arch = "x86_64")]
    fn cycles(&self) -> u64 {
        unsafe { std::arch::x86_64::_rdtsc() }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn cycles(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn wait_until(&self, tick: u64) {
        let now = self.ticks();
        if now < tick {
            std::thread::sleep(Duration::from_millis(tick - now));
        }
    }
}

/// Deterministic clock that advances by a fixed step on every read.
///
/// Each call to [`Clock::ticks`] returns the current value and then moves
/// the clock forward by `tick_step`; [`Clock::cycles`] does the same with
/// `cycle_step`, so timings in reports are reproducible. Waiting jumps the
/// tick counter straight to the target.
#[derive(Debug)]
pub struct SteppingClock {
    hz: u64,
    tick: Cell<u64>,
    tick_step: u64,
    cycle: Cell<u64>,
    cycle_step: u64,
}

impl SteppingClock {
    /// Creates a clock running at `hz` that advances `tick_step` ticks per read.
    pub fn new(hz: u64, tick_step: u64) -> Self {
        Self {
            hz,
            tick: Cell::new(0),
            tick_step,
            cycle: Cell::new(0),
            cycle_step: 1000,
        }
    }

    /// Sets how many cycles pass between two cycle reads.
    pub fn with_cycle_step(mut self, cycle_step: u64) -> Self {
        self.cycle_step = cycle_step;
        self
    }

    /// Moves the clock forward without reading it.
    pub fn advance(&self, ticks: u64) {
        self.tick.set(self.tick.get() + ticks);
    }
}

impl Clock for SteppingClock {
    fn hz(&self) -> u64 {
        self.hz
    }

    fn ticks(&self) -> u64 {
        let now = self.tick.get();
        self.tick.set(now + self.tick_step);
        now
    }

    fn cycles(&self) -> u64 {
        let now = self.cycle.get();
        self.cycle.set(now + self.cycle_step);
        now
    }

    fn wait_until(&self, tick: u64) {
        if self.tick.get() < tick {
            self.tick.set(tick);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, SteppingClock, SystemClock};

    #[test]
    fn test_stepping_clock_advances_per_read() {
        let clock = SteppingClock::new(100, 2);
        assert_eq!(clock.ticks(), 0);
        assert_eq!(clock.ticks(), 2);
        clock.advance(10);
        assert_eq!(clock.ticks(), 14);
        assert_eq!(clock.cycles(), 0);
        assert_eq!(clock.cycles(), 1000);
        clock.wait_until(40);
        assert_eq!(clock.ticks(), 40);
        clock.wait_until(10);
        assert_eq!(clock.ticks(), 42);
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let clock = SystemClock::new();
        let a = clock.ticks();
        let b = clock.ticks();
        assert!(b >= a);
        assert_eq!(clock.hz(), 1000);
    }

    #[test]
    fn test_system_clock_sleeps_until_target() {
        let clock = SystemClock::new();
        let target = clock.ticks() + 5;
        clock.wait_until(target);
        assert!(clock.ticks() >= target);
    }
}
