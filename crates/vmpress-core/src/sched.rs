//! Cooperative yield points.
//!
//! Stress loops call [`YieldPoint::checkpoint`] once per iteration. Whether a
//! checkpoint actually hands the CPU back is up to the implementation: under
//! a preemptive scheduler [`NoYield`] does nothing, while
//! [`CooperativeYield`] yields at a bounded frequency so a long pass cannot
//! monopolise the system.

use log::trace;

/// A point in a loop where the harness may give control back to the scheduler.
pub trait YieldPoint {
    /// Checks whether to yield, and yields if so.
    fn checkpoint(&mut self);

    /// Number of times this yield point actually yielded.
    fn yields(&self) -> u64;

    /// Number of checkpoints passed, yielding or not.
    fn checks(&self) -> u64;
}

/// Yield point for preemptive schedulers: counts checks, never yields.
#[derive(Debug, Default, Clone)]
pub struct NoYield {
    checks: u64,
}

impl YieldPoint for NoYield {
    fn checkpoint(&mut self) {
        self.checks += 1;
    }

    fn yields(&self) -> u64 {
        0
    }

    fn checks(&self) -> u64 {
        self.checks
    }
}

/// Hands control back via [`std::thread::yield_now`] once every `every` checks.
#[derive(Debug, Clone)]
pub struct CooperativeYield {
    every: u64,
    checks: u64,
    yields: u64,
}

impl CooperativeYield {
    /// Default number of checks between two yields.
    pub const DEFAULT_EVERY: u64 = 64;

    /// Creates a yield point that yields every `every` checks (at least every check).
    pub fn new(every: u64) -> Self {
        Self {
            every: every.max(1),
            checks: 0,
            yields: 0,
        }
    }
}

impl Default for CooperativeYield {
    fn default() -> Self {
        Self::new(Self::DEFAULT_EVERY)
    }
}

impl YieldPoint for CooperativeYield {
    fn checkpoint(&mut self) {
        self.checks += 1;
        if self.checks.is_multiple_of(self.every) {
            trace!("yielding after {} checks", self.checks);
            std::thread::yield_now();
            self.yields += 1;
        }
    }

    fn yields(&self) -> u64 {
        self.yields
    }

    fn checks(&self) -> u64 {
        self.checks
    }
}

#[cfg(test)]
mod tests {
    use super::{CooperativeYield, NoYield, YieldPoint};

    #[test]
    fn test_cooperative_yield_frequency() {
        let mut y = CooperativeYield::new(4);
        for _ in 0..10 {
            y.checkpoint();
        }
        assert_eq!(y.checks(), 10);
        assert_eq!(y.yields(), 2);
    }

    #[test]
    fn test_cooperative_yield_zero_means_every_check() {
        let mut y = CooperativeYield::new(0);
        y.checkpoint();
        y.checkpoint();
        assert_eq!(y.yields(), 2);
    }

    #[test]
    fn test_no_yield_counts_only() {
        let mut y = NoYield::default();
        y.checkpoint();
        assert_eq!(y.checks(), 1);
        assert_eq!(y.yields(), 0);
    }
}
