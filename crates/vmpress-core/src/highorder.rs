//! High-order allocation test.
//!
//! Repeatedly allocates blocks of `2^order` contiguous pages, keeping every
//! success until the end of the run so later attempts see a progressively
//! more fragmented allocator. Every attempt is timed in cycles and followed
//! by a snapshot of the free block counts, whether it succeeded or not.
//!
//! Output goes to three channels: the summary report, one timing entry per
//! attempt, and one fragmentation block per attempt.

use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::allocator::{AllocMode, PageAllocator, ZoneClass};
use crate::error::{ParameterError, TestError};
use crate::executor::Harness;
use crate::report::ReportChannel;
use crate::util::{BUDDYINFO_BLOCK_BYTES, MAX_ORDER, TIMING_LINE_BYTES, percent};

/// Attempts between two progress messages and timing line breaks.
const PROGRESS_EVERY: u64 = 10;

/// The three output channels of a high-order run.
pub struct HighOrderChannels<'a> {
    /// Summary and completion message
    pub report: &'a mut dyn ReportChannel,
    /// Cycle count of each attempt; failures are prefixed with `-`
    pub timings: &'a mut dyn ReportChannel,
    /// Free block counts after each attempt
    pub buddyinfo: &'a mut dyn ReportChannel,
}

/// Why a high-order run stopped before its last attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum AbortReason {
    /// One successful allocation took longer than the success ceiling
    SlowSuccess,
    /// Failed attempts took longer than the failure ceiling in total
    FailureBudget,
}

/// Timing of one attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct AttemptTiming {
    /// Attempt number, starting at 1
    pub attempt: u64,
    /// Cycles spent in the allocator
    pub cycles: u64,
    /// Whether the attempt returned a block
    pub success: bool,
}

/// State and result of a high-order run.
#[derive(Clone, Debug, Serialize)]
pub struct HighOrderSummary {
    /// Block order attempted
    pub order: usize,
    /// Allocation mode used
    pub mode: AllocMode,
    /// Attempts asked for
    pub requested: u64,
    /// Attempts made
    pub attempted: u64,
    /// Attempts that returned a block
    pub successes: u64,
    /// Attempts that returned nothing
    pub failures: u64,
    /// Successful blocks per zone of origin
    pub zone_tally: BTreeMap<ZoneClass, u64>,
    /// Per-attempt timings
    pub timings: Vec<AttemptTiming>,
    /// Set if the run stopped early
    pub abort: Option<AbortReason>,
    /// Attempt at which the run stopped early
    pub aborted_at: Option<u64>,
    /// `successes * 100 / attempted`
    pub success_percentage: Option<u64>,
    /// Cooperative yields during the run
    pub yields: u64,
}

impl HighOrderSummary {
    fn new(order: usize, mode: AllocMode, requested: u64) -> Self {
        Self {
            order,
            mode,
            requested,
            attempted: 0,
            successes: 0,
            failures: 0,
            zone_tally: BTreeMap::new(),
            timings: Vec::new(),
            abort: None,
            aborted_at: None,
            success_percentage: None,
            yields: 0,
        }
    }

    /// The completion message of the run.
    pub fn finish_message(&self) -> String {
        match self.aborted_at {
            None => "Test completed successfully".to_string(),
            Some(n) => format!("Test aborted after {} allocations due to delays", n),
        }
    }
}

fn duration_to_ticks(d: Duration, hz: u64) -> u64 {
    (d.as_millis() as u64).saturating_mul(hz) / 1000
}

impl<A: PageAllocator> Harness<A> {
    /// Makes `count` attempts to allocate a block of `2^order` pages.
    ///
    /// Attempts are spaced at least `hz / hz_fraction` ticks apart. Each
    /// attempt passes the yield point once and then sleeps out the rest of
    /// the interval. The run gives up early when one success takes longer
    /// than the success ceiling or failures have used up the failure
    /// ceiling; partial results are still reported. All blocks are freed before the summary is written.
    ///
    /// # Errors
    ///
    /// Returns [`TestError::Parameter`] if `order` is not below
    /// [`MAX_ORDER`] or `count` is zero, and
    /// [`TestError::ResourceExhaustion`] if the handle array cannot be
    /// allocated.
    pub fn run_highorder(
        &mut self,
        order: usize,
        count: u64,
        channels: HighOrderChannels<'_>,
    ) -> Result<HighOrderSummary, TestError> {
        let HighOrderChannels {
            report: out,
            timings,
            buddyinfo,
        } = channels;
        out.open();
        timings.open();
        buddyinfo.open();

        let result = self.attempt_all(order, count, out, timings, buddyinfo);
        if let Err(e) = &result {
            report!(*out, "ERROR: {}\nTest failed\n", e);
        }

        out.close();
        timings.close();
        buddyinfo.close();
        result
    }

    fn attempt_all(
        &mut self,
        order: usize,
        count: u64,
        out: &mut dyn ReportChannel,
        timings: &mut dyn ReportChannel,
        buddyinfo: &mut dyn ReportChannel,
    ) -> Result<HighOrderSummary, TestError> {
        if order >= MAX_ORDER {
            return Err(ParameterError::InvalidOrder(order).into());
        }
        if count == 0 {
            return Err(ParameterError::ZeroAttempts.into());
        }

        let mut handles: Vec<A::Handle> = Vec::new();
        if handles.try_reserve_exact(count as usize).is_err() {
            return Err(TestError::ResourceExhaustion(count));
        }

        let nodes = self.allocator.free_areas().map_or(1, |a| a.len().max(1));
        timings.reserve_bytes(count as usize * TIMING_LINE_BYTES);
        buddyinfo.reserve_bytes(count as usize * BUDDYINFO_BLOCK_BYTES * nodes);

        let mode = self.config.mode;
        let hz = self.clock.hz();
        let interval = hz / self.config.hz_fraction.max(1);
        let success_ceiling = duration_to_ticks(self.config.success_ceiling, hz);
        let failure_ceiling = duration_to_ticks(self.config.failure_ceiling, hz);
        info!(
            "High order run: order {}, {} attempts, {:?} allocations",
            order, count, mode
        );

        let mut state = HighOrderSummary::new(order, mode, count);
        let mut failure_ticks = 0u64;
        let yields_before = self.yielder.yields();
        let bar = self.progress_bar(count, "High order attempt");
        let mut next = self.clock.ticks();
        let mut last = next;

        for attempt in 1..=count {
            self.yielder.checkpoint();
            self.clock.wait_until(next);
            let now = self.clock.ticks();
            next = now + interval;

            if now.saturating_sub(last) > hz {
                info!(
                    "High order alloc test attempts: {} ({})",
                    attempt - 1,
                    handles.len()
                );
            }
            if attempt > 1 && (attempt - 1).is_multiple_of(PROGRESS_EVERY) {
                report!(*timings, "\n");
                info!(
                    "High order alloc test attempts: {} ({})",
                    attempt - 1,
                    handles.len()
                );
                if let Some(bar) = &bar {
                    bar.set_position(attempt - 1);
                }
            }

            last = self.clock.ticks();
            let start_cycles = self.clock.cycles();
            let block = self.allocator.allocate(order, mode);
            let cycles = self.clock.cycles().saturating_sub(start_cycles);
            let took = self.clock.ticks().saturating_sub(last);
            state.attempted = attempt;

            let success = block.is_some();
            state.timings.push(AttemptTiming {
                attempt,
                cycles,
                success,
            });
            if success {
                report!(*timings, "{:<11} ", cycles);
            } else {
                report!(*timings, "-{:<10} ", cycles);
            }
            self.snapshot_free_areas(buddyinfo, attempt, success);

            match block {
                Some(handle) => {
                    state.successes += 1;
                    *state
                        .zone_tally
                        .entry(self.allocator.zone_of(&handle))
                        .or_insert(0) += 1;
                    handles.push(handle);
                    if took > success_ceiling {
                        warn!(
                            "Took more than {} seconds to allocate a block, giving up",
                            self.config.success_ceiling.as_secs()
                        );
                        state.abort = Some(AbortReason::SlowSuccess);
                        state.aborted_at = Some(attempt);
                        break;
                    }
                }
                None => {
                    state.failures += 1;
                    failure_ticks += took;
                    if failure_ticks > failure_ceiling {
                        warn!(
                            "Took more than {} seconds and still failed to allocate, giving up",
                            self.config.failure_ceiling.as_secs()
                        );
                        state.abort = Some(AbortReason::FailureBudget);
                        state.aborted_at = Some(attempt);
                        break;
                    }
                }
            }
        }
        if let Some(bar) = bar {
            bar.finish();
        }
        state.yields = self.yielder.yields() - yields_before;
        state.success_percentage = percent(state.successes, state.attempted);

        info!("Test complete, freeing {} blocks", handles.len());
        while let Some(handle) = handles.pop() {
            self.allocator.free(handle, order);
        }

        report!(*out, "Order:                 {}\n", order);
        report!(*out, "Allocation type:       {:?}\n", mode);
        report!(*out, "Requested allocations: {}\n", count);
        report!(*out, "Attempted allocations: {}\n", state.attempted);
        report!(*out, "Success allocs:        {}\n", state.successes);
        report!(*out, "Failed allocs:         {}\n", state.failures);
        for zone in ZoneClass::ALL {
            let label = format!("{} zone allocs:", zone);
            report!(
                *out,
                "{:<23}{}\n",
                label,
                state.zone_tally.get(&zone).copied().unwrap_or(0)
            );
        }
        report!(
            *out,
            "% Success:             {}\n",
            state.success_percentage.unwrap_or(0)
        );
        let finish = state.finish_message();
        report!(*out, "{}\n", finish);
        info!("{}", finish);
        Ok(state)
    }

    fn snapshot_free_areas(&self, buddyinfo: &mut dyn ReportChannel, attempt: u64, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        report!(*buddyinfo, "Buddyinfo {} attempt {}\n", outcome, attempt);
        match self.allocator.free_areas() {
            Ok(areas) => {
                for area in areas {
                    report!(*buddyinfo, "{}\n", area);
                }
            }
            Err(e) => {
                debug!("free areas unavailable: {}", e);
                report!(*buddyinfo, "unavailable: {}\n", e);
            }
        }
        report!(*buddyinfo, "\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Watermarks;
    use crate::executor::HarnessConfig;
    use crate::report::ReportBuffer;
    use crate::sched::{NoYield, YieldPoint};
    use crate::testing::FakeAllocator;
    use crate::util::SteppingClock;

    struct Channels {
        report: ReportBuffer,
        timings: ReportBuffer,
        buddyinfo: ReportBuffer,
    }

    impl Channels {
        fn new() -> Self {
            Self {
                report: ReportBuffer::new("highalloc"),
                timings: ReportBuffer::new("highalloc_timings"),
                buddyinfo: ReportBuffer::new("highalloc_buddyinfo"),
            }
        }

        fn borrow(&mut self) -> HighOrderChannels<'_> {
            HighOrderChannels {
                report: &mut self.report,
                timings: &mut self.timings,
                buddyinfo: &mut self.buddyinfo,
            }
        }
    }

    fn harness(clock: SteppingClock) -> Harness<FakeAllocator> {
        Harness::new(
            FakeAllocator::new(10_000, 20_000, Watermarks::default()),
            HarnessConfig::default(),
        )
        .with_clock(clock)
        .with_yield(NoYield::default())
    }

    #[test]
    fn test_failures_after_ten_complete_normally() -> anyhow::Result<()> {
        let mut h = harness(SteppingClock::new(100, 1));
        h.allocator_mut().fail_after = Some(10);
        let mut ch = Channels::new();
        let s = h.run_highorder(3, 50, ch.borrow())?;
        assert_eq!(s.successes, 10);
        assert_eq!(s.failures, 40);
        assert_eq!(s.successes + s.failures, s.attempted);
        assert_eq!(s.success_percentage, Some(20));
        assert_eq!(s.abort, None);
        assert_eq!(s.zone_tally.get(&ZoneClass::Normal), Some(&10));
        assert_eq!(h.allocator().outstanding, 0);
        assert_eq!(h.allocator().free, 10_000);
        assert!(ch.report.contents().contains("% Success:             20\n"));
        assert!(ch.report.contents().ends_with("Test completed successfully\n"));
        Ok(())
    }

    #[test]
    fn test_at_least_one_checkpoint_per_attempt() -> anyhow::Result<()> {
        let mut h = harness(SteppingClock::new(100, 1));
        let mut ch = Channels::new();
        let s = h.run_highorder(0, 25, ch.borrow())?;
        assert_eq!(s.attempted, 25);
        assert!(h.yielder.checks() >= 25);
        Ok(())
    }

    #[test]
    fn test_rate_limit_sleeps_between_attempts() -> anyhow::Result<()> {
        // 100 Hz with hz_fraction 10: attempts are 10 ticks apart
        let mut h = harness(SteppingClock::new(100, 1));
        let mut ch = Channels::new();
        h.run_highorder(0, 25, ch.borrow())?;
        assert_eq!(h.yielder.checks(), 25);
        Ok(())
    }

    #[test]
    fn test_timing_channel_layout() -> anyhow::Result<()> {
        let mut h = harness(SteppingClock::new(100, 1).with_cycle_step(42));
        h.allocator_mut().fail_after = Some(11);
        let mut ch = Channels::new();
        h.run_highorder(1, 12, ch.borrow())?;
        let lines: Vec<&str> = ch.timings.contents().split('\n').collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], format!("{:<11} ", 42).repeat(10));
        assert_eq!(lines[1], format!("{:<11} -{:<10} ", 42, 42));
        assert_eq!(ch.buddyinfo.contents().matches("Buddyinfo ").count(), 12);
        assert!(ch.buddyinfo.contents().contains("Buddyinfo failure attempt 12\n"));
        Ok(())
    }

    #[test]
    fn test_channels_grown_up_front() -> anyhow::Result<()> {
        let mut h = harness(SteppingClock::new(100, 1));
        let mut ch = Channels::new();
        h.run_highorder(2, 400, ch.borrow())?;
        assert_eq!(ch.timings.stalls(), 0);
        assert_eq!(ch.buddyinfo.stalls(), 0);
        Ok(())
    }

    #[test]
    fn test_slow_success_aborts_with_partial_results() -> anyhow::Result<()> {
        let mut h = harness(SteppingClock::new(1, 1000));
        let mut ch = Channels::new();
        let s = h.run_highorder(0, 5, ch.borrow())?;
        assert_eq!(s.abort, Some(AbortReason::SlowSuccess));
        assert_eq!(s.aborted_at, Some(1));
        assert_eq!(s.attempted, 1);
        assert_eq!(h.allocator().outstanding, 0);
        assert!(
            ch.report
                .contents()
                .ends_with("Test aborted after 1 allocations due to delays\n")
        );
        Ok(())
    }

    #[test]
    fn test_failure_budget_aborts() -> anyhow::Result<()> {
        let mut h = harness(SteppingClock::new(1, 1000));
        h.allocator_mut().fail_after = Some(0);
        let mut ch = Channels::new();
        let s = h.run_highorder(0, 5, ch.borrow())?;
        assert_eq!(s.abort, Some(AbortReason::FailureBudget));
        assert_eq!(s.aborted_at, Some(2));
        assert_eq!(s.failures, 2);
        assert_eq!(s.success_percentage, Some(0));
        Ok(())
    }

    #[test]
    fn test_invalid_order_rejected() {
        let mut h = harness(SteppingClock::new(100, 1));
        let mut ch = Channels::new();
        let err = h.run_highorder(MAX_ORDER, 5, ch.borrow()).unwrap_err();
        assert!(matches!(
            err,
            TestError::Parameter(ParameterError::InvalidOrder(MAX_ORDER))
        ));
        assert_eq!(h.allocator().attempts, 0);
        assert!(ch.report.contents().ends_with("Test failed\n"));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut h = harness(SteppingClock::new(100, 1));
        let mut ch = Channels::new();
        let err = h.run_highorder(2, 0, ch.borrow()).unwrap_err();
        assert!(matches!(
            err,
            TestError::Parameter(ParameterError::ZeroAttempts)
        ));
    }
}
