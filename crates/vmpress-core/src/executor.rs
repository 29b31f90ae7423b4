//! Pressure-test executor.
//!
//! [`Harness`] owns the allocator under test together with the clock and
//! yield point every test loop runs against. This module holds the
//! allocate-until-floor / free-all passes; the fault variant and the
//! high-order runr extend the same harness.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{debug, info, warn};
use serde::Serialize;
use std::time::Duration;

use crate::allocator::{AllocMode, PageAllocator, ZoneClass};
use crate::error::TestError;
use crate::params::{ParameterRequest, PressureTier, TestParameters, calculate_parameters};
use crate::report::ReportChannel;
use crate::sched::{CooperativeYield, YieldPoint};
use crate::signals::SignalPolicy;
use crate::util::{Clock, SystemClock, ticks_to_duration};

/// Configuration shared by all tests of one harness.
#[derive(Clone, Debug)]
pub struct HarnessConfig {
    /// Allocation mode used for every attempt
    pub mode: AllocMode,
    /// High-order attempts are spaced at least `hz / hz_fraction` ticks apart
    pub hz_fraction: u64,
    /// A single high-order success slower than this aborts the run
    pub success_ceiling: Duration,
    /// Cumulative high-order failure time above this aborts the run
    pub failure_ceiling: Duration,
    /// Zone pressured by the alloc tests
    pub zone: ZoneClass,
    /// Zone whose watermarks size the fault tests (None = HighMem when present, else Normal)
    pub fault_zone: Option<ZoneClass>,
    /// Whether a ZERO tier invocation masks signals
    pub signals: SignalPolicy,
    /// Checkpoints between two cooperative yields
    pub yield_every: u64,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            mode: AllocMode::Atomic,
            hz_fraction: 10,
            success_ceiling: Duration::from_secs(600),
            failure_ceiling: Duration::from_secs(1200),
            zone: ZoneClass::Normal,
            fault_zone: None,
            signals: SignalPolicy::Block,
            yield_every: CooperativeYield::DEFAULT_EVERY,
        }
    }
}

/// Statistics of one allocate/free pass.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PassStats {
    /// Pass number, starting at 1
    pub pass: u64,
    /// Allocation attempts made
    pub attempted: u64,
    /// Attempts that returned a page
    pub succeeded: u64,
    /// Attempts that returned nothing
    pub failed: u64,
    /// Whether the pass stopped before reaching its op count
    pub short: bool,
    /// Time spent allocating
    pub alloc_time: Duration,
    /// Time spent freeing
    pub free_time: Duration,
    /// Pages held when the free loop started
    pub pages_present_before: u64,
    /// Pages still held after the free loop
    pub pages_present_after: u64,
}

/// Result of a whole alloc test invocation.
#[derive(Debug, Serialize)]
pub struct PressureSummary {
    /// Test name, e.g. `alloc_fast`
    pub test: String,
    /// Parameters the passes ran with
    pub parameters: TestParameters,
    /// Per-pass statistics
    pub passes: Vec<PassStats>,
    /// Sum of attempts over all passes
    pub total_attempted: u64,
    /// Pages allocated over all passes
    pub total_allocated: u64,
    /// Pages freed over all passes
    pub total_freed: u64,
    /// Failed attempts over all passes
    pub total_failed: u64,
    /// Passes that stopped short of their op count
    pub aborted_passes: u64,
    /// Sum of alloc and free times
    pub total_time: Duration,
    /// Free pages of the zone after the last pass
    pub finishing_free: u64,
    /// Cooperative yields during the invocation
    pub yields: u64,
}

/// A timestamped test outcome, ready to be written as JSON.
///
/// # Type Parameters
///
/// * `T` - Summary type of the test
#[derive(Debug, Serialize)]
pub struct TestRecord<T> {
    /// RFC 3339 timestamp of when the record was made
    pub date: String,
    /// Test name
    pub test: String,
    /// Summary or the error that aborted the test
    pub result: Result<T, TestError>,
    /// Additional JSON metadata (backend specific)
    pub data: Option<serde_json::Value>,
}

impl<T> TestRecord<T> {
    /// Stamps `result` with the current local time.
    pub fn new(
        test: impl Into<String>,
        result: Result<T, TestError>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            date: chrono::Local::now().to_rfc3339(),
            test: test.into(),
            result,
            data,
        }
    }
}

/// Drives tests against one allocator.
///
/// # Type Parameters
///
/// * `A` - The allocator under test
pub struct Harness<A: PageAllocator> {
    pub(crate) allocator: A,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) yielder: Box<dyn YieldPoint>,
    pub(crate) progress: Option<MultiProgress>,
    pub(crate) config: HarnessConfig,
}

impl<A: PageAllocator> Harness<A> {
    /// Creates a harness using the wall clock and cooperative yields.
    pub fn new(allocator: A, config: HarnessConfig) -> Self {
        Self {
            allocator,
            clock: Box::new(SystemClock::new()),
            yielder: Box::new(CooperativeYield::new(config.yield_every)),
            progress: None,
            config,
        }
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Replaces the yield point.
    pub fn with_yield(mut self, yielder: impl YieldPoint + 'static) -> Self {
        self.yielder = Box::new(yielder);
        self
    }

    /// Draws progress bars for long loops.
    pub fn with_progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The allocator under test.
    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    /// Mutable access to the allocator under test.
    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }

    /// The harness configuration.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Yields so far over the lifetime of the harness.
    pub fn yields(&self) -> u64 {
        self.yielder.yields()
    }

    /// Gives the allocator back.
    pub fn into_inner(self) -> A {
        self.allocator
    }

    pub(crate) fn request(&self, tier: PressureTier, pages: u64, zone: ZoneClass) -> ParameterRequest {
        ParameterRequest {
            tier,
            requested_pages: pages,
            zone,
            mode: self.config.mode,
            signals: self.config.signals,
        }
    }

    pub(crate) fn elapsed_since(&self, start: u64) -> Duration {
        ticks_to_duration(self.clock.ticks().saturating_sub(start), self.clock.hz())
    }

    pub(crate) fn progress_bar(&self, len: u64, name: &str) -> Option<ProgressBar> {
        self.progress.as_ref().map(|p| {
            let bar = p.add(ProgressBar::new(len));
            bar.set_style(labelled_style(name));
            bar
        })
    }

    /// Runs `passes` passes of allocate-until-floor / free-all at `tier`.
    ///
    /// `pages` is the op count per pass, 0 for as many as the tier allows.
    /// A pass count of 0 is corrected to 1. Allocation failures end the
    /// current pass early and are counted; they never fail the test.
    ///
    /// # Errors
    ///
    /// Returns [`TestError::Parameter`] if the parameters are invalid and
    /// [`TestError::ResourceExhaustion`] if the handle array for one pass
    /// cannot be allocated. Neither touches the allocator.
    pub fn run_alloc(
        &mut self,
        tier: PressureTier,
        passes: u64,
        pages: u64,
        out: &mut dyn ReportChannel,
    ) -> Result<PressureSummary, TestError> {
        let test = format!("alloc_{}", tier);
        let passes = sanitize_passes(passes);
        out.open();
        report!(*out, "{} Test Results.\n\n", test);

        let request = self.request(tier, pages, self.config.zone);
        let mut parameters = match calculate_parameters(&self.allocator, &request) {
            Ok(p) => p,
            Err(e) => {
                report!(*out, "ERROR: {}\nTest failed\n", e);
                out.close();
                return Err(e.into());
            }
        };

        let mut handles: Vec<A::Handle> = Vec::new();
        if handles.try_reserve_exact(parameters.op_count as usize).is_err() {
            report!(
                *out,
                "ERROR: Unable to allocate memory ({} pages) for page pointers\nTest failed\n",
                parameters.op_count
            );
            out.close();
            return Err(TestError::ResourceExhaustion(parameters.op_count));
        }

        info!(
            "{}: {} passes of {} pages, floor {}",
            test, passes, parameters.op_count, parameters.free_floor
        );
        report!(*out, "Test Parameters\n");
        report!(*out, "o Passes:               {}\n", passes);
        report!(*out, "o Starting Free pages:  {}\n", parameters.starting_free);
        report!(*out, "o Allocations per pass: {}\n", parameters.op_count);
        report!(*out, "o Free page limit:      {}\n", parameters.free_floor);
        report!(*out, "\nTest Output (Time to alloc/free)\n");
        report!(*out, "\tAlloc\tFree\n");

        let yields_before = self.yielder.yields();
        let bar = self.progress_bar(passes, "Pass");
        let mut stats = Vec::with_capacity(passes as usize);
        for pass in 1..=passes {
            if let Some(bar) = &bar {
                bar.set_position(pass);
            }
            let pass_stats = self.alloc_pass(pass, &parameters, &mut handles);
            report!(
                *out,
                "\t {}ms\t{}ms\n",
                pass_stats.alloc_time.as_millis(),
                pass_stats.free_time.as_millis()
            );
            stats.push(pass_stats);
        }
        if let Some(bar) = bar {
            bar.finish();
        }
        parameters.restore_signals();

        let summary = PressureSummary {
            total_attempted: stats.iter().map(|s| s.attempted).sum(),
            total_allocated: stats.iter().map(|s| s.succeeded).sum(),
            total_freed: stats
                .iter()
                .map(|s| s.pages_present_before - s.pages_present_after)
                .sum(),
            total_failed: stats.iter().map(|s| s.failed).sum(),
            aborted_passes: stats.iter().filter(|s| s.short).count() as u64,
            total_time: stats.iter().map(|s| s.alloc_time + s.free_time).sum(),
            finishing_free: self.allocator.free_pages(parameters.zone),
            yields: self.yielder.yields() - yields_before,
            test,
            parameters,
            passes: stats,
        };

        report!(*out, "\nPost Test Information\n");
        report!(*out, "o Finishing Free pages: {}\n", summary.finishing_free);
        report!(*out, "o Yield calls:          {}\n", summary.yields);
        report!(*out, "o Aborted passes:       {}\n", summary.aborted_passes);
        report!(*out, "o Total alloced:        {}\n", summary.total_allocated);
        report!(*out, "o Total freed:          {}\n", summary.total_freed);
        report!(*out, "\nTest completed successfully\n");
        out.close();
        info!("{} completed", summary.test);
        Ok(summary)
    }

    /// One pass: allocate order-0 pages until the op count or the floor is
    /// reached, then free them in reverse order.
    fn alloc_pass(
        &mut self,
        pass: u64,
        parameters: &TestParameters,
        handles: &mut Vec<A::Handle>,
    ) -> PassStats {
        let mut attempted = 0;
        let mut failed = 0;

        let start = self.clock.ticks();
        while (handles.len() as u64) < parameters.op_count
            && self.allocator.free_pages(parameters.zone) > parameters.free_floor
        {
            self.yielder.checkpoint();
            attempted += 1;
            match self.allocator.allocate(0, self.config.mode) {
                Some(handle) => handles.push(handle),
                None => {
                    failed += 1;
                    break;
                }
            }
        }
        let alloc_time = self.elapsed_since(start);

        let succeeded = handles.len() as u64;
        let short = succeeded < parameters.op_count;
        if short {
            debug!(
                "pass {} stopped at {} of {} pages ({} free)",
                pass,
                succeeded,
                parameters.op_count,
                self.allocator.free_pages(parameters.zone)
            );
        }

        let start = self.clock.ticks();
        while let Some(handle) = handles.pop() {
            self.allocator.free(handle, 0);
        }
        let free_time = self.elapsed_since(start);

        PassStats {
            pass,
            attempted,
            succeeded,
            failed,
            short,
            alloc_time,
            free_time,
            pages_present_before: succeeded,
            pages_present_after: handles.len() as u64,
        }
    }
}

/// Bar style with `name` padded to a fixed label column.
fn labelled_style(name: &str) -> ProgressStyle {
    let template = format!(
        "{name:<31}{{wide_bar:40.cyan/blue}} {{pos:>5}}/{{len:<5}} [{{elapsed_precise}}] {{msg}}"
    );
    ProgressStyle::with_template(&template).unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Corrects a pass count of 0 to 1.
pub(crate) fn sanitize_passes(passes: u64) -> u64 {
    if passes == 0 {
        warn!("Cannot make 0 passes, running 1");
        return 1;
    }
    passes
}
