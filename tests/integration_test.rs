use rand::{Rng, rng};
use std::fmt;
use vmpress::allocator::{AllocMode, PageAllocator, Watermarks, ZoneClass};
use vmpress::mapping::AddressSpace;
use vmpress::params::ParameterRequest;
use vmpress::report::{ReportBuffer, ReportChannel};
use vmpress::scan::{TouchVisitor, count_resident, presence_map, scan};
use vmpress::sched::{CooperativeYield, NoYield};
use vmpress::signals::{SignalPolicy, is_blocked};
use vmpress::sim::{SimAllocator, SimConfig};
use vmpress::util::SteppingClock;
use vmpress::{
    Command, Harness, HarnessConfig, HighOrderChannels, Outcome, PressureTier, TestError,
    calculate_parameters,
};

fn watermarks(min: u64, low: u64, high: u64) -> Watermarks {
    Watermarks { min, low, high }
}

fn quiet_config() -> HarnessConfig {
    HarnessConfig {
        signals: SignalPolicy::Ignore,
        ..Default::default()
    }
}

/// A single normal zone of `capacity` pages of which only `free` are free.
fn zone_with(
    capacity: u64,
    free: u64,
    wm: Watermarks,
) -> anyhow::Result<(SimAllocator, Vec<vmpress::sim::SimPage>)> {
    let mut alloc = SimAllocator::new(&SimConfig::single_zone(capacity, wm))?;
    let mut held = vec![];
    while alloc.free_pages(ZoneClass::Normal) > free {
        held.push(
            alloc
                .allocate(0, AllocMode::Atomic)
                .ok_or_else(|| anyhow::anyhow!("setup allocation failed"))?,
        );
    }
    Ok((alloc, held))
}

#[test]
fn test_fast_tier_explicit_count() -> anyhow::Result<()> {
    let alloc = SimAllocator::new(&SimConfig::single_zone(10_000, watermarks(300, 400, 500)))?;
    let mut harness = Harness::new(alloc, quiet_config()).with_yield(NoYield::default());
    let mut out = ReportBuffer::new("report");

    let summary = harness.run_alloc(PressureTier::Fast, 3, 100, &mut out)?;

    assert_eq!(summary.parameters.free_floor, 500);
    assert_eq!(summary.parameters.op_count, 100);
    assert_eq!(summary.passes.len(), 3);
    for pass in &summary.passes {
        assert_eq!(pass.succeeded, 100);
        assert_eq!(pass.failed, 0);
        assert_eq!(pass.succeeded + pass.failed, pass.attempted);
    }
    assert_eq!(summary.total_freed, 300);
    assert_eq!(harness.allocator().free_pages(ZoneClass::Normal), 10_000);
    assert!(out.contents().ends_with("Test completed successfully\n"));
    Ok(())
}

#[test]
fn test_min_tier_automatic_count() -> anyhow::Result<()> {
    let alloc = SimAllocator::new(&SimConfig::single_zone(1000, watermarks(200, 250, 300)))?;
    let request = ParameterRequest {
        signals: SignalPolicy::Ignore,
        ..ParameterRequest::new(PressureTier::Min, 0)
    };
    let params = calculate_parameters(&alloc, &request)?;
    assert_eq!(params.free_floor, 100);
    // 900 pages of headroom less the handle bookkeeping
    assert_eq!(params.op_count, 898);
    assert!(params.op_count + params.free_floor <= 1000);

    let again = calculate_parameters(&alloc, &request)?;
    assert_eq!(
        (again.free_floor, again.op_count),
        (params.free_floor, params.op_count)
    );

    let mut harness = Harness::new(alloc, quiet_config());
    let mut out = ReportBuffer::new("report");
    let summary = harness.run_alloc(PressureTier::Min, 1, 0, &mut out)?;
    assert_eq!(summary.passes[0].succeeded, 898);
    Ok(())
}

#[test]
fn test_zero_tier_overshoots() -> anyhow::Result<()> {
    let (alloc, _held) = zone_with(2000, 500, watermarks(20, 25, 30))?;

    let mut request = ParameterRequest::new(PressureTier::Zero, 0);
    request.signals = SignalPolicy::Ignore;
    let params = calculate_parameters(&alloc, &request)?;
    assert_eq!(params.free_floor, 0);
    assert_eq!(params.op_count, 1250);
    assert!(!params.signals_blocked());

    request.mode = AllocMode::Blocking;
    let blocking = calculate_parameters(&alloc, &request)?;
    assert_eq!(blocking.free_floor, 1);
    Ok(())
}

#[test]
fn test_zero_tier_pass_exhausts_zone() -> anyhow::Result<()> {
    let (alloc, _held) = zone_with(2000, 500, watermarks(20, 25, 30))?;
    let mut harness = Harness::new(alloc, quiet_config());
    let mut out = ReportBuffer::new("report");

    let summary = harness.run_alloc(PressureTier::Zero, 1, 0, &mut out)?;

    assert_eq!(summary.passes[0].succeeded, 500);
    assert_eq!(summary.finishing_free, 500);
    Ok(())
}

#[test]
fn test_highorder_failures_do_not_abort() -> anyhow::Result<()> {
    let config = SimConfig::single_zone(1 << 16, watermarks(64, 80, 96)).with_failure(10, 0);
    let alloc = SimAllocator::new(&config)?;
    let mut harness = Harness::new(alloc, quiet_config())
        .with_clock(SteppingClock::new(100, 1))
        .with_yield(CooperativeYield::new(4));
    let mut report = ReportBuffer::new("report");
    let mut timings = ReportBuffer::new("timings");
    let mut buddyinfo = ReportBuffer::new("buddyinfo");

    let summary = harness.run_highorder(
        3,
        50,
        HighOrderChannels {
            report: &mut report,
            timings: &mut timings,
            buddyinfo: &mut buddyinfo,
        },
    )?;

    assert_eq!(summary.attempted, 50);
    assert_eq!(summary.successes, 10);
    assert_eq!(summary.failures, 40);
    assert_eq!(summary.success_percentage, Some(20));
    assert_eq!(summary.abort, None);
    assert_eq!(summary.zone_tally.get(&ZoneClass::Normal), Some(&10));
    assert!(report.contents().ends_with("Test completed successfully\n"));
    assert_eq!(timings.contents().matches('-').count(), 40);
    assert_eq!(buddyinfo.contents().matches("Buddyinfo failure").count(), 40);
    assert_eq!(
        harness.allocator().free_pages(ZoneClass::Normal),
        1 << 16,
        "every block is freed"
    );
    Ok(())
}

#[test]
fn test_scan_touch_faults_in_everything() -> anyhow::Result<()> {
    let alloc = SimAllocator::new(&SimConfig::single_zone(4096, watermarks(1, 2, 3)))?;
    let space = alloc.address_space();
    let region = space.map_anonymous(16)?;
    for addr in region.page_addrs().step_by(4) {
        space.touch(addr)?;
    }

    let mut yielder = NoYield::default();
    let before = scan(&space, region, None, &mut yielder)?;
    assert_eq!(before.resident_count, 4);

    let mut visitor = TouchVisitor::new(&space);
    let state = scan(&space, region, Some(&mut visitor), &mut yielder)?;
    assert_eq!(state.resident_count, 16);
    assert_eq!(state.faulted_in, 12);
    assert_eq!(visitor.failures(), 0);

    let again = scan(&space, region, None, &mut yielder)?;
    assert!(again.resident_count >= state.resident_count);
    assert_eq!(presence_map(&space, region)?.matches('#').count(), 16);
    space.unmap(region)?;
    Ok(())
}

#[test]
fn test_scan_of_mapping_larger_than_zone() -> anyhow::Result<()> {
    let alloc = SimAllocator::new(&SimConfig::single_zone(8, watermarks(1, 2, 3)))?;
    let space = alloc.address_space();
    let region = space.map_anonymous(12)?;

    let mut yielder = NoYield::default();
    let mut visitor = TouchVisitor::new(&space);
    let state = scan(&space, region, Some(&mut visitor), &mut yielder)?;

    assert_eq!(state.faulted_in, 12);
    assert_eq!(state.resident_count, 8);
    assert_eq!(count_resident(&space, region, &mut yielder)?, 8);
    assert_eq!(space.resident_pages(), 8);
    space.unmap(region)?;
    Ok(())
}

#[test]
fn test_fault_test_fits_in_zone() -> anyhow::Result<()> {
    let alloc = SimAllocator::new(&SimConfig::single_zone(1024, watermarks(16, 20, 24)))?;
    let space = alloc.address_space();
    let mut harness = Harness::new(alloc, quiet_config());
    let mut out = ReportBuffer::new("report");

    let summary = harness.run_fault(&space, PressureTier::Fast, 2, 256, &mut out)?;

    assert_eq!(summary.passes.len(), 3);
    assert!(summary.passes.iter().all(|p| p.present == 256));
    assert!(out.contents().contains("Presence map"));
    assert_eq!(space.resident_pages(), 0);
    Ok(())
}

#[test]
fn test_fault_test_under_reclaim() -> anyhow::Result<()> {
    // 256 free frames behind a 384 page mapping
    let (alloc, _held) = zone_with(1024, 256, watermarks(16, 20, 24))?;
    let space = alloc.address_space();
    let mut harness = Harness::new(alloc, quiet_config());
    let mut out = ReportBuffer::new("report");

    let summary = harness.run_fault(&space, PressureTier::Zero, 2, 384, &mut out)?;

    assert_eq!(summary.parameters.op_count, 384);
    assert_eq!(summary.passes.len(), 3);
    assert!(summary.passes.iter().all(|p| p.present == 256));
    assert!(
        summary
            .passes
            .iter()
            .any(|p| p.present < summary.parameters.op_count)
    );
    assert_eq!(summary.passes[0].referenced, 384);
    assert_eq!(summary.passes[1].referenced, 128);
    assert_eq!(summary.failed_touches, 0);

    let report = out.contents();
    let map = &report[report.find("Presence map").unwrap_or(0)..];
    assert!(map.contains('.'));
    assert!(map.contains('#'));
    assert_eq!(space.resident_pages(), 0);
    Ok(())
}

#[test]
fn test_normal_zone_run_leaves_highmem_alone() -> anyhow::Result<()> {
    let config = SimConfig::single_zone(1024, watermarks(16, 20, 24)).with_zone(
        ZoneClass::HighMem,
        4096,
        watermarks(16, 20, 24),
    );
    let mut alloc = SimAllocator::new(&config)?;
    let mut held = vec![];
    for _ in 0..512 {
        held.push(
            alloc
                .allocate(0, AllocMode::Atomic)
                .ok_or_else(|| anyhow::anyhow!("setup allocation failed"))?,
        );
    }
    assert_eq!(alloc.free_pages(ZoneClass::Normal), 512);
    assert_eq!(alloc.free_pages(ZoneClass::HighMem), 4096);

    let mut harness = Harness::new(alloc, quiet_config());
    let mut out = ReportBuffer::new("report");
    let summary = harness.run_alloc(PressureTier::Zero, 1, 0, &mut out)?;

    // 512 free plus half the 512 held
    assert_eq!(summary.parameters.op_count, 768);
    assert_eq!(summary.passes[0].succeeded, 512);
    assert!(summary.passes[0].short);
    assert_eq!(harness.allocator().free_pages(ZoneClass::HighMem), 4096);

    let summary = harness.run_alloc(PressureTier::Fast, 2, 0, &mut out)?;
    assert!(summary.passes.iter().all(|p| !p.short));
    assert_eq!(harness.allocator().free_pages(ZoneClass::HighMem), 4096);
    assert_eq!(harness.allocator().free_pages(ZoneClass::Normal), 512);
    Ok(())
}

/// Report channel that notes whether SIGINT was masked at every write.
struct MaskRecorder {
    inner: ReportBuffer,
    masked: Vec<bool>,
}

impl MaskRecorder {
    fn new() -> Self {
        Self {
            inner: ReportBuffer::new("report"),
            masked: vec![],
        }
    }
}

impl ReportChannel for MaskRecorder {
    fn open(&mut self) {
        self.inner.open();
    }

    fn append(&mut self, args: fmt::Arguments<'_>) {
        self.masked.push(is_blocked(libc::SIGINT).unwrap());
        self.inner.append(args);
    }

    fn close(&mut self) {
        self.inner.close();
    }

    fn grow(&mut self, pages: usize) {
        self.inner.grow(pages);
    }

    fn capacity_pages(&self) -> usize {
        self.inner.capacity_pages()
    }
}

#[test]
fn test_zero_tier_masks_signals_only_while_running() -> anyhow::Result<()> {
    let before = is_blocked(libc::SIGINT)?;
    assert!(!before, "test thread starts with SIGINT deliverable");

    let alloc = SimAllocator::new(&SimConfig::single_zone(1024, watermarks(16, 20, 24)))?;
    let space = alloc.address_space();
    let mut harness = Harness::new(alloc, HarnessConfig::default());

    let mut out = MaskRecorder::new();
    let summary = harness.run_alloc(PressureTier::Zero, 2, 0, &mut out)?;
    assert!(summary.parameters.signals_blocked());
    assert!(!summary.parameters.signals_held());
    assert!(out.masked.iter().any(|m| *m), "passes ran with SIGINT masked");
    assert!(!is_blocked(libc::SIGINT)?);

    let mut out = MaskRecorder::new();
    let summary = harness.run_fault(&space, PressureTier::Zero, 1, 256, &mut out)?;
    assert!(summary.parameters.signals_blocked());
    assert!(out.masked.iter().any(|m| *m));
    assert!(!is_blocked(libc::SIGINT)?);

    let mut out = MaskRecorder::new();
    let summary = harness.run_alloc(PressureTier::Fast, 1, 64, &mut out)?;
    assert!(!summary.parameters.signals_blocked());
    assert!(out.masked.iter().all(|m| !*m));
    Ok(())
}

#[test]
fn test_control_lines_end_to_end() -> anyhow::Result<()> {
    let alloc = SimAllocator::new(&SimConfig::default())?;
    let space = alloc.address_space();
    let mut harness = Harness::new(alloc, quiet_config());
    let mut report = ReportBuffer::new("report");
    let mut timings = ReportBuffer::new("timings");
    let mut buddyinfo = ReportBuffer::new("buddyinfo");

    for line in ["zones", "alloc_low 2 64", "fault_fast 1 32", "help alloc_zero"] {
        let command: Command = line.parse()?;
        let outcome = harness.execute(
            command,
            &space,
            HighOrderChannels {
                report: &mut report,
                timings: &mut timings,
                buddyinfo: &mut buddyinfo,
            },
        )?;
        match outcome {
            Outcome::Zones(zones) => assert_eq!(zones.len(), 2),
            Outcome::Alloc(s) => assert_eq!(s.total_allocated, 128),
            Outcome::Fault(s) => assert_eq!(s.parameters.op_count, 32),
            Outcome::Help(text) => assert!(text.contains("OOM")),
            Outcome::HighOrder(_) => unreachable!(),
        }
    }

    let command: Command = "alloc_fast 1 999999999".parse()?;
    let result = harness.execute(
        command,
        &space,
        HighOrderChannels {
            report: &mut report,
            timings: &mut timings,
            buddyinfo: &mut buddyinfo,
        },
    );
    assert!(matches!(result, Err(TestError::Parameter(_))));
    assert!(report.contents().ends_with("Test failed\n"));
    assert!(!report.is_open());
    Ok(())
}

#[test]
fn test_random_machines_respect_headroom() -> anyhow::Result<()> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut rand = rng();
    for _ in 0..20 {
        let pages = rand.random_range(4096..65536u64);
        let high = rand.random_range(64..1024u64);
        let config = SimConfig::single_zone(pages, watermarks(high / 2, high * 3 / 4, high))
            .with_fragmentation(rand.random_range(0.0..0.3), rand.random());
        let alloc = SimAllocator::new(&config)?;
        let free = alloc.free_pages(ZoneClass::Normal);
        for tier in [PressureTier::Fast, PressureTier::Low, PressureTier::Min] {
            let mut request = ParameterRequest::new(tier, 0);
            request.signals = SignalPolicy::Ignore;
            let params = calculate_parameters(&alloc, &request)?;
            assert!(params.op_count + params.free_floor <= free);
        }
    }
    Ok(())
}
