//! The fault variant of the pressure test.
//!
//! Instead of allocating pages directly, a fault test maps an anonymous
//! region sized from the zone's watermarks, references every page once and
//! then, pass after pass, walks the region faulting back in whatever reclaim
//! took away.

use log::{info, warn};
use serde::Serialize;
use std::time::Duration;

use crate::allocator::{PageAllocator, ZoneClass};
use crate::error::TestError;
use crate::executor::{Harness, sanitize_passes};
use crate::mapping::{AddressSpace, Region};
use crate::params::{PressureTier, TestParameters, calculate_parameters};
use crate::report::ReportChannel;
use crate::scan::{TouchVisitor, count_resident, presence_map, scan};
use crate::util::Size;

/// One row of a fault test.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FaultPass {
    /// Pass number; pass 0 is the initial reference of every page
    pub pass: u64,
    /// Pages referenced (faulted in) during the pass
    pub referenced: u64,
    /// Resident pages counted after the pass
    pub present: u64,
    /// Time spent referencing pages
    pub time: Duration,
}

/// Result of a whole fault test invocation.
#[derive(Debug, Serialize)]
pub struct FaultSummary {
    /// Test name, e.g. `fault_low`
    pub test: String,
    /// Parameters the region was sized with
    pub parameters: TestParameters,
    /// The mapped region
    pub mapping: Region,
    /// One row per pass, starting with pass 0
    pub passes: Vec<FaultPass>,
    /// Pages that could not be faulted in
    pub failed_touches: u64,
    /// Free pages of the zone after the last pass
    pub finishing_free: u64,
    /// Cooperative yields during the invocation
    pub yields: u64,
}

impl<A: PageAllocator> Harness<A> {
    /// Zone the fault tests size their region from.
    pub fn fault_zone(&self) -> ZoneClass {
        self.config.fault_zone.unwrap_or_else(|| {
            if matches!(self.allocator.zone_snapshot(ZoneClass::HighMem), Ok(Some(_))) {
                ZoneClass::HighMem
            } else {
                ZoneClass::Normal
            }
        })
    }

    /// Maps a region of the resolved op count, references every page, and
    /// then runs `passes` passes of fault-in scans over it.
    ///
    /// Each pass walks the region with a [`TouchVisitor`] and counts the
    /// resident pages afterwards. The report ends with a presence map of the
    /// region. The region is unmapped before returning.
    ///
    /// # Errors
    ///
    /// Returns [`TestError::Parameter`] for invalid parameters and
    /// [`TestError::Mapping`] if the region cannot be created, walked or
    /// destroyed.
    pub fn run_fault<S: AddressSpace + ?Sized>(
        &mut self,
        space: &S,
        tier: PressureTier,
        passes: u64,
        pages: u64,
        out: &mut dyn ReportChannel,
    ) -> Result<FaultSummary, TestError> {
        let test = format!("fault_{}", tier);
        let passes = sanitize_passes(passes);
        out.open();
        report!(*out, "{} Test Results.\n\n", test);

        let request = self.request(tier, pages, self.fault_zone());
        let mut parameters = match calculate_parameters(&self.allocator, &request) {
            Ok(p) => p,
            Err(e) => {
                report!(*out, "ERROR: {}\nTest failed\n", e);
                out.close();
                return Err(e.into());
            }
        };

        let region = match space.map_anonymous(parameters.op_count) {
            Ok(region) => region,
            Err(e) => {
                report!(*out, "Failed to mmap: {}\nTest failed\n", e);
                out.close();
                return Err(e.into());
            }
        };
        info!("{}: mapped {} for {} passes", test, region, passes);

        let result = self.fault_passes(space, &parameters, region, passes, out);
        let unmapped = space.unmap(region);
        if let Err(e) = &unmapped {
            warn!("Failed to unmap {}: {}", region, e);
            report!(*out, "WARNING: Failed to unmap memory area\n");
        }
        parameters.restore_signals();
        out.close();

        let (rows, failed_touches, yields) = result?;
        unmapped?;
        Ok(FaultSummary {
            test,
            finishing_free: self.allocator.free_pages(parameters.zone),
            parameters,
            mapping: region,
            passes: rows,
            failed_touches,
            yields,
        })
    }

    fn fault_passes<S: AddressSpace + ?Sized>(
        &mut self,
        space: &S,
        parameters: &TestParameters,
        region: Region,
        passes: u64,
        out: &mut dyn ReportChannel,
    ) -> Result<(Vec<FaultPass>, u64, u64), TestError> {
        report!(*out, "Mapped Area Information\n");
        report!(*out, "o address:  0x{:X}\n", region.start);
        report!(*out, "o length:   {}\n\n", Size::Pages(region.pages()));
        report!(*out, "Test Parameters\n");
        report!(*out, "o Passes:               {}\n", passes);
        report!(*out, "o Starting Free pages:  {}\n", parameters.starting_free);
        report!(*out, "o Free page limit:      {}\n", parameters.free_floor);
        report!(*out, "o References:           {}\n\n", parameters.op_count);
        report!(*out, "Test Results\n");
        report!(*out, "Pass       Refd     Present   Time\n");

        let yields_before = self.yielder.yields();
        let mut failed_touches = 0;

        // Reference every page once, highest address first.
        let start = self.clock.ticks();
        let mut referenced = 0;
        for addr in region.page_addrs().rev() {
            self.yielder.checkpoint();
            match space.touch(addr) {
                Ok(()) => referenced += 1,
                Err(e) => {
                    warn!("Failed to reference 0x{:x}: {}", addr, e);
                    failed_touches += 1;
                }
            }
        }
        let mut time = self.elapsed_since(start);

        let bar = self.progress_bar(passes, "Fault pass");
        let mut rows = Vec::with_capacity(passes as usize + 1);
        for pass in 0..=passes {
            let present = count_resident(space, region, self.yielder.as_mut())?;
            report!(
                *out,
                "{:<8} {:>8} {:>8} {:>8}ms\n",
                pass,
                referenced,
                present,
                time.as_millis()
            );
            rows.push(FaultPass {
                pass,
                referenced,
                present,
                time,
            });
            if pass == passes {
                break;
            }
            if let Some(bar) = &bar {
                bar.set_position(pass + 1);
            }

            let start = self.clock.ticks();
            let mut touch = TouchVisitor::new(space);
            let state = scan(space, region, Some(&mut touch), self.yielder.as_mut())?;
            failed_touches += touch.failures();
            referenced = state.faulted_in;
            time = self.elapsed_since(start);
        }
        if let Some(bar) = bar {
            bar.finish();
        }

        let yields = self.yielder.yields() - yields_before;
        report!(*out, "\nPost Test Information\n");
        report!(
            *out,
            "o Finishing Free pages: {}\n",
            self.allocator.free_pages(parameters.zone)
        );
        report!(*out, "o Yield calls:          {}\n", yields);
        report!(*out, "o Failed references:    {}\n\n", failed_touches);
        report!(*out, "Presence map\n");
        report!(*out, "{}\n", presence_map(space, region)?);
        report!(*out, "Test completed successfully\n");
        Ok((rows, failed_touches, yields))
    }
}
