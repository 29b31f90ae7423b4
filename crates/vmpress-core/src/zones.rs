//! Zone statistics report.

use log::debug;

use crate::allocator::{PageAllocator, ZoneSnapshot};
use crate::error::ParameterError;
use crate::report::ReportChannel;

const COLUMN: usize = 32;

/// Writes one column per zone with its page counts and watermarks.
///
/// Each zone is read under its own lock; zones are not read atomically with
/// respect to each other.
///
/// # Errors
///
/// Returns [`ParameterError::ZoneUnreadable`] if a zone cannot be read.
pub fn zone_report<A: PageAllocator + ?Sized>(
    allocator: &A,
    out: &mut dyn ReportChannel,
) -> Result<Vec<ZoneSnapshot>, ParameterError> {
    out.open();
    let mut snapshots = vec![];
    for zone in allocator.zones() {
        match allocator.zone_snapshot(zone) {
            Ok(Some(snapshot)) => snapshots.push(snapshot),
            Ok(None) => debug!("zone {} vanished", zone),
            Err(e) => {
                report!(*out, "ERROR: Could not read zone {}\n", zone);
                out.close();
                return Err(ParameterError::ZoneUnreadable {
                    zone,
                    reason: e.to_string(),
                });
            }
        }
    }

    report!(*out, "Zone statistics ({} pages total)\n\n", allocator.total_pages());
    if snapshots.is_empty() {
        report!(*out, "No zones found\n");
        out.close();
        return Ok(snapshots);
    }
    let rows: [(&str, fn(&ZoneSnapshot) -> u64); 6] = [
        ("present_pages", |s| s.present_pages),
        ("spanned_pages", |s| s.spanned_pages),
        ("free_pages", |s| s.free_pages),
        ("pages_high", |s| s.watermarks.high),
        ("pages_low", |s| s.watermarks.low),
        ("pages_min", |s| s.watermarks.min),
    ];
    for s in &snapshots {
        report!(*out, "{:<width$}", s.zone.name(), width = COLUMN);
    }
    report!(*out, "\n");
    for (name, field) in rows {
        for s in &snapshots {
            let cell = format!("{:<13} = {:>8}", name, field(s));
            report!(*out, "{:<width$}", cell, width = COLUMN);
        }
        report!(*out, "\n");
    }
    report!(*out, "\n");
    out.close();
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::zone_report;
    use crate::allocator::Watermarks;
    use crate::report::ReportBuffer;
    use crate::testing::FakeAllocator;

    #[test]
    fn test_zone_report_columns() -> anyhow::Result<()> {
        let wm = Watermarks {
            min: 10,
            low: 12,
            high: 15,
        };
        let alloc = FakeAllocator::new(900, 1024, wm);
        let mut out = ReportBuffer::new("zones");
        let snaps = zone_report(&alloc, &mut out)?;
        assert_eq!(snaps.len(), 1);
        assert!(out.contents().contains("free_pages    =      900"));
        assert!(out.contents().contains("pages_high    =       15"));
        assert!(!out.is_open());
        Ok(())
    }
}
