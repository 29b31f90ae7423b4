//! Virtual-mapping presence scanner.
//!
//! Counts how many pages of a mapping are resident, optionally handing every
//! non-resident entry to an [`EntryVisitor`] that may fault it in.

use log::{trace, warn};
use serde::Serialize;

use crate::error::MappingError;
use crate::mapping::{AddressSpace, PageEntry, PageTableWalk, Region};
use crate::sched::YieldPoint;

/// Pages per line of a presence map.
const MAP_LINE_PAGES: usize = 64;

/// Capability invoked on non-resident page-table entries during a scan.
pub trait EntryVisitor {
    /// Visits a non-resident entry.
    ///
    /// Returns `true` if this call made the entry resident.
    fn on_entry(&mut self, entry: &PageEntry) -> bool;
}

impl<F: FnMut(&PageEntry) -> bool> EntryVisitor for F {
    fn on_entry(&mut self, entry: &PageEntry) -> bool {
        self(entry)
    }
}

/// Faults non-resident pages in by writing to them.
pub struct TouchVisitor<'a, S: AddressSpace + ?Sized> {
    space: &'a S,
    failures: u64,
}

impl<'a, S: AddressSpace + ?Sized> TouchVisitor<'a, S> {
    /// Creates a visitor touching pages of `space`.
    pub fn new(space: &'a S) -> Self {
        Self { space, failures: 0 }
    }

    /// Number of touches that failed.
    pub fn failures(&self) -> u64 {
        self.failures
    }
}

impl<S: AddressSpace + ?Sized> EntryVisitor for TouchVisitor<'_, S> {
    fn on_entry(&mut self, entry: &PageEntry) -> bool {
        if entry.present {
            return false;
        }
        match self.space.touch(entry.addr) {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to fault in 0x{:x}: {}", entry.addr, e);
                self.failures += 1;
                false
            }
        }
    }
}

/// Result of one scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ScanState {
    /// Start of the scanned mapping
    pub mapping_start: usize,
    /// Length of the scanned mapping in bytes
    pub mapping_length: usize,
    /// Entries visited
    pub entries: u64,
    /// Resident pages after the walk, including pages faulted in by it
    pub resident_count: u64,
    /// Pages the visitor made resident
    pub faulted_in: u64,
    /// Times the scan yielded to the scheduler
    pub schedule_yield_count: u64,
}

/// Walks `region` of `space` and counts resident pages.
///
/// Entries are visited exactly once, in increasing address order. When a
/// visitor is given it is called for every non-resident entry, and each entry
/// it makes resident is added to `faulted_in`. Faulting a page in may reclaim
/// one counted earlier in the same walk, so once anything was faulted in
/// `resident_count` comes from a second, read-only pass over the tables.
/// Both passes go through a yield checkpoint per entry.
///
/// # Errors
///
/// Returns an error if the page tables of `region` cannot be walked.
pub fn scan<S: PageTableWalk + ?Sized>(
    space: &S,
    region: Region,
    mut visitor: Option<&mut dyn EntryVisitor>,
    yielder: &mut dyn YieldPoint,
) -> Result<ScanState, MappingError> {
    let yields_before = yielder.yields();
    let mut state = ScanState {
        mapping_start: region.start,
        mapping_length: region.len,
        ..Default::default()
    };
    space.walk(region, &mut |entry| {
        yielder.checkpoint();
        state.entries += 1;
        if entry.present {
            state.resident_count += 1;
        } else if let Some(visitor) = visitor.as_mut() {
            state.faulted_in += u64::from(visitor.on_entry(&entry));
        }
    })?;
    if state.faulted_in > 0 {
        let mut resident = 0;
        space.walk(region, &mut |entry| {
            yielder.checkpoint();
            resident += u64::from(entry.present);
        })?;
        state.resident_count = resident;
    }
    state.schedule_yield_count = yielder.yields() - yields_before;
    trace!("scan of {}: {:?}", region, state);
    Ok(state)
}

/// Counts resident pages of `region` without touching anything.
///
/// # Errors
///
/// Returns an error if the page tables of `region` cannot be walked.
pub fn count_resident<S: PageTableWalk + ?Sized>(
    space: &S,
    region: Region,
    yielder: &mut dyn YieldPoint,
) -> Result<u64, MappingError> {
    scan(space, region, None, yielder).map(|s| s.resident_count)
}

/// Renders which pages of `region` are resident.
///
/// One line per 64 pages: the line's start address followed by `#` for a
/// resident page and `.` for a missing one.
///
/// # Errors
///
/// Returns an error if the page tables of `region` cannot be walked.
pub fn presence_map<S: PageTableWalk + ?Sized>(
    space: &S,
    region: Region,
) -> Result<String, MappingError> {
    let mut out = String::new();
    let mut idx = 0usize;
    space.walk(region, &mut |entry| {
        if idx.is_multiple_of(MAP_LINE_PAGES) {
            if idx > 0 {
                out.push('\n');
            }
            out += &format!("0x{:012X} ", entry.addr);
        }
        out.push(if entry.present { '#' } else { '.' });
        idx += 1;
    })?;
    if idx > 0 {
        out.push('\n');
    }
    Ok(out)
}
