//! The allocator under test.
//!
//! This module defines the [`PageAllocator`] trait, the only way the harness
//! touches the memory manager it pressures, together with the zone
//! descriptions it reads from it.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::util::MAX_ORDER;

/// Class of a memory zone.
///
/// Used both to select the zone a test targets and to classify which zone an
/// allocation came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ZoneClass {
    /// Low memory reachable by legacy DMA
    Dma,
    /// Directly mapped memory
    Normal,
    /// Memory not permanently mapped by the kernel
    HighMem,
    /// Memory holding only easily reclaimable or migratable pages
    Movable,
}

impl ZoneClass {
    /// All zone classes, in address order.
    pub const ALL: [ZoneClass; 4] = [
        ZoneClass::Dma,
        ZoneClass::Normal,
        ZoneClass::HighMem,
        ZoneClass::Movable,
    ];

    /// Name as it appears in `/proc/zoneinfo` and `/proc/buddyinfo`.
    pub fn name(&self) -> &'static str {
        match self {
            ZoneClass::Dma => "DMA",
            ZoneClass::Normal => "Normal",
            ZoneClass::HighMem => "HighMem",
            ZoneClass::Movable => "Movable",
        }
    }

    /// Parses a zone name, accepting the kernel's `DMA32` as [`ZoneClass::Dma`].
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "DMA" | "DMA32" => Some(ZoneClass::Dma),
            "Normal" => Some(ZoneClass::Normal),
            "HighMem" => Some(ZoneClass::HighMem),
            "Movable" | "EasyRclm" => Some(ZoneClass::Movable),
            _ => None,
        }
    }
}

impl fmt::Display for ZoneClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether an allocation may sleep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum AllocMode {
    /// Never blocks; fails instead of entering reclaim.
    #[default]
    Atomic,
    /// May block and reclaim before failing.
    Blocking,
}

impl AllocMode {
    /// Whether an allocation in this mode may put the caller to sleep.
    pub fn can_block(&self) -> bool {
        matches!(self, AllocMode::Blocking)
    }
}

/// Free-page thresholds at which the allocator changes reclaim behaviour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermarks {
    /// Below this only privileged allocations succeed
    pub min: u64,
    /// Below this background reclaim is woken
    pub low: u64,
    /// Background reclaim stops once free pages are back above this
    pub high: u64,
}

/// Point-in-time view of a zone, read under the zone lock.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ZoneSnapshot {
    /// The zone this snapshot describes
    pub zone: ZoneClass,
    /// Free pages at the time of the snapshot
    pub free_pages: u64,
    /// Watermarks at the time of the snapshot
    pub watermarks: Watermarks,
    /// Pages managed by the zone (its capacity)
    pub present_pages: u64,
    /// Pages spanned by the zone, holes included
    pub spanned_pages: u64,
}

/// Free block counts of one zone, indexed by order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FreeAreas {
    /// NUMA node of the zone
    pub node: usize,
    /// The zone
    pub zone: ZoneClass,
    /// `free[order]` is the number of free blocks of `2^order` pages
    pub free: [u64; MAX_ORDER],
}

impl fmt::Display for FreeAreas {
    /// Formats like a line of `/proc/buddyinfo`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Node {}, zone {:>8} {}",
            self.node,
            self.zone.name(),
            self.free.iter().map(|n| format!("{:>6}", n)).join(" ")
        )
    }
}

/// Trait for the memory manager being pressured.
///
/// The harness only ever allocates, frees, asks where a block came from, and
/// reads zone counters. Implementors decide what a handle is; the harness
/// treats it as opaque and owns it until it is handed back to
/// [`free()`](PageAllocator::free).
///
/// # Associated Types
///
/// * `Handle` - An allocated block of `2^order` contiguous pages
/// * `Error` - Returned when zone state cannot be read
///
/// # Examples
///
/// See `vmpress-sim` for a deterministic buddy allocator and `vmpress-linux`
/// for a backend driving the running kernel.
pub trait PageAllocator {
    /// An allocated block of pages.
    type Handle;

    /// The error type returned when reading zone state fails.
    type Error: std::error::Error;

    /// Attempts to allocate `2^order` contiguous pages.
    ///
    /// Returns `None` if the allocator cannot satisfy the request. A failed
    /// attempt is an ordinary outcome, not an error.
    fn allocate(&mut self, order: usize, mode: AllocMode) -> Option<Self::Handle>;

    /// Returns a block obtained from [`allocate()`](PageAllocator::allocate) with the same `order`.
    fn free(&mut self, handle: Self::Handle, order: usize);

    /// Reads a zone's counters and watermarks under the zone lock.
    ///
    /// Returns `Ok(None)` if the zone does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the zone state cannot be read.
    fn zone_snapshot(&self, zone: ZoneClass) -> Result<Option<ZoneSnapshot>, Self::Error>;

    /// Current free pages of a zone, read without taking the zone lock.
    fn free_pages(&self, zone: ZoneClass) -> u64;

    /// The zone a block was allocated from.
    fn zone_of(&self, handle: &Self::Handle) -> ZoneClass;

    /// Total number of physical pages in the system.
    fn total_pages(&self) -> u64;

    /// Per-zone free block counts for every order.
    ///
    /// # Errors
    ///
    /// Returns an error if the fragmentation state cannot be read.
    fn free_areas(&self) -> Result<Vec<FreeAreas>, Self::Error>;

    /// Zones present in this system, in address order.
    fn zones(&self) -> Vec<ZoneClass> {
        ZoneClass::ALL
            .into_iter()
            .filter(|zone| matches!(self.zone_snapshot(*zone), Ok(Some(_))))
            .collect()
    }
}
