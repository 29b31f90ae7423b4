//! Virtual mappings and their page tables.
//!
//! The fault tests need a process address space they can map, touch, walk
//! and unmap. These traits describe that contract without reaching into any
//! particular page-table layout.

use serde::Serialize;
use std::fmt;

use crate::error::MappingError;
use crate::util::{PAGE_SHIFT, PAGE_SIZE};

/// A page-aligned virtual address range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Region {
    /// First byte of the range
    pub start: usize,
    /// Length in bytes, a multiple of [`PAGE_SIZE`]
    pub len: usize,
}

impl Region {
    /// Creates a region of `pages` pages starting at `start`.
    pub fn new(start: usize, pages: usize) -> Self {
        Self {
            start,
            len: pages * PAGE_SIZE,
        }
    }

    /// One past the last byte.
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    /// Number of pages in the range.
    pub fn pages(&self) -> usize {
        self.len >> PAGE_SHIFT
    }

    /// Whether `addr` falls inside the range.
    pub fn contains(&self, addr: usize) -> bool {
        (self.start..self.end()).contains(&addr)
    }

    /// Start addresses of every page, in increasing order.
    pub fn page_addrs(&self) -> impl DoubleEndedIterator<Item = usize> + use<> {
        (self.start..self.end()).step_by(PAGE_SIZE)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X}..0x{:X}", self.start, self.end())
    }
}

/// One page-table entry as seen by a walk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageEntry {
    /// Virtual address of the page the entry maps
    pub addr: usize,
    /// Whether a physical frame currently backs the page
    pub present: bool,
    /// The backing frame, if present and known
    pub pfn: Option<u64>,
}

/// Walks the page-table entries covering a region.
pub trait PageTableWalk {
    /// Calls `f` once for every entry covering `region`, in increasing address order.
    ///
    /// Implementations must not hold locks across calls to `f`: the callback
    /// is allowed to fault pages of this same address space in.
    ///
    /// # Errors
    ///
    /// Returns an error if the page tables cannot be read or the region is
    /// not mapped.
    fn walk(&self, region: Region, f: &mut dyn FnMut(PageEntry)) -> Result<(), MappingError>;
}

/// The mapping contract: create, reference and destroy anonymous mappings.
pub trait AddressSpace: PageTableWalk {
    /// Creates a private anonymous mapping of `pages` pages, initially not resident.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Map`] if the mapping cannot be created.
    fn map_anonymous(&self, pages: u64) -> Result<Region, MappingError>;

    /// Writes to `addr`, faulting its page in if it is not resident.
    ///
    /// # Errors
    ///
    /// Returns an error if `addr` is not mapped or no frame can back it.
    fn touch(&self, addr: usize) -> Result<(), MappingError>;

    /// Destroys a mapping created by [`map_anonymous()`](AddressSpace::map_anonymous).
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Unmap`] if the mapping cannot be removed.
    fn unmap(&self, region: Region) -> Result<(), MappingError>;
}

#[cfg(test)]
mod tests {
    use super::Region;
    use crate::util::PAGE_SIZE;

    #[test]
    fn test_region_pages() {
        let r = Region::new(0x10000, 4);
        assert_eq!(r.pages(), 4);
        assert_eq!(r.end(), 0x10000 + 4 * PAGE_SIZE);
        assert!(r.contains(0x10000 + 3 * PAGE_SIZE + 12));
        assert!(!r.contains(r.end()));
        let addrs: Vec<usize> = r.page_addrs().collect();
        assert_eq!(addrs.len(), 4);
        assert_eq!(addrs[1], 0x10000 + PAGE_SIZE);
    }
}
