//! In-crate fakes for unit tests.

use std::cell::RefCell;
use std::convert::Infallible;

use crate::allocator::{AllocMode, FreeAreas, PageAllocator, Watermarks, ZoneClass, ZoneSnapshot};
use crate::error::MappingError;
use crate::mapping::{AddressSpace, PageEntry, PageTableWalk, Region};
use crate::util::{MAX_ORDER, PAGE_SIZE};

/// Single-zone allocator that counts pages and can be told to start failing.
pub struct FakeAllocator {
    pub zone: ZoneClass,
    pub free: u64,
    pub present: u64,
    pub watermarks: Watermarks,
    pub fail_after: Option<u64>,
    pub attempts: u64,
    pub outstanding: u64,
    next: u64,
}

impl FakeAllocator {
    pub fn new(free: u64, present: u64, watermarks: Watermarks) -> Self {
        Self {
            zone: ZoneClass::Normal,
            free,
            present,
            watermarks,
            fail_after: None,
            attempts: 0,
            outstanding: 0,
            next: 0,
        }
    }
}

impl PageAllocator for FakeAllocator {
    type Handle = u64;
    type Error = Infallible;

    fn allocate(&mut self, order: usize, _mode: AllocMode) -> Option<u64> {
        self.attempts += 1;
        let pages = 1 << order;
        if self.fail_after.is_some_and(|n| self.attempts > n) || self.free < pages {
            return None;
        }
        self.free -= pages;
        self.outstanding += 1;
        self.next += 1;
        Some(self.next)
    }

    fn free(&mut self, _handle: u64, order: usize) {
        self.free += 1 << order;
        self.outstanding -= 1;
    }

    fn zone_snapshot(&self, zone: ZoneClass) -> Result<Option<ZoneSnapshot>, Infallible> {
        Ok((zone == self.zone).then_some(ZoneSnapshot {
            zone,
            free_pages: self.free,
            watermarks: self.watermarks,
            present_pages: self.present,
            spanned_pages: self.present,
        }))
    }

    fn free_pages(&self, zone: ZoneClass) -> u64 {
        if zone == self.zone { self.free } else { 0 }
    }

    fn zone_of(&self, _handle: &u64) -> ZoneClass {
        self.zone
    }

    fn total_pages(&self) -> u64 {
        self.present
    }

    fn free_areas(&self) -> Result<Vec<FreeAreas>, Infallible> {
        let mut free = [0; MAX_ORDER];
        free[0] = self.free;
        Ok(vec![FreeAreas {
            node: 0,
            zone: self.zone,
            free,
        }])
    }
}

/// Address space with one flat page table.
pub struct FlatTable {
    base: usize,
    present: RefCell<Vec<bool>>,
}

impl FlatTable {
    pub fn new() -> Self {
        Self {
            base: 0x4000_0000,
            present: RefCell::new(vec![]),
        }
    }

    /// Maps `pages` pages right away, with the listed page indices resident.
    pub fn with_resident(pages: usize, resident: &[usize]) -> (Self, Region) {
        let table = Self::new();
        let mut present = vec![false; pages];
        for &i in resident {
            present[i] = true;
        }
        *table.present.borrow_mut() = present;
        let region = Region::new(table.base, pages);
        (table, region)
    }

    /// Drops the frame backing page `idx`.
    pub fn evict(&self, idx: usize) {
        self.present.borrow_mut()[idx] = false;
    }

    fn index(&self, addr: usize) -> Result<usize, MappingError> {
        let idx = addr.wrapping_sub(self.base) / PAGE_SIZE;
        if addr < self.base || idx >= self.present.borrow().len() {
            return Err(MappingError::NotMapped(addr));
        }
        Ok(idx)
    }
}

impl PageTableWalk for FlatTable {
    fn walk(&self, region: Region, f: &mut dyn FnMut(PageEntry)) -> Result<(), MappingError> {
        for addr in region.page_addrs() {
            let idx = self.index(addr)?;
            let present = self.present.borrow()[idx];
            f(PageEntry {
                addr,
                present,
                pfn: None,
            });
        }
        Ok(())
    }
}

impl AddressSpace for FlatTable {
    fn map_anonymous(&self, pages: u64) -> Result<Region, MappingError> {
        *self.present.borrow_mut() = vec![false; pages as usize];
        Ok(Region::new(self.base, pages as usize))
    }

    fn touch(&self, addr: usize) -> Result<(), MappingError> {
        let idx = self.index(addr)?;
        self.present.borrow_mut()[idx] = true;
        Ok(())
    }

    fn unmap(&self, region: Region) -> Result<(), MappingError> {
        if region.start != self.base {
            return Err(MappingError::NotMapped(region.start));
        }
        self.present.borrow_mut().clear();
        Ok(())
    }
}
