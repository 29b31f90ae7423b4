use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_NORESERVE, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use log::debug;
use pagemap2::VirtualMemoryArea;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use vmpress_core::error::MappingError;
use vmpress_core::mapping::{AddressSpace, PageEntry, PageTableWalk, Region};
use vmpress_core::util::{PAGE_SIZE, PTRS_PER_TABLE};

use crate::LinuxError;

/// The calling process' own address space.
///
/// Page-table walks read `/proc/self/pagemap` one leaf table (512 pages) at
/// a time, so touching pages from the walk callback is safe.
pub struct LinuxAddressSpace {
    pagemap: Mutex<pagemap2::PageMap>,
    /// Start address to length in pages of every mapping made here
    mappings: Mutex<BTreeMap<usize, usize>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LinuxAddressSpace {
    /// Opens the pagemap of the current process.
    ///
    /// # Errors
    ///
    /// Returns an error if `/proc/self/pagemap` cannot be opened.
    pub fn new() -> Result<Self, LinuxError> {
        Ok(Self {
            pagemap: Mutex::new(pagemap2::PageMap::new(std::process::id() as u64)?),
            mappings: Mutex::new(BTreeMap::new()),
        })
    }

    fn covering(&self, addr: usize) -> Option<Region> {
        let mappings = lock(&self.mappings);
        let (&start, &pages) = mappings.range(..=addr).next_back()?;
        let region = Region::new(start, pages);
        region.contains(addr).then_some(region)
    }
}

impl PageTableWalk for LinuxAddressSpace {
    fn walk(&self, region: Region, f: &mut dyn FnMut(PageEntry)) -> Result<(), MappingError> {
        let covered = self
            .covering(region.start)
            .is_some_and(|m| region.len == 0 || m.contains(region.end() - 1));
        if !covered {
            return Err(MappingError::NotMapped(region.start));
        }
        let mut start = region.start;
        while start < region.end() {
            let end = region.end().min(start + PTRS_PER_TABLE * PAGE_SIZE);
            let vma = VirtualMemoryArea::from((start as u64, end as u64));
            let entries = lock(&self.pagemap)
                .pagemap_vma(&vma)
                .map_err(|e| MappingError::Walk(format!("{:?}", e)))?;
            for (i, addr) in (start..end).step_by(PAGE_SIZE).enumerate() {
                let entry = entries.get(i);
                let present = entry.is_some_and(|e| e.present());
                f(PageEntry {
                    addr,
                    present,
                    pfn: entry
                        .filter(|_| present)
                        .and_then(|e| e.pfn().ok())
                        .filter(|pfn| *pfn != 0),
                });
            }
            start = end;
        }
        Ok(())
    }
}

impl AddressSpace for LinuxAddressSpace {
    fn map_anonymous(&self, pages: u64) -> Result<Region, MappingError> {
        let len = pages as usize * PAGE_SIZE;
        let v = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_NORESERVE,
                -1,
                0,
            )
        };
        if v == MAP_FAILED || len == 0 {
            return Err(MappingError::Map {
                pages,
                source: std::io::Error::last_os_error(),
            });
        }
        let region = Region {
            start: v as usize,
            len,
        };
        lock(&self.mappings).insert(region.start, region.pages());
        debug!("mapped {}", region);
        Ok(region)
    }

    fn touch(&self, addr: usize) -> Result<(), MappingError> {
        if self.covering(addr).is_none() {
            return Err(MappingError::NotMapped(addr));
        }
        // SAFETY: addr lies inside a private writable mapping created by us
        unsafe { std::ptr::write_volatile(addr as *mut u8, 0x5a) };
        Ok(())
    }

    fn unmap(&self, region: Region) -> Result<(), MappingError> {
        let mut mappings = lock(&self.mappings);
        if mappings.get(&region.start) != Some(&region.pages()) {
            return Err(MappingError::Unmap {
                addr: region.start,
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        if unsafe { libc::munmap(region.start as *mut libc::c_void, region.len) } != 0 {
            return Err(MappingError::Unmap {
                addr: region.start,
                source: std::io::Error::last_os_error(),
            });
        }
        mappings.remove(&region.start);
        Ok(())
    }
}
