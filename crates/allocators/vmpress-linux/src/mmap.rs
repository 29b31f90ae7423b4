use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_POPULATE, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use log::{debug, trace, warn};
use lpfs::proc::buddyinfo::buddyinfo;
use pagemap2::VirtualMemoryArea;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use vmpress_core::allocator::{AllocMode, FreeAreas, PageAllocator, ZoneClass, ZoneSnapshot};
use vmpress_core::util::{PAGE_SIZE, Size};

use crate::zoneinfo::{read_zoneinfo, snapshot, zone_of_pfn};
use crate::{LinuxError, ProcErrWrap};

/// `free_pages` reads answered from one `/proc/zoneinfo` parse.
const ZONEINFO_REFRESH: u32 = 64;

#[derive(Clone, Copy, Debug)]
struct CachedFree {
    free: u64,
    reads: u32,
}

/// Free page counts from the last zoneinfo parse, adjusted for the pages
/// mapped and unmapped through this allocator since.
#[derive(Debug, Default)]
struct FreePageCache {
    zones: HashMap<ZoneClass, CachedFree>,
}

impl FreePageCache {
    fn get<E>(
        &mut self,
        zone: ZoneClass,
        refresh: impl FnOnce() -> Result<u64, E>,
    ) -> Result<u64, E> {
        match self.zones.get_mut(&zone) {
            Some(cached) if cached.reads < ZONEINFO_REFRESH => {
                cached.reads += 1;
                Ok(cached.free)
            }
            _ => {
                let free = refresh()?;
                self.zones.insert(zone, CachedFree { free, reads: 1 });
                Ok(free)
            }
        }
    }

    fn charge(&mut self, zone: ZoneClass, pages: u64) {
        if let Some(cached) = self.zones.get_mut(&zone) {
            cached.free = cached.free.saturating_sub(pages);
        }
    }

    fn credit(&mut self, zone: ZoneClass, pages: u64) {
        if let Some(cached) = self.zones.get_mut(&zone) {
            cached.free = cached.free.saturating_add(pages);
        }
    }

    fn invalidate(&mut self) {
        self.zones.clear();
    }
}

/// A populated anonymous mapping of `2^order` pages.
#[derive(Debug)]
pub struct MmapBlock {
    ptr: NonNull<c_void>,
    len: usize,
    zone: ZoneClass,
}

impl MmapBlock {
    /// Start of the block.
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }
}

/// Pressures the kernel's page allocator through populated anonymous mappings.
///
/// Each block is a private mapping faulted in completely at `mmap` time, so
/// the kernel allocates its frames immediately. Blocks are virtually but not
/// necessarily physically contiguous. User space cannot request a
/// non-sleeping allocation: both [`AllocMode`]s populate the same way, and
/// an allocation fails only when the kernel refuses the mapping.
///
/// Zone counters come from `/proc/zoneinfo`, fragmentation from
/// `/proc/buddyinfo`, and the zone of a block from `/proc/self/pagemap`,
/// which reports frame numbers only to privileged processes.
///
/// [`PageAllocator::free_pages`] sits in the allocation loop, so it parses
/// zoneinfo only every few calls and tracks this allocator's own blocks in
/// between. A [`PageAllocator::zone_snapshot`] always reads fresh counters.
pub struct MmapPageAllocator {
    pagemap: Option<pagemap2::PageMap>,
    free_cache: RefCell<FreePageCache>,
}

impl MmapPageAllocator {
    /// Creates the allocator.
    ///
    /// If the pagemap cannot be opened, blocks are attributed to
    /// [`ZoneClass::Normal`].
    pub fn new() -> Self {
        let pagemap = match pagemap2::PageMap::new(std::process::id() as u64) {
            Ok(p) => Some(p),
            Err(e) => {
                warn!("Cannot open pagemap, zone attribution disabled: {:?}", e);
                None
            }
        };
        Self {
            pagemap,
            free_cache: RefCell::default(),
        }
    }

    fn resolve_zone(&mut self, addr: usize) -> ZoneClass {
        let Some(pagemap) = self.pagemap.as_mut() else {
            return ZoneClass::Normal;
        };
        let vma = VirtualMemoryArea::from((addr as u64, (addr + PAGE_SIZE) as u64));
        let pfn = pagemap
            .pagemap_vma(&vma)
            .ok()
            .and_then(|entries| entries.first().and_then(|e| e.pfn().ok()));
        match pfn {
            Some(0) | None => ZoneClass::Normal,
            Some(pfn) => zone_of_pfn(pfn).unwrap_or(ZoneClass::Normal),
        }
    }
}

impl Default for MmapPageAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PageAllocator for MmapPageAllocator {
    type Handle = MmapBlock;
    type Error = LinuxError;

    fn allocate(&mut self, order: usize, mode: AllocMode) -> Option<MmapBlock> {
        let len = Size::order(order).bytes();
        let v = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_POPULATE,
                -1,
                0,
            )
        };
        if v == MAP_FAILED {
            debug!(
                "mmap of order {} ({:?}) failed: {}",
                order,
                mode,
                std::io::Error::last_os_error()
            );
            return None;
        }
        let ptr = NonNull::new(v)?;
        let zone = self.resolve_zone(ptr.as_ptr() as usize);
        self.free_cache.get_mut().charge(zone, 1 << order);
        trace!("order {} block at {:p} in {}", order, ptr, zone);
        Some(MmapBlock { ptr, len, zone })
    }

    fn free(&mut self, handle: MmapBlock, order: usize) {
        debug_assert_eq!(handle.len, Size::order(order).bytes());
        if unsafe { libc::munmap(handle.ptr.as_ptr(), handle.len) } != 0 {
            warn!(
                "munmap of {:p} failed: {}",
                handle.ptr,
                std::io::Error::last_os_error()
            );
            return;
        }
        self.free_cache
            .get_mut()
            .credit(handle.zone, (handle.len / PAGE_SIZE) as u64);
    }

    fn zone_snapshot(&self, zone: ZoneClass) -> Result<Option<ZoneSnapshot>, LinuxError> {
        self.free_cache.borrow_mut().invalidate();
        Ok(snapshot(&read_zoneinfo()?, zone))
    }

    fn free_pages(&self, zone: ZoneClass) -> u64 {
        let free = self.free_cache.borrow_mut().get(zone, || {
            read_zoneinfo().map(|zones| snapshot(&zones, zone).map_or(0, |s| s.free_pages))
        });
        free.unwrap_or_else(|e| {
            warn!("Cannot read free pages of {}: {}", zone, e);
            0
        })
    }

    fn zone_of(&self, handle: &MmapBlock) -> ZoneClass {
        handle.zone
    }

    fn total_pages(&self) -> u64 {
        let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        u64::try_from(pages).unwrap_or(0)
    }

    fn free_areas(&self) -> Result<Vec<FreeAreas>, LinuxError> {
        let infos = buddyinfo().map_err(ProcErrWrap::from)?;
        Ok(infos
            .iter()
            .filter_map(|info| {
                let zone = ZoneClass::from_name(info.zone())?;
                Some(FreeAreas {
                    node: *info.node() as usize,
                    zone,
                    free: *info.free_areas(),
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{FreePageCache, MmapPageAllocator, ZONEINFO_REFRESH};
    use vmpress_core::allocator::{AllocMode, PageAllocator, ZoneClass};

    #[test]
    fn test_free_cache_rereads_periodically() {
        let mut cache = FreePageCache::default();
        let mut parses = 0;
        for _ in 0..ZONEINFO_REFRESH * 3 {
            let free = cache.get(ZoneClass::Normal, || {
                parses += 1;
                Ok::<_, ()>(1000)
            });
            assert_eq!(free, Ok(1000));
        }
        assert_eq!(parses, 3);
    }

    #[test]
    fn test_free_cache_tracks_own_blocks() {
        let mut cache = FreePageCache::default();
        assert_eq!(cache.get(ZoneClass::Normal, || Ok::<_, ()>(100)), Ok(100));
        cache.charge(ZoneClass::Normal, 16);
        cache.charge(ZoneClass::Dma, 16);
        assert_eq!(cache.get(ZoneClass::Normal, || Err(())), Ok(84));
        cache.credit(ZoneClass::Normal, 8);
        cache.charge(ZoneClass::Normal, 1000);
        assert_eq!(cache.get(ZoneClass::Normal, || Err(())), Ok(0));
        cache.invalidate();
        assert_eq!(cache.get(ZoneClass::Normal, || Ok::<_, ()>(7)), Ok(7));
    }

    #[test]
    fn test_free_cache_does_not_keep_errors() {
        let mut cache = FreePageCache::default();
        assert_eq!(cache.get(ZoneClass::Normal, || Err::<u64, _>("gone")), Err("gone"));
        assert_eq!(cache.get(ZoneClass::Normal, || Ok::<_, &str>(5)), Ok(5));
    }

    #[test]
    #[ignore = "allocates from the host kernel"]
    fn test_allocate_and_free() {
        let mut alloc = MmapPageAllocator::new();
        let block = alloc.allocate(4, AllocMode::Blocking).expect("mmap");
        assert_eq!(block.addr() % 4096, 0);
        alloc.free(block, 4);
    }

    #[test]
    #[ignore = "reads /proc of the host"]
    fn test_host_zones() -> anyhow::Result<()> {
        let alloc = MmapPageAllocator::new();
        assert!(alloc.zones().contains(&ZoneClass::Normal));
        assert!(!alloc.free_areas()?.is_empty());
        assert!(alloc.total_pages() > 0);
        Ok(())
    }
}
