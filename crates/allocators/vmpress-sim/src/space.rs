//! Simulated process address space with demand paging.
//!
//! Pages are backed lazily: a mapping starts with no frames, and every
//! [`touch`](AddressSpace::touch) of a non-resident page takes an order-0
//! frame from the shared [`SimMemory`], highest zone first. When no frame is
//! left the space reclaims the page that was faulted in longest ago,
//! mirroring LRU reclaim of anonymous memory.

use log::{debug, trace, warn};
use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use vmpress_core::allocator::ZoneClass;
use vmpress_core::error::MappingError;
use vmpress_core::mapping::{AddressSpace, PageEntry, PageTableWalk, Region};
use vmpress_core::util::{PAGE_SHIFT, PAGE_SIZE, PTRS_PER_TABLE};

use crate::memory::{SimMemory, SimPage};

/// First address handed out by [`SimAddressSpace::map_anonymous`].
const MMAP_BASE: usize = 0x7f00_0000_0000;

#[derive(Clone, Copy, Debug)]
struct Pte {
    pfn: u64,
    zone: ZoneClass,
    /// Position in the fault order, used to spot stale LRU entries
    seq: u64,
}

type Leaf = Box<[Option<Pte>; PTRS_PER_TABLE]>;

#[derive(Debug, Default)]
struct SpaceState {
    next_addr: usize,
    /// Start address to length in pages
    mappings: BTreeMap<usize, usize>,
    /// Leaf tables keyed by virtual page number / PTRS_PER_TABLE
    tables: BTreeMap<usize, Leaf>,
    /// (vpn, seq) in fault order, oldest first
    lru: VecDeque<(usize, u64)>,
    seq: u64,
    resident: u64,
}

impl SpaceState {
    fn entry(&self, vpn: usize) -> Option<Pte> {
        self.tables
            .get(&(vpn / PTRS_PER_TABLE))
            .and_then(|leaf| leaf[vpn % PTRS_PER_TABLE])
    }

    fn slot(&mut self, vpn: usize) -> &mut Option<Pte> {
        let leaf = self
            .tables
            .entry(vpn / PTRS_PER_TABLE)
            .or_insert_with(|| Box::new([None; PTRS_PER_TABLE]));
        &mut leaf[vpn % PTRS_PER_TABLE]
    }

    fn clear(&mut self, vpn: usize) -> Option<Pte> {
        let key = vpn / PTRS_PER_TABLE;
        let leaf = self.tables.get_mut(&key)?;
        let pte = leaf[vpn % PTRS_PER_TABLE].take();
        if leaf.iter().all(Option::is_none) {
            self.tables.remove(&key);
        }
        if pte.is_some() {
            self.resident -= 1;
        }
        pte
    }

    fn mapping_of(&self, addr: usize) -> Option<Region> {
        let (&start, &pages) = self.mappings.range(..=addr).next_back()?;
        let region = Region::new(start, pages);
        region.contains(addr).then_some(region)
    }

    /// Drops the oldest resident page, returning its frame.
    fn evict_oldest(&mut self) -> Option<(usize, Pte)> {
        while let Some((vpn, seq)) = self.lru.pop_front() {
            if self.entry(vpn).is_some_and(|pte| pte.seq == seq) {
                return self.clear(vpn).map(|pte| (vpn, pte));
            }
        }
        None
    }
}

/// An address space whose frames come from a simulated machine.
///
/// Create one with [`SimAllocator::address_space`](crate::SimAllocator::address_space).
/// Frames still mapped when the space is dropped are returned to the
/// allocator.
#[derive(Debug)]
pub struct SimAddressSpace {
    memory: Arc<SimMemory>,
    state: Mutex<SpaceState>,
}

impl SimAddressSpace {
    pub(crate) fn new(memory: Arc<SimMemory>) -> Self {
        Self {
            memory,
            state: Mutex::new(SpaceState {
                next_addr: MMAP_BASE,
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpaceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, pte: Pte) {
        self.memory.free(
            SimPage {
                pfn: pte.pfn,
                zone: pte.zone,
            },
            0,
        );
    }

    /// Reclaims the page at `addr`, as the kernel would under pressure.
    ///
    /// Returns `false` if the page was not resident.
    pub fn evict(&self, addr: usize) -> bool {
        let pte = self.lock().clear(addr >> PAGE_SHIFT);
        match pte {
            Some(pte) => {
                self.release(pte);
                true
            }
            None => false,
        }
    }

    /// Pages of all mappings currently backed by a frame.
    pub fn resident_pages(&self) -> u64 {
        self.lock().resident
    }
}

impl PageTableWalk for SimAddressSpace {
    fn walk(&self, region: Region, f: &mut dyn FnMut(PageEntry)) -> Result<(), MappingError> {
        {
            let state = self.lock();
            let covered = state
                .mapping_of(region.start)
                .is_some_and(|m| region.len == 0 || m.contains(region.end() - 1));
            if !covered {
                return Err(MappingError::NotMapped(region.start));
            }
        }
        for addr in region.page_addrs() {
            let pte = self.lock().entry(addr >> PAGE_SHIFT);
            f(PageEntry {
                addr,
                present: pte.is_some(),
                pfn: pte.map(|p| p.pfn),
            });
        }
        Ok(())
    }
}

impl AddressSpace for SimAddressSpace {
    fn map_anonymous(&self, pages: u64) -> Result<Region, MappingError> {
        let len = usize::try_from(pages)
            .ok()
            .and_then(|p| p.checked_mul(PAGE_SIZE))
            .filter(|len| *len > 0)
            .ok_or_else(|| MappingError::Map {
                pages,
                source: io::Error::from(io::ErrorKind::InvalidInput),
            })?;
        let mut state = self.lock();
        let start = state.next_addr;
        // leave an unmapped guard page between mappings
        state.next_addr = start + len + PAGE_SIZE;
        state.mappings.insert(start, len / PAGE_SIZE);
        debug!("mapped {} pages at 0x{:x}", pages, start);
        Ok(Region { start, len })
    }

    fn touch(&self, addr: usize) -> Result<(), MappingError> {
        let mut state = self.lock();
        if state.mapping_of(addr).is_none() {
            return Err(MappingError::NotMapped(addr));
        }
        let vpn = addr >> PAGE_SHIFT;
        if state.entry(vpn).is_some() {
            return Ok(());
        }
        let page = loop {
            if let Some(page) = self.memory.alloc(0, ZoneClass::Movable) {
                break page;
            }
            match state.evict_oldest() {
                Some((victim, pte)) => {
                    trace!("reclaiming vpn 0x{:x} for 0x{:x}", victim, addr);
                    self.release(pte);
                }
                None => return Err(MappingError::OutOfMemory(addr)),
            }
        };
        state.seq += 1;
        let seq = state.seq;
        *state.slot(vpn) = Some(Pte {
            pfn: page.pfn,
            zone: page.zone,
            seq,
        });
        state.lru.push_back((vpn, seq));
        state.resident += 1;
        Ok(())
    }

    fn unmap(&self, region: Region) -> Result<(), MappingError> {
        let mut state = self.lock();
        if state.mappings.get(&region.start) != Some(&region.pages()) {
            return Err(MappingError::Unmap {
                addr: region.start,
                source: io::Error::new(io::ErrorKind::NotFound, "no mapping of that extent"),
            });
        }
        state.mappings.remove(&region.start);
        let freed: Vec<Pte> = region
            .page_addrs()
            .filter_map(|addr| state.clear(addr >> PAGE_SHIFT))
            .collect();
        drop(state);
        debug!("unmapped {}, {} frames released", region, freed.len());
        for pte in freed {
            self.release(pte);
        }
        Ok(())
    }
}

impl Drop for SimAddressSpace {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let frames: Vec<Pte> = state
            .tables
            .values()
            .flat_map(|leaf| leaf.iter().flatten().copied())
            .collect();
        if !frames.is_empty() {
            warn!("releasing {} frames of a dropped address space", frames.len());
        }
        state.tables.clear();
        for pte in frames {
            self.release(pte);
        }
    }
}
