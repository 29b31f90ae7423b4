use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use vmpress_core::allocator::{AllocMode, FreeAreas, PageAllocator, Watermarks, ZoneClass, ZoneSnapshot};

use crate::buddy::BuddyZone;
use crate::config::{FailurePlan, SimConfig};
use crate::SimError;

/// One zone of simulated physical memory.
#[derive(Debug)]
pub(crate) struct SimZone {
    pub(crate) class: ZoneClass,
    pub(crate) node: usize,
    pub(crate) base_pfn: u64,
    pub(crate) pages: u64,
    pub(crate) watermarks: Watermarks,
    /// Mirror of the free lists' page count, readable without the lock
    free_count: AtomicU64,
    /// The zone lock
    buddy: Mutex<BuddyZone>,
}

impl SimZone {
    fn lock(&self) -> MutexGuard<'_, BuddyZone> {
        self.buddy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn alloc(&self, order: usize) -> Option<u64> {
        let mut buddy = self.lock();
        let pfn = buddy.alloc(order)?;
        self.free_count.fetch_sub(1 << order, Ordering::Relaxed);
        Some(self.base_pfn + pfn)
    }

    fn free(&self, pfn: u64, order: usize) {
        let mut buddy = self.lock();
        let before = buddy.free_pages();
        buddy.free(pfn - self.base_pfn, order);
        let freed = buddy.free_pages() - before;
        self.free_count.fetch_add(freed, Ordering::Relaxed);
    }
}

/// Simulated physical memory shared by the allocator and address spaces.
#[derive(Debug)]
pub(crate) struct SimMemory {
    pub(crate) zones: Vec<SimZone>,
}

impl SimMemory {
    pub(crate) fn new(config: &SimConfig) -> Result<Self, SimError> {
        config.validate()?;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let mut base_pfn = 0;
        let mut zones = Vec::with_capacity(config.zones.len());
        for z in &config.zones {
            let mut buddy = BuddyZone::new(z.pages);
            let pinned = (z.pages as f64 * config.fragmentation) as u64;
            let mut taken = 0;
            while taken < pinned {
                if buddy.take_page(rng.random_range(0..z.pages)) {
                    taken += 1;
                }
            }
            debug!(
                "zone {} at pfn {}: {} pages, {} pinned",
                z.zone, base_pfn, z.pages, pinned
            );
            zones.push(SimZone {
                class: z.zone,
                node: z.node,
                base_pfn,
                pages: z.pages,
                watermarks: z.watermarks,
                free_count: AtomicU64::new(buddy.free_pages()),
                buddy: Mutex::new(buddy),
            });
            base_pfn += z.pages;
        }
        Ok(Self { zones })
    }

    /// Allocates from the highest zone at or below `ceiling` that has a free
    /// block, falling back towards lower memory. Zones above `ceiling` are
    /// never touched.
    pub(crate) fn alloc(&self, order: usize, ceiling: ZoneClass) -> Option<SimPage> {
        self.zones
            .iter()
            .rev()
            .filter(|zone| zone.class <= ceiling)
            .find_map(|zone| {
                zone.alloc(order).map(|pfn| SimPage {
                    pfn,
                    zone: zone.class,
                })
            })
    }

    pub(crate) fn free(&self, page: SimPage, order: usize) {
        match self.zone_holding(page.pfn) {
            Some(zone) => zone.free(page.pfn, order),
            None => debug!("pfn {} outside simulated memory", page.pfn),
        }
    }

    fn zone_holding(&self, pfn: u64) -> Option<&SimZone> {
        self.zones
            .iter()
            .find(|z| (z.base_pfn..z.base_pfn + z.pages).contains(&pfn))
    }

    fn zone(&self, class: ZoneClass) -> Option<&SimZone> {
        self.zones.iter().find(|z| z.class == class)
    }
}

/// Highest zone kernel allocations may be served from. HighMem and Movable
/// only back user pages.
pub(crate) const KERNEL_ZONE_CEILING: ZoneClass = ZoneClass::Normal;

/// A block handed out by the simulator.
///
/// Handles are deliberately not `Clone`: each one is freed exactly once.
#[derive(Debug, PartialEq, Eq)]
pub struct SimPage {
    /// First page frame of the block
    pub pfn: u64,
    /// Zone the block came from
    pub zone: ZoneClass,
}

/// Deterministic buddy allocator with watermarked zones.
///
/// Free lists are protected by a lock per zone; free page counts are kept
/// in atomics so they can be read without it. Address spaces created with
/// [`SimAllocator::address_space`] draw their frames from the same zones.
#[derive(Debug, Clone)]
pub struct SimAllocator {
    pub(crate) memory: Arc<SimMemory>,
    failure: Option<FailurePlan>,
    attempts: Arc<AtomicU64>,
}

impl SimAllocator {
    /// Builds the simulated machine described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidConfig`] if the configuration is inconsistent.
    pub fn new(config: &SimConfig) -> Result<Self, SimError> {
        let memory = SimMemory::new(config)?;
        info!(
            "Simulating {} zones, {} pages",
            memory.zones.len(),
            memory.zones.iter().map(|z| z.pages).sum::<u64>()
        );
        Ok(Self {
            memory: Arc::new(memory),
            failure: config.failure,
            attempts: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Allocation attempts made through [`PageAllocator::allocate`].
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    fn injected_failure(&self, order: usize) -> bool {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed) + 1;
        self.failure
            .is_some_and(|plan| order >= plan.min_order && attempt > plan.after_attempts)
    }
}

impl PageAllocator for SimAllocator {
    type Handle = SimPage;
    type Error = SimError;

    fn allocate(&mut self, order: usize, mode: AllocMode) -> Option<SimPage> {
        if self.injected_failure(order) {
            trace!("injected failure for order {} ({:?})", order, mode);
            return None;
        }
        self.memory.alloc(order, KERNEL_ZONE_CEILING)
    }

    fn free(&mut self, handle: SimPage, order: usize) {
        self.memory.free(handle, order);
    }

    fn zone_snapshot(&self, zone: ZoneClass) -> Result<Option<ZoneSnapshot>, SimError> {
        Ok(self.memory.zone(zone).map(|z| {
            let buddy = z.lock();
            ZoneSnapshot {
                zone,
                free_pages: buddy.free_pages(),
                watermarks: z.watermarks,
                present_pages: z.pages,
                spanned_pages: z.pages,
            }
        }))
    }

    fn free_pages(&self, zone: ZoneClass) -> u64 {
        self.memory
            .zones
            .iter()
            .filter(|z| z.class == zone)
            .map(|z| z.free_count.load(Ordering::Relaxed))
            .sum()
    }

    fn zone_of(&self, handle: &SimPage) -> ZoneClass {
        handle.zone
    }

    fn total_pages(&self) -> u64 {
        self.memory.zones.iter().map(|z| z.pages).sum()
    }

    fn free_areas(&self) -> Result<Vec<FreeAreas>, SimError> {
        Ok(self
            .memory
            .zones
            .iter()
            .map(|z| FreeAreas {
                node: z.node,
                zone: z.class,
                free: z.lock().counts(),
            })
            .collect())
    }
}
