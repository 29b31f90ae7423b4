//! Binary buddy free lists for one zone.

use log::warn;
use std::collections::BTreeSet;
use vmpress_core::util::MAX_ORDER;

/// Free lists of one zone, indexed by order.
///
/// Block addresses are page frame numbers relative to the zone start. A
/// block of order `o` is always aligned to `2^o` pages. Lists are ordered,
/// so allocation always hands out the lowest free block, which keeps the
/// simulation deterministic.
#[derive(Debug, Clone)]
pub(crate) struct BuddyZone {
    pages: u64,
    free: [BTreeSet<u64>; MAX_ORDER],
}

impl BuddyZone {
    /// Creates a zone of `pages` pages, all free, carved into the largest
    /// aligned blocks that fit.
    pub(crate) fn new(pages: u64) -> Self {
        let mut zone = Self {
            pages,
            free: Default::default(),
        };
        let mut pfn = 0;
        while pfn < pages {
            let mut order = MAX_ORDER - 1;
            while order > 0 && (pfn % (1 << order) != 0 || pfn + (1 << order) > pages) {
                order -= 1;
            }
            zone.free[order].insert(pfn);
            pfn += 1 << order;
        }
        zone
    }

    /// Takes the lowest free block of `order`, splitting a larger one if needed.
    pub(crate) fn alloc(&mut self, order: usize) -> Option<u64> {
        let found = (order..MAX_ORDER).find(|o| !self.free[*o].is_empty())?;
        let block = self.free[found].pop_first()?;
        for o in (order..found).rev() {
            self.free[o].insert(block + (1 << o));
        }
        Some(block)
    }

    /// Takes the single page `pfn` out of whatever free block holds it.
    ///
    /// Returns `false` if the page is not free.
    pub(crate) fn take_page(&mut self, pfn: u64) -> bool {
        for order in 0..MAX_ORDER {
            let mut start = pfn & !((1u64 << order) - 1);
            if !self.free[order].remove(&start) {
                continue;
            }
            for o in (0..order).rev() {
                let half = 1u64 << o;
                if pfn >= start + half {
                    self.free[o].insert(start);
                    start += half;
                } else {
                    self.free[o].insert(start + half);
                }
            }
            return true;
        }
        false
    }

    /// Returns a block, merging it with free buddies.
    pub(crate) fn free(&mut self, mut pfn: u64, mut order: usize) {
        if pfn + (1 << order) > self.pages || self.overlaps_free(pfn, order) {
            warn!("ignoring bogus free of pfn {} order {}", pfn, order);
            return;
        }
        while order < MAX_ORDER - 1 {
            let buddy = pfn ^ (1 << order);
            if !self.free[order].remove(&buddy) {
                break;
            }
            pfn = pfn.min(buddy);
            order += 1;
        }
        self.free[order].insert(pfn);
    }

    fn overlaps_free(&self, pfn: u64, order: usize) -> bool {
        let end = pfn + (1 << order);
        (0..MAX_ORDER).any(|o| {
            if o >= order {
                self.free[o].contains(&(pfn & !((1u64 << o) - 1)))
            } else {
                self.free[o].range(pfn..end).next().is_some()
            }
        })
    }

    /// Free blocks per order.
    pub(crate) fn counts(&self) -> [u64; MAX_ORDER] {
        std::array::from_fn(|o| self.free[o].len() as u64)
    }

    /// Free pages in all lists.
    pub(crate) fn free_pages(&self) -> u64 {
        self.counts()
            .iter()
            .enumerate()
            .map(|(o, n)| n << o)
            .sum()
    }
}
