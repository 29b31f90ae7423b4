//! In-process page allocator for vmpress.
//!
//! Simulates a machine with watermarked zones managed by a binary buddy
//! allocator, plus address spaces that fault pages in on demand and reclaim
//! the least recently faulted page when memory runs out. Everything is
//! deterministic for a given [`SimConfig`], so the pressure tests can be
//! run and checked without touching the host's memory manager.
//!
//! Blocks from [`PageAllocator::allocate`](vmpress_core::allocator::PageAllocator::allocate)
//! are kernel allocations: they come from Normal or below, never from
//! HighMem or Movable. Pages of an address space may come from any zone.
//!
//! ```
//! use vmpress_core::allocator::{AllocMode, PageAllocator, ZoneClass};
//! use vmpress_sim::{SimAllocator, SimConfig};
//!
//! let mut alloc = SimAllocator::new(&SimConfig::default()).unwrap();
//! let page = alloc.allocate(2, AllocMode::Atomic).unwrap();
//! assert_eq!(alloc.zone_of(&page), ZoneClass::Normal);
//! alloc.free(page, 2);
//! ```

#![warn(missing_docs)]

mod buddy;
mod config;
mod memory;
mod space;

pub use crate::config::{FailurePlan, SimConfig, ZoneConfig};
pub use crate::memory::{SimAllocator, SimPage};
pub use crate::space::SimAddressSpace;

use thiserror::Error;

/// Errors of the simulated backend.
#[derive(Debug, Error)]
pub enum SimError {
    /// Reading a configuration file failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A configuration file is not valid JSON for [`SimConfig`]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// The configuration describes an impossible machine
    #[error("Invalid simulator configuration: {0}")]
    InvalidConfig(String),
}

impl SimAllocator {
    /// Creates an empty address space backed by this allocator's memory.
    pub fn address_space(&self) -> SimAddressSpace {
        SimAddressSpace::new(self.memory.clone())
    }
}
