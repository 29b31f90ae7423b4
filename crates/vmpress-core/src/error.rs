//! Error types of the harness.
//!
//! Per-attempt allocation failures are never errors: they are counted in the
//! statistics. Only setup failures (parameters, bookkeeping, mappings) abort
//! an invocation.

use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::allocator::ZoneClass;

/// Invalid or unattainable test parameters. No allocator state was mutated.
#[derive(Debug, Error)]
pub enum ParameterError {
    /// The target zone does not exist
    #[error("Could not find zone {0}")]
    ZoneNotFound(ZoneClass),
    /// The target zone could not be read
    #[error("Could not read zone {zone}: {reason}")]
    ZoneUnreadable {
        /// Zone that was queried
        zone: ZoneClass,
        /// Backend error message
        reason: String,
    },
    /// The zone is already at or below the free-page floor
    #[error("Only {free} pages free on zone with watermark of {floor}")]
    NoHeadroom {
        /// Free pages at snapshot time
        free: u64,
        /// Computed free-page floor
        floor: u64,
    },
    /// An explicit page count exceeds the headroom above the floor
    #[error("Requested test of {requested} pages where {limit} is the limit")]
    Unattainable {
        /// Requested page count
        requested: u64,
        /// Free pages minus floor
        limit: u64,
    },
    /// The resolved page count exceeds what the zone can address
    #[error("{pages} pages exceeds the {capacity} pages addressable by zone {zone}")]
    ExceedsZone {
        /// Resolved page count
        pages: u64,
        /// Zone capacity
        capacity: u64,
        /// Target zone
        zone: ZoneClass,
    },
    /// A high-order run was asked for an order outside `0..MAX_ORDER`
    #[error("Order request of {0} makes no sense")]
    InvalidOrder(usize),
    /// A high-order run was asked for zero attempts
    #[error("Number of allocations must be positive")]
    ZeroAttempts,
    /// Blocking signals for a ZERO tier pass failed
    #[error("Could not block signals: {0}")]
    SignalMask(#[source] std::io::Error),
}

/// Failure to create, touch, walk or destroy a test mapping.
#[derive(Debug, Error)]
pub enum MappingError {
    /// Creating the mapping failed
    #[error("Failed to map {pages} pages: {source}")]
    Map {
        /// Requested size in pages
        pages: u64,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },
    /// Tearing down the mapping failed
    #[error("Failed to unmap memory area at 0x{addr:x}: {source}")]
    Unmap {
        /// Start of the region
        addr: usize,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },
    /// The address is not inside any mapping of this address space
    #[error("Address 0x{0:x} is not mapped")]
    NotMapped(usize),
    /// Reading the page tables failed
    #[error("Page table walk failed: {0}")]
    Walk(String),
    /// No frame could be found to back a faulting page
    #[error("Out of memory faulting in 0x{0:x}")]
    OutOfMemory(usize),
}

/// Error that aborts a whole test invocation.
#[derive(Debug, Error)]
pub enum TestError {
    /// Parameters were invalid; the test did not start
    #[error(transparent)]
    Parameter(#[from] ParameterError),
    /// Bookkeeping for page handles could not be allocated
    #[error("Unable to allocate memory ({0} handles) for page pointers")]
    ResourceExhaustion(u64),
    /// A test mapping could not be created or destroyed
    #[error(transparent)]
    Mapping(#[from] MappingError),
}

impl Serialize for TestError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
