//! Linux backend for vmpress.
//!
//! Drives the running kernel's page allocator from user space:
//!
//! - [`MmapPageAllocator`] allocates blocks as populated anonymous mappings
//!   and reads zone state from `/proc/zoneinfo` and `/proc/buddyinfo`.
//! - [`LinuxAddressSpace`] maps, touches and unmaps memory of the calling
//!   process and walks its page tables through `/proc/self/pagemap`.
//!
//! Frame numbers in the pagemap are only visible to privileged processes;
//! without them zone attribution falls back to the normal zone.

#![warn(missing_docs)]

mod mmap;
mod space;
mod zoneinfo;

pub use crate::mmap::{MmapBlock, MmapPageAllocator};
pub use crate::space::LinuxAddressSpace;
pub use crate::zoneinfo::{ZoneInfo, parse_zoneinfo, read_zoneinfo};

use lpfs::ProcErr;
use pagemap2::PageMapError;
use thiserror::Error;

/// Wrapper for ProcErr, which does not implement Error.
#[derive(Debug)]
pub struct ProcErrWrap(ProcErr);

impl std::fmt::Display for ProcErrWrap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl std::error::Error for ProcErrWrap {}

impl From<ProcErr> for ProcErrWrap {
    fn from(value: ProcErr) -> Self {
        Self(value)
    }
}

/// Errors reading kernel state.
#[derive(Debug, Error)]
pub enum LinuxError {
    /// Reading a `/proc` file through lpfs failed
    #[error(transparent)]
    Proc(#[from] ProcErrWrap),
    /// Reading a `/proc` file failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Opening or reading the pagemap failed
    #[error(transparent)]
    PageMap(#[from] PageMapError),
    /// A `/proc` file had unexpected content
    #[error("Cannot parse zoneinfo: {0}")]
    Parse(String),
}
