//! # vmpress
//!
//! vmpress exercises a physical page allocator under controlled pressure:
//! alloc/free passes driven by the allocator's own watermarks, a fault
//! variant that tracks page residency of a mapping, and a high-order runr
//! with adaptive time budgets.
//!
//! This crate re-exports [`vmpress_core`] together with the allocator
//! backends enabled through cargo features:
//!
//! - `sim` (default): [`sim`], a deterministic in-process buddy allocator
//! - `linux`: [`linux`], the running kernel driven from user space
//!
//! ```
//! use vmpress::sim::{SimAllocator, SimConfig};
//! use vmpress::report::ReportBuffer;
//! use vmpress::{Harness, HarnessConfig, PressureTier};
//!
//! let alloc = SimAllocator::new(&SimConfig::default()).unwrap();
//! let mut harness = Harness::new(alloc, HarnessConfig::default());
//! let mut out = ReportBuffer::new("report");
//! let summary = harness.run_alloc(PressureTier::Fast, 2, 256, &mut out).unwrap();
//! assert_eq!(summary.total_allocated, 512);
//! ```

pub use vmpress_core::*;

#[cfg(feature = "linux")]
pub use vmpress_linux as linux;
#[cfg(feature = "sim")]
pub use vmpress_sim as sim;
