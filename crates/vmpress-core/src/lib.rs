//! # vmpress Core
//!
//! `vmpress-core` drives a physical page allocator under controlled memory
//! pressure and measures how it copes. It is independent of any particular
//! allocator: everything it needs from the memory manager goes through a
//! small set of traits.
//!
//! ## Architecture Overview
//!
//! - [`allocator::PageAllocator`] - The allocator under test: allocate and
//!   free blocks, read zone counters and watermarks.
//! - [`mapping::AddressSpace`] - Anonymous mappings whose page tables can be
//!   walked, used by the fault tests.
//! - [`report::ReportChannel`] - Growable, line-oriented output.
//! - [`sched::YieldPoint`] and [`util::Clock`] - Scheduling and time, both
//!   injectable so that tests are deterministic.
//!
//! ## Main Components
//!
//! - [`params`] - Derives the free-page floor and op count of a test from a
//!   zone snapshot and a [`PressureTier`].
//! - [`Harness`] - Runs the alloc passes ([`Harness::run_alloc`]), the fault
//!   variant ([`Harness::run_fault`]) and the high-order runr
//!   ([`Harness::run_highorder`]).
//! - [`scan`] - Counts resident pages of a mapping, optionally faulting in
//!   missing ones through an [`scan::EntryVisitor`].
//! - [`control`] - Parses `"<test> <p1> [p2]"` control lines into commands.
//!
//! ## Platform Support
//!
//! The core itself is portable. Backends live in their own crates:
//! `vmpress-sim` simulates a buddy allocator in process, `vmpress-linux`
//! pressures the running Linux kernel from user space.

#![warn(missing_docs)]

#[macro_use]
pub mod report;

pub mod allocator;
pub mod control;
pub mod error;
mod executor;
mod fault;
mod highorder;
pub mod mapping;
pub mod params;
pub mod scan;
pub mod sched;
pub mod signals;
pub mod util;
mod zones;

#[cfg(test)]
mod testing;

pub use crate::allocator::{AllocMode, PageAllocator, ZoneClass, ZoneSnapshot};
pub use crate::control::{Command, Outcome, TestKind};
pub use crate::error::{MappingError, ParameterError, TestError};
pub use crate::executor::{Harness, HarnessConfig, PassStats, PressureSummary, TestRecord};
pub use crate::fault::{FaultPass, FaultSummary};
pub use crate::highorder::{AbortReason, AttemptTiming, HighOrderChannels, HighOrderSummary};
pub use crate::params::{PressureTier, TestParameters, calculate_parameters};
pub use crate::zones::zone_report;
