//! Watermark parameter calculation.
//!
//! Turns a pressure tier and an optional page count into a validated
//! `(zone, free floor, op count)` triple, derived from a snapshot of the
//! target zone. The snapshot is not a guarantee: other allocations keep
//! moving the zone, and the executors tolerate that drift.

use log::{debug, info};
use serde::Serialize;
use std::fmt;

use crate::allocator::{AllocMode, PageAllocator, Watermarks, ZoneClass, ZoneSnapshot};
use crate::error::ParameterError;
use crate::signals::{SignalGuard, SignalPolicy};
use crate::util::{HANDLE_SIZE, PAGE_SIZE};

/// How far below the watermarks a pressure test drives its zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum PressureTier {
    /// Stay at the high watermark, clear of reclaim
    Fast,
    /// Stop between min and low, waking background reclaim
    Low,
    /// Stop at half of min, forcing heavy reclaim
    Min,
    /// Exhaust the zone
    Zero,
}

impl PressureTier {
    /// All tiers, from least to most pressure.
    pub const ALL: [PressureTier; 4] = [
        PressureTier::Fast,
        PressureTier::Low,
        PressureTier::Min,
        PressureTier::Zero,
    ];

    /// Lower-case name used in test names.
    pub fn name(&self) -> &'static str {
        match self {
            PressureTier::Fast => "fast",
            PressureTier::Low => "low",
            PressureTier::Min => "min",
            PressureTier::Zero => "zero",
        }
    }

    /// Parses a lower-case tier name.
    pub fn from_name(name: &str) -> Option<Self> {
        PressureTier::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Free pages that must remain for the test to keep allocating.
    ///
    /// A ZERO tier floor is 1 rather than 0 when allocations may block, so a
    /// sleeping allocation cannot wedge the whole system.
    pub fn free_floor(&self, watermarks: &Watermarks, mode: AllocMode) -> u64 {
        match self {
            PressureTier::Fast => watermarks.high,
            PressureTier::Low => {
                watermarks.min + watermarks.low.saturating_sub(watermarks.min) / 2
            }
            PressureTier::Min => watermarks.min / 2,
            PressureTier::Zero => u64::from(mode.can_block()),
        }
    }
}

impl fmt::Display for PressureTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What the caller asks for.
#[derive(Clone, Copy, Debug)]
pub struct ParameterRequest {
    /// Pressure tier
    pub tier: PressureTier,
    /// Pages per pass; 0 means as many as the tier allows
    pub requested_pages: u64,
    /// Zone to pressure
    pub zone: ZoneClass,
    /// Allocation mode the test will use
    pub mode: AllocMode,
    /// Whether a ZERO tier invocation masks signals
    pub signals: SignalPolicy,
}

impl ParameterRequest {
    /// Request for `tier` against the normal zone with atomic allocations.
    pub fn new(tier: PressureTier, requested_pages: u64) -> Self {
        Self {
            tier,
            requested_pages,
            zone: ZoneClass::Normal,
            mode: AllocMode::Atomic,
            signals: SignalPolicy::Block,
        }
    }
}

/// Floor and op count derived from one zone snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Resolved {
    /// Free pages that must remain in the zone
    pub free_floor: u64,
    /// Pages to allocate per pass
    pub op_count: u64,
}

/// Validated parameters of one test invocation.
///
/// For a ZERO tier invocation this value also holds the signal mask until
/// [`restore_signals`](Self::restore_signals) is called or the parameters
/// are dropped, whichever comes first.
#[derive(Debug, Serialize)]
pub struct TestParameters {
    /// Pressure tier
    pub tier: PressureTier,
    /// Target zone
    pub zone: ZoneClass,
    /// Page count as requested (0 = auto)
    pub requested_op_count: u64,
    /// Free pages that must remain in the zone
    pub free_floor: u64,
    /// Pages to allocate per pass
    pub op_count: u64,
    /// Free pages in the zone when the snapshot was taken
    pub starting_free: u64,
    /// Pages managed by the zone
    pub capacity: u64,
    /// Whether signals were masked for this invocation
    pub signals_blocked: bool,
    #[serde(skip_serializing)]
    signal_guard: Option<SignalGuard>,
}

impl TestParameters {
    /// Whether signals were masked for this invocation.
    ///
    /// Stays `true` after the mask has been restored.
    pub fn signals_blocked(&self) -> bool {
        self.signals_blocked
    }

    /// Whether the calling thread still runs with the mask of this invocation.
    pub fn signals_held(&self) -> bool {
        self.signal_guard.is_some()
    }

    /// Puts back the signal mask the thread had before the invocation.
    pub fn restore_signals(&mut self) {
        if self.signal_guard.take().is_some() {
            info!("Restored signal mask");
        }
    }
}

/// Derives the free floor and op count from a zone snapshot.
///
/// This is a pure function of its inputs.
///
/// * An automatic count for FAST/LOW/MIN is the headroom above the floor,
///   minus the pages needed to hold the handles themselves.
/// * An automatic ZERO count is `free + (capacity - free) / 2`, overshooting
///   into half the slack above the currently free pages.
/// * An explicit count must fit in the headroom, except for ZERO.
///
/// # Errors
///
/// Returns a [`ParameterError`] if the zone has no headroom, the explicit
/// count exceeds it, or the resolved count exceeds the zone capacity.
pub fn resolve(
    snapshot: &ZoneSnapshot,
    tier: PressureTier,
    requested_pages: u64,
    mode: AllocMode,
) -> Result<Resolved, ParameterError> {
    let free = snapshot.free_pages;
    let free_floor = tier.free_floor(&snapshot.watermarks, mode);
    if free <= free_floor {
        return Err(ParameterError::NoHeadroom {
            free,
            floor: free_floor,
        });
    }
    let headroom = free - free_floor;

    let op_count = if requested_pages > 0 {
        if tier != PressureTier::Zero && requested_pages > headroom {
            return Err(ParameterError::Unattainable {
                requested: requested_pages,
                limit: headroom,
            });
        }
        requested_pages
    } else if tier == PressureTier::Zero {
        free + snapshot.present_pages.saturating_sub(free) / 2
    } else {
        headroom.saturating_sub(headroom * HANDLE_SIZE as u64 / PAGE_SIZE as u64 + 1)
    };

    if op_count == 0 {
        return Err(ParameterError::NoHeadroom {
            free,
            floor: free_floor,
        });
    }
    if op_count > snapshot.present_pages {
        return Err(ParameterError::ExceedsZone {
            pages: op_count,
            capacity: snapshot.present_pages,
            zone: snapshot.zone,
        });
    }
    Ok(Resolved {
        free_floor,
        op_count,
    })
}

/// Snapshots the target zone and validates a test request against it.
///
/// The zone lock is held only for the snapshot. For the ZERO tier, signals
/// of the calling thread are masked once validation succeeded (see
/// [`SignalPolicy`]).
///
/// # Errors
///
/// Returns a [`ParameterError`] if the zone is missing or unreadable, or the
/// request cannot be satisfied. No allocator state is touched in that case.
pub fn calculate_parameters<A: PageAllocator + ?Sized>(
    allocator: &A,
    request: &ParameterRequest,
) -> Result<TestParameters, ParameterError> {
    let snapshot = allocator
        .zone_snapshot(request.zone)
        .map_err(|e| ParameterError::ZoneUnreadable {
            zone: request.zone,
            reason: e.to_string(),
        })?
        .ok_or(ParameterError::ZoneNotFound(request.zone))?;
    debug!("zone snapshot: {:?}", snapshot);

    let resolved = resolve(&snapshot, request.tier, request.requested_pages, request.mode)?;

    let signal_guard = match (request.tier, request.signals) {
        (PressureTier::Zero, SignalPolicy::Block) => {
            info!("Blocking signals for exhaustion pass");
            Some(SignalGuard::block_all().map_err(ParameterError::SignalMask)?)
        }
        _ => None,
    };

    Ok(TestParameters {
        tier: request.tier,
        zone: request.zone,
        requested_op_count: request.requested_pages,
        free_floor: resolved.free_floor,
        op_count: resolved.op_count,
        starting_free: snapshot.free_pages,
        capacity: snapshot.present_pages,
        signals_blocked: signal_guard.is_some(),
        signal_guard,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(free: u64, min: u64, low: u64, high: u64, present: u64) -> ZoneSnapshot {
        ZoneSnapshot {
            zone: ZoneClass::Normal,
            free_pages: free,
            watermarks: Watermarks { min, low, high },
            present_pages: present,
            spanned_pages: present,
        }
    }

    #[test]
    fn test_floor_per_tier() {
        let wm = Watermarks {
            min: 200,
            low: 250,
            high: 300,
        };
        assert_eq!(PressureTier::Fast.free_floor(&wm, AllocMode::Atomic), 300);
        assert_eq!(PressureTier::Low.free_floor(&wm, AllocMode::Atomic), 225);
        assert_eq!(PressureTier::Min.free_floor(&wm, AllocMode::Atomic), 100);
        assert_eq!(PressureTier::Zero.free_floor(&wm, AllocMode::Atomic), 0);
        assert_eq!(PressureTier::Zero.free_floor(&wm, AllocMode::Blocking), 1);
    }

    #[test]
    fn test_fast_explicit_count_is_kept() -> anyhow::Result<()> {
        let snap = zone(10_000, 300, 400, 500, 20_000);
        let r = resolve(&snap, PressureTier::Fast, 100, AllocMode::Atomic)?;
        assert_eq!(r.free_floor, 500);
        assert_eq!(r.op_count, 100);
        Ok(())
    }

    #[test]
    fn test_min_auto_count_pays_for_bookkeeping() -> anyhow::Result<()> {
        let snap = zone(1000, 200, 250, 300, 4000);
        let r = resolve(&snap, PressureTier::Min, 0, AllocMode::Atomic)?;
        assert_eq!(r.free_floor, 100);
        assert_eq!(r.op_count, 900 - (900 * 8 / 4096 + 1));
        Ok(())
    }

    #[test]
    fn test_zero_auto_count_overshoots() -> anyhow::Result<()> {
        let snap = zone(500, 20, 25, 30, 2000);
        let r = resolve(&snap, PressureTier::Zero, 0, AllocMode::Atomic)?;
        assert_eq!(r.free_floor, 0);
        assert_eq!(r.op_count, 1250);
        let r = resolve(&snap, PressureTier::Zero, 0, AllocMode::Blocking)?;
        assert_eq!(r.free_floor, 1);
        assert_eq!(r.op_count, 1250);
        Ok(())
    }

    #[test]
    fn test_zero_accepts_explicit_count_above_headroom() -> anyhow::Result<()> {
        let snap = zone(500, 20, 25, 30, 2000);
        let r = resolve(&snap, PressureTier::Zero, 800, AllocMode::Atomic)?;
        assert_eq!(r.op_count, 800);
        Ok(())
    }

    #[test]
    fn test_explicit_count_beyond_headroom_rejected() {
        let snap = zone(1000, 200, 250, 300, 4000);
        let err = resolve(&snap, PressureTier::Fast, 701, AllocMode::Atomic).unwrap_err();
        assert!(matches!(
            err,
            ParameterError::Unattainable {
                requested: 701,
                limit: 700
            }
        ));
    }

    #[test]
    fn test_no_headroom_rejected() {
        let snap = zone(300, 200, 250, 300, 4000);
        let err = resolve(&snap, PressureTier::Fast, 0, AllocMode::Atomic).unwrap_err();
        assert!(matches!(err, ParameterError::NoHeadroom { free: 300, floor: 300 }));
    }

    #[test]
    fn test_count_beyond_capacity_rejected() {
        let snap = zone(500, 20, 25, 30, 2000);
        let err = resolve(&snap, PressureTier::Zero, 5000, AllocMode::Atomic).unwrap_err();
        assert!(matches!(err, ParameterError::ExceedsZone { pages: 5000, .. }));
    }

    #[test]
    fn test_headroom_invariant_holds_for_every_tier() {
        for free in [2u64, 17, 301, 999, 10_000, 123_457] {
            let snap = zone(free, 40, 60, 80, 200_000);
            for tier in [PressureTier::Fast, PressureTier::Low, PressureTier::Min] {
                for requested in [0, 1, free / 3] {
                    if let Ok(r) = resolve(&snap, tier, requested, AllocMode::Atomic) {
                        assert!(r.op_count + r.free_floor <= free, "{tier} {free} {requested}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_resolve_is_pure() -> anyhow::Result<()> {
        let snap = zone(7777, 100, 150, 200, 9000);
        for tier in PressureTier::ALL {
            let a = resolve(&snap, tier, 0, AllocMode::Atomic)?;
            let b = resolve(&snap, tier, 0, AllocMode::Atomic)?;
            assert_eq!(a, b);
        }
        Ok(())
    }

    #[test]
    fn test_tier_names() {
        for tier in PressureTier::ALL {
            assert_eq!(PressureTier::from_name(tier.name()), Some(tier));
        }
        assert_eq!(PressureTier::from_name("high"), None);
    }
}
