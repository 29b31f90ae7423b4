//! Utility functions and types used throughout vmpress.
//!
//! This module provides:
//! - [`Size`] - Memory size representation, including page counts
//! - Constants for page and buddy arithmetic ([`PAGE_SIZE`], [`MAX_ORDER`], etc.)
//! - Time sources for tick and cycle measurements ([`Clock`])

mod clock;
mod constants;
mod size;

pub use self::clock::{Clock, SteppingClock, SystemClock};
pub use self::constants::*;
pub use self::size::Size;

use std::time::Duration;

/// Converts a tick count at `hz` ticks per second into a [`Duration`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use vmpress_core::util::ticks_to_duration;
///
/// assert_eq!(ticks_to_duration(250, 1000), Duration::from_millis(250));
/// assert_eq!(ticks_to_duration(3, 100), Duration::from_millis(30));
/// ```
pub fn ticks_to_duration(ticks: u64, hz: u64) -> Duration {
    if hz == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(ticks.saturating_mul(1_000_000_000) / hz)
}

/// Integer percentage of `part` in `whole`, or `None` when `whole` is zero.
pub fn percent(part: u64, whole: u64) -> Option<u64> {
    (whole > 0).then(|| part * 100 / whole)
}

#[cfg(test)]
mod tests {
    use super::percent;

    #[test]
    fn test_percent_truncates() {
        assert_eq!(percent(10, 50), Some(20));
        assert_eq!(percent(1, 3), Some(33));
        assert_eq!(percent(0, 7), Some(0));
    }

    #[test]
    fn test_percent_of_nothing() {
        assert_eq!(percent(0, 0), None);
    }
}
