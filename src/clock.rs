//! Monotonic time service.
//!
//! The context caches one reading per iteration; everything else in the
//! crate that needs "now" goes through [`monotonic_micros`] or the cached
//! value handed to it, never `Instant::now()` directly, so that a single
//! iteration sees a single stable timestamp (spec section 4.1).

use std::sync::OnceLock;
use std::time::Instant;

/// Microseconds since an arbitrary, process-local epoch. Guaranteed
/// non-decreasing for the lifetime of the process.
pub type Micros = i64;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Read the monotonic clock now, in microseconds since process start.
///
/// Panics if the OS monotonic clock appears to have gone backwards beyond
/// what can be explained by measurement noise; per spec section 7 a broken
/// monotonic clock is a fatal condition, not one this crate can mask.
pub fn monotonic_micros() -> Micros {
    let elapsed = Instant::now().saturating_duration_since(epoch());
    elapsed
        .as_micros()
        .try_into()
        .expect("monotonic clock overflowed i64 microseconds")
}

/// Round a microsecond timeout to the millisecond granularity the poll
/// primitive understands: `0` and `-1` pass through unchanged, any other
/// positive value rounds *up* so callers never busy-spin (spec section 9).
pub fn micros_to_poll_millis(micros: i64) -> i32 {
    match micros {
        -1 => -1,
        0 => 0,
        us if us > 0 => {
            let ms = (us + 999) / 1000;
            ms.min(i32::MAX as i64) as i32
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_non_decreasing() {
        let a = monotonic_micros();
        let b = monotonic_micros();
        assert!(b >= a);
    }

    #[test]
    fn rounding_preserves_sentinels() {
        assert_eq!(micros_to_poll_millis(-1), -1);
        assert_eq!(micros_to_poll_millis(0), 0);
    }

    #[test]
    fn rounding_rounds_up() {
        assert_eq!(micros_to_poll_millis(1), 1);
        assert_eq!(micros_to_poll_millis(1000), 1);
        assert_eq!(micros_to_poll_millis(1001), 2);
        assert_eq!(micros_to_poll_millis(1999), 2);
    }

    #[test]
    fn rounding_saturates() {
        assert_eq!(micros_to_poll_millis(i64::MAX), i32::MAX);
    }
}
