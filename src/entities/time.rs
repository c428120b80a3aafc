//! Stream timestamps (seconds + nanoseconds).
//!
//! Message receive times and the player clock share this type so the order
//! tracker can compare them directly.

use serde::{Deserialize, Serialize};
use std::fmt;

const NSEC_PER_SEC: u32 = 1_000_000_000;

/// Point on the player's timeline.
///
/// Always normalized: `nsec < 1_000_000_000`. Ordering is lexicographic on
/// `(sec, nsec)`, which is chronological for normalized values.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Time {
    pub sec: u32,
    pub nsec: u32,
}

impl Time {
    pub const ZERO: Time = Time { sec: 0, nsec: 0 };

    /// Build a time, carrying excess nanoseconds into seconds.
    pub fn new(sec: u32, nsec: u32) -> Self {
        Self {
            sec: sec.saturating_add(nsec / NSEC_PER_SEC),
            nsec: nsec % NSEC_PER_SEC,
        }
    }

    /// Build from fractional seconds. Negative input clamps to zero.
    pub fn from_secs_f64(secs: f64) -> Self {
        if !secs.is_finite() || secs <= 0.0 {
            return Self::ZERO;
        }
        let sec = secs.trunc();
        let nsec = ((secs - sec) * NSEC_PER_SEC as f64).round() as u32;
        Self::new(sec.min(u32::MAX as f64) as u32, nsec)
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new((ms / 1000) as u32, ((ms % 1000) * 1_000_000) as u32)
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.nsec as f64 / NSEC_PER_SEC as f64
    }

    /// Signed difference `self - other` in seconds.
    pub fn secs_since(&self, other: Time) -> f64 {
        (self.sec as f64 - other.sec as f64) + (self.nsec as f64 - other.nsec as f64) / NSEC_PER_SEC as f64
    }

    /// Time shifted forward by `secs` (saturating at zero for negative shifts).
    pub fn add_secs(&self, secs: f64) -> Self {
        Self::from_secs_f64(self.as_secs_f64() + secs)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_normalizes() {
        let t = Time::new(1, 2_500_000_000);
        assert_eq!(t, Time { sec: 3, nsec: 500_000_000 });
    }

    #[test]
    fn test_ordering() {
        assert!(Time::new(1, 999_999_999) < Time::new(2, 0));
        assert!(Time::new(2, 1) > Time::new(2, 0));
    }

    #[test]
    fn test_secs_since_signed() {
        let a = Time::new(10, 500_000_000);
        let b = Time::new(12, 0);
        assert!((b.secs_since(a) - 1.5).abs() < 1e-9);
        assert!((a.secs_since(b) + 1.5).abs() < 1e-9);
    }

    #[test]
    fn test_display() {
        assert_eq!(Time::new(5, 42).to_string(), "5.000000042");
    }

    #[test]
    fn test_from_secs_f64_clamps() {
        assert_eq!(Time::from_secs_f64(-3.0), Time::ZERO);
        assert_eq!(Time::from_secs_f64(2.25), Time::new(2, 250_000_000));
    }
}
