//! Single-slot debounce cell, drained from the host loop.
//!
//! Panels mount and unmount in bursts, each changing their subscriptions.
//! Instead of pushing every intermediate set to the player:
//! 1. Every change calls `schedule()`, replacing the pending slot
//! 2. The host loop calls `tick()`; once the delay has elapsed the slot
//!    fires exactly once
//!
//! The pending marker carries no data; whoever fires it reads the latest
//! registry state, so the pushed value is never a stale snapshot.

use std::time::{Duration, Instant};

/// Debounce cell holding at most one pending trigger.
///
/// # Usage
/// ```ignore
/// // On subscription change:
/// debouncer.schedule();
///
/// // In host loop:
/// if debouncer.tick() {
///     push_merged_subscriptions();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Debouncer {
    /// Quiet period after the last `schedule()`
    delay: Duration,
    /// Instant the pending trigger becomes due
    pending: Option<Instant>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            pending: None,
        }
    }
}

impl Debouncer {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            pending: None,
        }
    }

    pub fn set_delay(&mut self, delay_ms: u64) {
        self.delay = Duration::from_millis(delay_ms);
    }

    pub fn delay_ms(&self) -> u64 {
        self.delay.as_millis() as u64
    }

    /// Arm (or re-arm) the trigger. Re-arming restarts the quiet period.
    pub fn schedule(&mut self) {
        self.schedule_at(Instant::now());
    }

    pub fn schedule_at(&mut self, now: Instant) {
        self.pending = Some(now + self.delay);
        log::trace!("Debouncer: scheduled in {}ms", self.delay.as_millis());
    }

    /// Drop the pending trigger without firing.
    pub fn cancel(&mut self) {
        if self.pending.take().is_some() {
            log::trace!("Debouncer: cancelled pending trigger");
        }
    }

    /// Returns true (once) when the pending trigger is due.
    pub fn tick(&mut self) -> bool {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> bool {
        match self.pending {
            Some(due) if now >= due => {
                self.pending = None;
                log::trace!("Debouncer: firing");
                true
            }
            _ => false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_pending_by_default() {
        let mut debouncer = Debouncer::new(10);
        assert!(!debouncer.is_pending());
        assert!(!debouncer.tick());
    }

    #[test]
    fn test_zero_delay_fires_on_next_tick() {
        let mut debouncer = Debouncer::default();
        debouncer.schedule();
        assert!(debouncer.tick());
        // Fires once only
        assert!(!debouncer.tick());
    }

    #[test]
    fn test_burst_collapses_to_one_fire() {
        let mut debouncer = Debouncer::new(50);
        let t0 = Instant::now();
        debouncer.schedule_at(t0);
        debouncer.schedule_at(t0 + Duration::from_millis(30));
        // Re-arm reset the timer
        assert!(!debouncer.tick_at(t0 + Duration::from_millis(60)));
        assert!(debouncer.tick_at(t0 + Duration::from_millis(80)));
        assert!(!debouncer.tick_at(t0 + Duration::from_millis(200)));
    }

    #[test]
    fn test_cancel() {
        let mut debouncer = Debouncer::default();
        debouncer.schedule();
        debouncer.cancel();
        assert!(!debouncer.is_pending());
        assert!(!debouncer.tick());
    }
}
