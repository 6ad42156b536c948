//! Millisecond time.
//!
//! A board advances a [`TickCounter`] from its timer interrupt, and the rest
//! of the updater only ever reads it.  The count wraps after about 49 days;
//! all comparisons are done on differences, so the wrap is harmless.

use core::sync::atomic::{AtomicU32, Ordering};

pub trait Clock {
    fn now_ms(&self) -> u32;
}

pub struct TickCounter {
    ms: AtomicU32,
}

impl TickCounter {
    pub const fn new() -> TickCounter {
        TickCounter {
            ms: AtomicU32::new(0),
        }
    }

    /// Advance the count.  Called from the timer interrupt, which is the only
    /// writer, so a load and store is enough.
    pub fn tick(&self, ms: u32) {
        let now = self.ms.load(Ordering::Relaxed);
        self.ms.store(now.wrapping_add(ms), Ordering::Relaxed);
    }
}

impl Default for TickCounter {
    fn default() -> Self {
        TickCounter::new()
    }
}

impl Clock for TickCounter {
    fn now_ms(&self) -> u32 {
        self.ms.load(Ordering::Relaxed)
    }
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }
}

/// Milliseconds from `since` to `now`.
pub fn elapsed(now: u32, since: u32) -> u32 {
    now.wrapping_sub(since)
}

/// Has at least `duration` passed since `since`?
pub fn expired(now: u32, since: u32, duration: u32) -> bool {
    elapsed(now, since) >= duration
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_and_wraps() {
        static TICKS: TickCounter = TickCounter::new();
        TICKS.tick(0xffff_fff0);
        let start = TICKS.now_ms();
        assert!(!expired(TICKS.now_ms(), start, 0x20));
        TICKS.tick(0x20);
        assert_eq!(TICKS.now_ms(), 0x10);
        assert_eq!(elapsed(TICKS.now_ms(), start), 0x20);
        assert!(expired(TICKS.now_ms(), start, 0x20));
    }
}
