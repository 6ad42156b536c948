//! Watchdog servicing.
//!
//! The main loop services the watchdog on every pass, and so does any loop
//! that waits on the flash.  The watchdog itself is a board peripheral, reached
//! through [`Watchdog`].

pub trait Watchdog {
    fn service(&mut self);
}

/// For hosts, and for boards that leave the watchdog off.
#[derive(Debug, Default, Copy, Clone)]
pub struct NoWatchdog;

impl Watchdog for NoWatchdog {
    fn service(&mut self) {}
}

impl<T: Watchdog + ?Sized> Watchdog for &mut T {
    fn service(&mut self) {
        (**self).service()
    }
}

/// Adapt a closure that kicks the board's watchdog.
pub struct WatchdogHook<F: FnMut()>(pub F);

impl<F: FnMut()> Watchdog for WatchdogHook<F> {
    fn service(&mut self) {
        (self.0)()
    }
}

/// Stop doing anything but keep the watchdog quiet, so the device does not
/// reset into the same failure.  Used when an internal check fails.
pub fn spin<W: Watchdog + ?Sized>(watchdog: &mut W) -> ! {
    loop {
        watchdog.service();
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hook_is_called() {
        let mut count = 0;
        {
            let mut hook = WatchdogHook(|| count += 1);
            let by_ref: &mut dyn Watchdog = &mut hook;
            by_ref.service();
            by_ref.service();
        }
        assert_eq!(count, 2);
    }
}
