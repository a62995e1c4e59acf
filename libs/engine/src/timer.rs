//! Millisecond timing service shared between the tick interrupt and the
//! foreground loop.
//!
//! The tick interrupt owns the increment/decrement; the foreground side
//! arms and polls. Every cross-boundary access goes through a short
//! critical section, which is what makes the plain `Cell`s safe.

use core::cell::Cell;

use critical_section::Mutex;

use crate::hal::Watchdog;

pub struct TickTimer {
    millis: Mutex<Cell<u32>>,
    countdown: Mutex<Cell<u32>>,
}

impl TickTimer {
    pub const fn new() -> Self {
        Self {
            millis: Mutex::new(Cell::new(0)),
            countdown: Mutex::new(Cell::new(0)),
        }
    }

    /// Called once per millisecond from the timer interrupt.
    pub fn tick(&self) {
        critical_section::with(|cs| {
            let millis = self.millis.borrow(cs);
            millis.set(millis.get().wrapping_add(1));
            let countdown = self.countdown.borrow(cs);
            let left = countdown.get();
            if left > 0 {
                countdown.set(left - 1);
            }
        });
    }

    /// Wrapping milliseconds since boot.
    pub fn now_ms(&self) -> u32 {
        critical_section::with(|cs| self.millis.borrow(cs).get())
    }

    /// Arm the shared countdown.
    pub fn set_timeout(&self, ms: u32) {
        critical_section::with(|cs| self.countdown.borrow(cs).set(ms));
    }

    /// True once the armed countdown has reached zero.
    pub fn is_expired(&self) -> bool {
        critical_section::with(|cs| self.countdown.borrow(cs).get() == 0)
    }

    /// Arm the countdown and busy-poll it to zero, petting the watchdog on
    /// every iteration. Cannot fail, only terminate.
    pub fn wait<W: Watchdog>(&self, ms: u32, watchdog: &mut W) {
        self.set_timeout(ms);
        while !self.is_expired() {
            watchdog.pet();
        }
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}
