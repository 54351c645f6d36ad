//! Completion signals
//!
//! A [`Signal`] tells a waiting thread that the ISR finished a transfer.
//! It holds one pending wakeup. Clear it before you submit the transfer
//! that will wake it; a wakeup that lands before the thread sleeps is not
//! lost.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::time::{Deadline, Timeout};

/// A single-slot wait / notify primitive.
///
/// ```
/// use imxrt_dcd::{Signal, Timeout};
///
/// static DONE: Signal = Signal::new();
///
/// DONE.clear();
/// DONE.wakeup();
/// assert!(DONE.sleep(Timeout::Forever));
/// ```
pub struct Signal {
    set: AtomicBool,
}

impl Signal {
    pub const fn new() -> Self {
        Signal {
            set: AtomicBool::new(false),
        }
    }

    /// Forget any pending wakeup.
    pub fn clear(&self) {
        self.set.store(false, Ordering::Release);
    }

    /// Wake the sleeper, or let the next sleep return immediately.
    ///
    /// Safe to call from an interrupt. Calling it more than once before the
    /// next `clear` has no additional effect.
    pub fn wakeup(&self) {
        self.set.store(true, Ordering::Release);
        #[cfg(target_arch = "arm")]
        cortex_m::asm::sev();
    }

    /// Returns `true` if there's a pending wakeup.
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Block until woken, or until the timeout expires.
    ///
    /// Returns `true` if woken. `sleep` doesn't consume the wakeup.
    pub fn sleep(&self, timeout: Timeout) -> bool {
        match timeout {
            Timeout::Forever => {
                while !self.is_set() {
                    wait_for_event();
                }
                true
            }
            Timeout::Micros(us) => {
                let mut deadline = Deadline::after_us(us);
                while !self.is_set() {
                    if deadline.expired() {
                        // A wakeup may have raced with the expiry.
                        return self.is_set();
                    }
                    core::hint::spin_loop();
                }
                true
            }
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

/// Idle until something happens.
pub(crate) fn wait_for_event() {
    #[cfg(target_arch = "arm")]
    cortex_m::asm::wfe();
    #[cfg(test)]
    std::thread::yield_now();
    #[cfg(not(any(target_arch = "arm", test)))]
    core::hint::spin_loop();
}
