//! Time base for delays and timeouts
//!
//! On target, time is measured with the DWT cycle counter, which the
//! driver enables in `Device::init`. Call [`set_core_clock_hz`] if your
//! core doesn't run at 600MHz.

use core::sync::atomic::{AtomicU32, Ordering};

static CORE_CLOCK_HZ: AtomicU32 = AtomicU32::new(600_000_000);

/// Set the core clock frequency, used to convert cycles to time.
pub fn set_core_clock_hz(hz: u32) {
    CORE_CLOCK_HZ.store(hz.max(1_000_000), Ordering::Relaxed);
}

/// How long to wait for something to happen.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Timeout {
    /// Never give up.
    Forever,
    /// Give up after some microseconds.
    Micros(u32),
}

impl Timeout {
    /// A timeout of `ms` milliseconds.
    pub const fn millis(ms: u32) -> Self {
        Timeout::Micros(ms.saturating_mul(1000))
    }
}

#[cfg(all(target_arch = "arm", not(test)))]
mod source {
    use core::sync::atomic::Ordering;

    pub fn enable() {
        // Safety: we only touch the trace enable and cycle counter enable bits.
        let mut cp = unsafe { cortex_m::Peripherals::steal() };
        cp.DCB.enable_trace();
        cp.DWT.enable_cycle_counter();
    }
    pub fn ticks() -> u32 {
        cortex_m::peripheral::DWT::cycle_count()
    }
    pub fn ticks_per_us() -> u32 {
        super::CORE_CLOCK_HZ.load(Ordering::Relaxed) / 1_000_000
    }
}


// Off target, outside of tests, every poll counts as a microsecond.
#[cfg(not(any(target_arch = "arm", test)))]
mod source {
    use core::sync::atomic::{AtomicU32, Ordering};

    static POLLS: AtomicU32 = AtomicU32::new(0);

    pub fn enable() {}
    pub fn ticks() -> u32 {
        POLLS.fetch_add(1, Ordering::Relaxed)
    }
    pub fn ticks_per_us() -> u32 {
        1
    }
}

pub(crate) fn enable() {
    source::enable();
}

/// The end of a bounded wait.
///
/// The tick source is 32 bits wide and wraps every few seconds at full
/// core speed, so the deadline accumulates elapsed ticks on every poll.
pub(crate) struct Deadline {
    last: u32,
    elapsed: u64,
    limit: u64,
}

impl Deadline {
    pub fn after_us(us: u32) -> Self {
        Deadline {
            last: source::ticks(),
            elapsed: 0,
            limit: us as u64 * source::ticks_per_us() as u64,
        }
    }
    pub fn expired(&mut self) -> bool {
        let now = source::ticks();
        self.elapsed += now.wrapping_sub(self.last) as u64;
        self.last = now;
        // Ticks are truncated, so a full tick must pass beyond the limit.
        self.elapsed > self.limit
    }
    /// What's left, or `None` if the deadline passed.
    pub fn remaining(&mut self) -> Option<Timeout> {
        if self.expired() {
            return None;
        }
        let us = (self.limit + 1 - self.elapsed) / source::ticks_per_us().max(1) as u64;
        Some(Timeout::Micros(us.max(1) as u32))
    }
}

/// Busy-wait for at least `us` microseconds.
pub(crate) fn delay_us(us: u32) {
    let mut deadline = Deadline::after_us(us);
    while !deadline.expired() {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod test {
    use super::{delay_us, Deadline};
    use std::time::{Duration, Instant};

    #[test]
    fn deadline() {
        let mut deadline = Deadline::after_us(2_000);
        assert!(!deadline.expired());
        std::thread::sleep(Duration::from_millis(3));
        assert!(deadline.expired());
    }

    #[test]
    fn remaining() {
        let mut deadline = Deadline::after_us(50_000);
        match deadline.remaining() {
            Some(super::Timeout::Micros(us)) => assert!(us <= 50_000 && us > 0),
            other => panic!("{other:?}"),
        }
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(deadline.remaining(), None);
    }

    #[test]
    fn delay() {
        let start = Instant::now();
        delay_us(1_500);
        assert!(start.elapsed() >= Duration::from_micros(1_500));
    }

    #[test]
    fn short_delays_are_lower_bounds() {
        for us in [1, 2, 3, 7, 50] {
            for _ in 0..20 {
                let start = Instant::now();
                delay_us(us);
                assert!(start.elapsed() >= Duration::from_micros(us as u64));
            }
        }
    }

    #[test]
    fn zero_deadline_expires_after_a_tick() {
        let mut deadline = Deadline::after_us(0);
        std::thread::sleep(Duration::from_micros(10));
        assert!(deadline.expired());
    }
}
