//! A word of memory shared with the USB DMA engine
//!
//! Conforms to the RAL's register API, so that `read_reg!` and friends
//! work on the queue head and transfer descriptor layouts. It's backed by
//! an atomic, since the controller (and, in tests, the simulated
//! controller) writes these words while the CPU reads them.

use core::sync::atomic::{AtomicU32, Ordering};

#[repr(transparent)]
pub struct VCell(AtomicU32);

impl VCell {
    pub const fn new(val: u32) -> Self {
        VCell(AtomicU32::new(val))
    }
    #[inline(always)]
    pub fn read(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }
    #[inline(always)]
    pub fn write(&self, val: u32) {
        self.0.store(val, Ordering::Release)
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<VCell>() == 4) as usize];
