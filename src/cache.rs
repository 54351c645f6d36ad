//! Data cache maintenance for DMA buffers
//!
//! The USB DMA engine bypasses the Cortex-M7 data cache. Flush a buffer
//! before the controller reads it, and invalidate a buffer before the CPU
//! reads what the controller wrote.
//!
//! These routines are adapted from the cortex-m (0.7) crate, which only
//! offers them through an owned SCB. We neither want to steal the
//! peripheral(s), nor own them.
//!
//! Off target, these are no-ops.

/// Cache lines are fixed to 32 bytes on Cortex-M7.
pub const LINESIZE: usize = 32;

#[cfg(target_arch = "arm")]
#[derive(Clone, Copy)]
enum Op {
    Clean,
    Invalidate,
    CleanInvalidate,
}

#[cfg(target_arch = "arm")]
fn by_address(op: Op, addr: usize, size: usize) {
    // No-op zero sized operations
    if size == 0 {
        return;
    }

    // Safety: write-only registers, pointer to static memory
    let cbp = unsafe { &*cortex_m::peripheral::CBP::PTR };

    cortex_m::asm::dsb();

    let first = addr & !(LINESIZE - 1);
    let num_lines = (addr + size - first + LINESIZE - 1) / LINESIZE;
    let mut line = first;
    for _ in 0..num_lines {
        // Safety: write to Cortex-M write-only register
        unsafe {
            match op {
                Op::Clean => cbp.dccmvac.write(line as u32),
                Op::Invalidate => cbp.dcimvac.write(line as u32),
                Op::CleanInvalidate => cbp.dccimvac.write(line as u32),
            }
        }
        line += LINESIZE;
    }

    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

/// Write back every cache line that overlaps `[ptr, ptr + len)`.
///
/// Call before the controller reads the buffer.
pub fn flush(ptr: *const u8, len: usize) {
    #[cfg(target_arch = "arm")]
    by_address(Op::Clean, ptr as usize, len);
    #[cfg(not(target_arch = "arm"))]
    let _ = (ptr, len);
}

/// Discard every cache line that overlaps `[ptr, ptr + len)`.
///
/// Call before the CPU reads data that the controller wrote. Dirty data
/// in lines that only partially overlap the buffer is lost, so prefer
/// buffers that are aligned to, and a multiple of, [`LINESIZE`].
pub fn invalidate(ptr: *const u8, len: usize) {
    #[cfg(target_arch = "arm")]
    by_address(Op::Invalidate, ptr as usize, len);
    #[cfg(not(target_arch = "arm"))]
    let _ = (ptr, len);
}

/// Write back, then discard, every cache line that overlaps
/// `[ptr, ptr + len)`.
pub fn flush_invalidate(ptr: *const u8, len: usize) {
    #[cfg(target_arch = "arm")]
    by_address(Op::CleanInvalidate, ptr as usize, len);
    #[cfg(not(target_arch = "arm"))]
    let _ = (ptr, len);
}

/// `true` if `ptr` starts a cache line.
pub fn is_aligned(ptr: *const u8) -> bool {
    ptr as usize & (LINESIZE - 1) == 0
}

#[cfg(test)]
mod test {
    use super::is_aligned;

    #[test]
    fn alignment() {
        #[repr(align(32))]
        struct Line([u8; 64]);
        let line = Line([0; 64]);
        assert!(is_aligned(line.0.as_ptr()));
        assert!(!is_aligned(line.0[1..].as_ptr()));
        assert!(is_aligned(line.0[32..].as_ptr()));
    }
}
