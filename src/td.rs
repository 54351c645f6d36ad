//! Endpoint transfer descriptors
//!
//! [`Td`] is the controller's 32 byte view of a transfer descriptor, with
//! a RAL-compatible interface. [`Dtd`] wraps a `Td` with the software
//! state the driver needs to queue, reap, and signal transfers.

#![allow(non_snake_case, non_upper_case_globals)]
#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};

use crate::{ral, signal::Signal, vcell::VCell};

#[repr(C)]
pub struct Td {
    pub NEXT: VCell,
    pub TOKEN: VCell,
    pub BUFFERS: [VCell; 5],
    _reserved: VCell,
}

impl Td {
    pub const fn new() -> Self {
        Td {
            NEXT: VCell::new(NEXT::TERMINATE::mask),
            TOKEN: VCell::new(0),
            BUFFERS: [
                VCell::new(0),
                VCell::new(0),
                VCell::new(0),
                VCell::new(0),
                VCell::new(0),
            ],
            _reserved: VCell::new(0),
        }
    }

    /// The address that the controller sees.
    pub fn addr(&self) -> u32 {
        self as *const Td as usize as u32
    }
}

/// Encode a hardware link.
///
/// This is the only place that knows the controller's "no link" pattern.
pub fn hw_link(next: Option<&Td>) -> u32 {
    match next {
        Some(td) => td.addr() & NEXT::NEXT_LINK_POINTER::mask,
        None => NEXT::TERMINATE::mask,
    }
}

/// Decode a hardware link into an address, or `None` if it terminates.
pub fn hw_link_addr(raw: u32) -> Option<u32> {
    (raw & NEXT::TERMINATE::mask == 0).then_some(raw & NEXT::NEXT_LINK_POINTER::mask)
}

pub mod NEXT {
    pub mod TERMINATE {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod NEXT_LINK_POINTER {
        pub const offset: u32 = 5;
        pub const mask: u32 = 0x7ffffff << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod TOKEN {
    pub mod STATUS {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod MULTO {
        pub const offset: u32 = 10;
        pub const mask: u32 = 0b11 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod IOC {
        pub const offset: u32 = 15;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod TOTAL_BYTES {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0x7FFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Td>() == 32) as usize];

bitflags::bitflags! {
    /// Status of a transfer descriptor.
    ///
    /// A successful transfer has no bits set. `ACTIVE` after completion
    /// means a bus reset cut the transfer short.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Status : u32 {
        const ACTIVE = 1 << 7;
        const HALTED = 1 << 6;
        const DATA_BUFFER_ERROR = 1 << 5;
        const TRANSACTION_ERROR = 1 << 3;
    }
}

/// Who owns a [`Dtd`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Ownership {
    /// Never used.
    Free,
    /// Described a buffer; waiting to be primed.
    Queued,
    /// Linked into an endpoint list. Software must not touch it.
    ActiveHardware,
    /// Detached from its endpoint list. The status is final.
    Completed,
}

impl Ownership {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Ownership::Free,
            1 => Ownership::Queued,
            2 => Ownership::ActiveHardware,
            _ => Ownership::Completed,
        }
    }
}

/// Software link to the next descriptor of an endpoint list.
#[derive(Clone, Copy)]
pub(crate) enum Link {
    /// Last descriptor of the list.
    End,
    /// Last descriptor, and the ISR is detaching it.
    Removed,
    Next(&'static Dtd),
}

impl Link {
    fn encode(self) -> usize {
        match self {
            Link::End => 0,
            Link::Removed => 1,
            Link::Next(dtd) => dtd as *const Dtd as usize,
        }
    }
    fn decode(raw: usize) -> Self {
        match raw {
            0 => Link::End,
            1 => Link::Removed,
            // Safety: only encode() produces raw links, and descriptors
            // are static.
            ptr => Link::Next(unsafe { &*(ptr as *const Dtd) }),
        }
    }
}

/// A device transfer descriptor.
///
/// A `Dtd` describes one buffer segment of a transfer. Descriptors are
/// allocated once, in non-cacheable memory, and reused for every transfer.
/// See [`DtdPool`].
///
/// The controller only sees the first 32 bytes. The rest is driver state.
#[repr(C, align(32))]
pub struct Dtd {
    td: Td,
    link: AtomicUsize,
    ownership: AtomicU8,
    signal: AtomicPtr<Signal>,
}

impl Dtd {
    pub const fn new() -> Self {
        Dtd {
            td: Td::new(),
            link: AtomicUsize::new(0),
            ownership: AtomicU8::new(Ownership::Free as u8),
            signal: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Describe a buffer for the next transfer.
    ///
    /// One descriptor covers at most five 4KiB pages, so it can't always
    /// hold the whole buffer. Returns the number of bytes that it covers,
    /// which is somewhere between 16KiB and 20KiB for large buffers. Use
    /// another descriptor, or another transfer, for the rest.
    ///
    /// A zero `size` describes a zero-length packet.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `size` bytes until the transfer completes.
    /// The controller reads or writes that memory behind the cache; perform
    /// cache maintenance before priming.
    ///
    /// # Panics
    ///
    /// Panics if the controller still owns this descriptor.
    pub unsafe fn setup_transfer(&self, ptr: *const u8, size: usize) -> usize {
        self.claim();
        let mut n = 0;
        if size > 0 {
            let addr = ptr as usize;
            self.td.BUFFERS[0].write(addr as u32);
            let mut page = addr & !0xFFF;
            for buffer in &self.td.BUFFERS[1..] {
                page += 0x1000;
                buffer.write(page as u32);
            }
            n = (page + 0x1000 - addr).min(size);
        }
        ral::modify_reg!(crate::td, &self.td, TOKEN, |token: u32| {
            (token & (TOKEN::IOC::mask | TOKEN::MULTO::mask))
                | ((n as u32) << TOKEN::TOTAL_BYTES::offset)
                | Status::ACTIVE.bits()
        });
        n
    }

    /// Returns the number of bytes that were *not* transferred, and the
    /// transfer status.
    ///
    /// Only meaningful after the completion signal fired.
    pub fn status(&self) -> (usize, Status) {
        let remaining = ral::read_reg!(crate::td, &self.td, TOKEN, TOTAL_BYTES);
        let status = ral::read_reg!(crate::td, &self.td, TOKEN, STATUS);
        (remaining as usize, Status::from_bits_truncate(status))
    }

    /// Set the signal that the ISR wakes when this descriptor completes.
    ///
    /// `None` disables the completion interrupt for this descriptor.
    pub fn set_signal(&self, signal: Option<&'static Signal>) {
        let ptr = signal.map_or(core::ptr::null_mut(), |s| s as *const Signal as *mut Signal);
        self.signal.store(ptr, Ordering::Release);
        ral::modify_reg!(crate::td, &self.td, TOKEN, IOC: signal.is_some() as u32);
    }

    /// Chain `next` behind this descriptor.
    ///
    /// Use this to submit multi-descriptor transfers. The last descriptor
    /// of a chain is terminated when it's primed.
    ///
    /// # Panics
    ///
    /// Panics if the controller still owns this descriptor.
    pub fn set_next(&self, next: Option<&'static Dtd>) {
        assert!(
            self.ownership() != Ownership::ActiveHardware,
            "DTD still owned by the controller"
        );
        self.set_link(next.map_or(Link::End, Link::Next));
        self.set_hw_next(next);
    }

    /// Who owns this descriptor right now.
    pub fn ownership(&self) -> Ownership {
        Ownership::from_u8(self.ownership.load(Ordering::Acquire))
    }

    fn claim(&self) {
        let mut current = self.ownership.load(Ordering::Acquire);
        loop {
            assert!(
                current != Ownership::ActiveHardware as u8,
                "DTD still owned by the controller"
            );
            match self.ownership.compare_exchange_weak(
                current,
                Ownership::Queued as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Move from `from` to `to`. Returns `false` if the descriptor wasn't
    /// in `from`.
    pub(crate) fn transition(&self, from: Ownership, to: Ownership) -> bool {
        self.ownership
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn hw(&self) -> &Td {
        &self.td
    }

    pub(crate) fn link(&self) -> Link {
        Link::decode(self.link.load(Ordering::Acquire))
    }

    pub(crate) fn set_link(&self, link: Link) {
        self.link.store(link.encode(), Ordering::Release);
    }

    /// Swap the link if it's still `current`. Returns the link that was
    /// observed on failure.
    pub(crate) fn compare_link(&self, current: Link, new: Link) -> Result<(), Link> {
        self.link
            .compare_exchange(
                current.encode(),
                new.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(Link::decode)
    }

    pub(crate) fn set_hw_next(&self, next: Option<&Dtd>) {
        self.td.NEXT.write(hw_link(next.map(Dtd::hw)));
    }

    /// The controller clears the active bit when it's done.
    pub(crate) fn is_active(&self) -> bool {
        let status = ral::read_reg!(crate::td, &self.td, TOKEN, STATUS);
        status & Status::ACTIVE.bits() != 0
    }

    pub(crate) fn wakeup(&self) {
        let signal = self.signal.load(Ordering::Acquire);
        // Safety: set_signal only stores static signals.
        if let Some(signal) = unsafe { signal.as_ref() } {
            signal.wakeup();
        }
    }
}

impl Default for Dtd {
    fn default() -> Self {
        Self::new()
    }
}

const _: [(); 1] = [(); (core::mem::align_of::<Dtd>() == 32) as usize];

/// A fixed set of transfer descriptors.
///
/// Allocate a `static` pool in non-cacheable memory (DTCM), then
/// [`take`](DtdPool::take) its descriptors once.
///
/// ```
/// use imxrt_dcd::DtdPool;
///
/// static DTDS: DtdPool<3> = DtdPool::new();
///
/// let dtds = DTDS.take().unwrap();
/// assert_eq!(dtds.len(), 3);
/// assert!(DTDS.take().is_none());
/// ```
pub struct DtdPool<const N: usize> {
    dtds: [Dtd; N],
    taken: AtomicBool,
}

impl<const N: usize> DtdPool<N> {
    pub const fn new() -> Self {
        const DTD: Dtd = Dtd::new();
        DtdPool {
            dtds: [DTD; N],
            taken: AtomicBool::new(false),
        }
    }

    /// Acquire the descriptors.
    ///
    /// Returns `None` if they were already taken.
    pub fn take(&'static self) -> Option<&'static [Dtd]> {
        (!self.taken.swap(true, Ordering::SeqCst)).then_some(&self.dtds[..])
    }
}

impl<const N: usize> Default for DtdPool<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::{hw_link, hw_link_addr, Dtd, Link, Ownership, Status, Td};
    use crate::{ral, signal::Signal};

    #[test]
    fn next() {
        let td = Td::new();
        ral::write_reg!(super, &td, NEXT, NEXT_LINK_POINTER: u32::MAX);
        assert_eq!(td.NEXT.read(), u32::MAX & !0b11111);
    }

    #[test]
    fn terminate() {
        let td = Td::new();
        ral::write_reg!(super, &td, NEXT, TERMINATE: u32::MAX);
        assert_eq!(td.NEXT.read(), 1);
    }

    #[test]
    fn status() {
        let td = Td::new();
        ral::write_reg!(super, &td, TOKEN, STATUS: u32::MAX);
        assert_eq!(td.TOKEN.read(), 0b11111111);
    }

    #[test]
    fn ioc() {
        let td = Td::new();
        ral::write_reg!(super, &td, TOKEN, IOC: u32::MAX);
        assert_eq!(td.TOKEN.read(), 1 << 15);
    }

    #[test]
    fn total_bytes() {
        let td = Td::new();
        ral::write_reg!(super, &td, TOKEN, TOTAL_BYTES: u32::MAX);
        assert_eq!(td.TOKEN.read(), 0x7FFF << 16);
    }

    #[test]
    fn hardware_links() {
        let td = Dtd::new();
        assert_eq!(hw_link(None), 1);
        assert_eq!(hw_link_addr(hw_link(None)), None);
        let raw = hw_link(Some(td.hw()));
        assert_eq!(raw & 0x1F, 0);
        assert_eq!(hw_link_addr(raw), Some(td.hw().addr()));
    }

    #[test]
    fn software_links() {
        static DTD: Dtd = Dtd::new();
        let head = Dtd::new();
        assert!(matches!(head.link(), Link::End));
        head.set_link(Link::Next(&DTD));
        assert!(matches!(head.link(), Link::Next(dtd) if core::ptr::eq(dtd, &DTD)));
        assert!(head.compare_link(Link::End, Link::Removed).is_err());
        head.set_link(Link::End);
        assert!(head.compare_link(Link::End, Link::Removed).is_ok());
        assert!(matches!(head.link(), Link::Removed));
    }

    #[test]
    fn setup_transfer_bounds() {
        let buffer = vec![0u8; 0x10000];
        let dtd = Dtd::new();
        for offset in [0usize, 1, 31, 32, 0x7FF, 0xFFF] {
            for size in [0usize, 1, 64, 0x3FFF, 0x4000, 0x4FFF, 0x5000, 0x8000] {
                let ptr = unsafe { buffer.as_ptr().add(offset) };
                let n = unsafe { dtd.setup_transfer(ptr, size) };
                let addr = ptr as usize;
                let boundary = (addr & !0xFFF) + 0x5000;
                assert!(n <= size);
                assert_eq!(n, size.min(boundary - addr));
                let (remaining, status) = dtd.status();
                assert_eq!(remaining, n);
                assert_eq!(status, Status::ACTIVE);
                if size == 0 {
                    continue;
                }
                assert_eq!(dtd.hw().BUFFERS[0].read(), addr as u32);
                for page in 1..5 {
                    assert_eq!(
                        dtd.hw().BUFFERS[page].read(),
                        ((addr & !0xFFF) + page * 0x1000) as u32
                    );
                }
            }
        }
    }

    #[test]
    fn zero_length_keeps_pages() {
        let buffer = [0u8; 64];
        let dtd = Dtd::new();
        unsafe { dtd.setup_transfer(buffer.as_ptr(), buffer.len()) };
        let pages: Vec<u32> = dtd.hw().BUFFERS.iter().map(|b| b.read()).collect();
        let n = unsafe { dtd.setup_transfer(core::ptr::null(), 0) };
        assert_eq!(n, 0);
        assert_eq!(dtd.status(), (0, Status::ACTIVE));
        let after: Vec<u32> = dtd.hw().BUFFERS.iter().map(|b| b.read()).collect();
        assert_eq!(pages, after);
    }

    #[test]
    fn setup_transfer_spans_reconstruct_buffer() {
        let buffer: Vec<u8> = (0..100_000u32).map(|x| (x * 7 + x / 251) as u8).collect();
        let dtd = Dtd::new();
        for start in [0usize, 3, 100, 4095] {
            let mut rebuilt = Vec::new();
            let mut pos = start;
            while pos < buffer.len() {
                let n = unsafe { dtd.setup_transfer(buffer.as_ptr().add(pos), buffer.len() - pos) };
                assert!(n > 0);
                rebuilt.extend_from_slice(&buffer[pos..pos + n]);
                pos += n;
            }
            assert_eq!(&rebuilt[..], &buffer[start..]);
        }
    }

    #[test]
    fn setup_keeps_ioc() {
        static SIGNAL: Signal = Signal::new();
        let dtd = Dtd::new();
        dtd.set_signal(Some(&SIGNAL));
        let buffer = [0u8; 8];
        unsafe { dtd.setup_transfer(buffer.as_ptr(), buffer.len()) };
        assert_eq!(dtd.hw().TOKEN.read(), (1 << 15) | (8 << 16) | (1 << 7));
        dtd.set_signal(None);
        assert_eq!(dtd.hw().TOKEN.read() & (1 << 15), 0);
    }

    #[test]
    fn ownership() {
        let dtd = Dtd::new();
        assert_eq!(dtd.ownership(), Ownership::Free);
        unsafe { dtd.setup_transfer(core::ptr::null(), 0) };
        assert_eq!(dtd.ownership(), Ownership::Queued);
        assert!(dtd.transition(Ownership::Queued, Ownership::ActiveHardware));
        assert!(!dtd.transition(Ownership::Queued, Ownership::ActiveHardware));
        assert!(dtd.transition(Ownership::ActiveHardware, Ownership::Completed));
        unsafe { dtd.setup_transfer(core::ptr::null(), 0) };
        assert_eq!(dtd.ownership(), Ownership::Queued);
    }

    #[test]
    #[should_panic]
    fn resubmit_while_active() {
        let dtd = Dtd::new();
        unsafe { dtd.setup_transfer(core::ptr::null(), 0) };
        dtd.transition(Ownership::Queued, Ownership::ActiveHardware);
        unsafe { dtd.setup_transfer(core::ptr::null(), 0) };
    }
}
