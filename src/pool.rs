//! Memory shared with the controller
//!
//! A [`DescriptorPool`] holds everything that a device needs, in one
//! static allocation: the queue head table, the software lists, control
//! transfer memory, and the device itself.

#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{device::Device, qh::Qh, queue::Queue, td::Dtd};

/// Number of logical endpoints that the driver supports.
pub const LE_COUNT: usize = 16;
/// Number of hardware endpoints (queue heads).
pub const QH_COUNT: usize = LE_COUNT * 2;
/// The largest data stage of a control transfer.
pub const CONTROL_BUFFER_SIZE: usize = 256;

/// A list of queue heads
///
/// One queue head per endpoint, per direction.
#[repr(align(4096))]
pub(crate) struct QhList(pub [Qh; QH_COUNT]);

impl QhList {
    const fn new() -> Self {
        const QH: Qh = Qh::new();
        Self([QH; QH_COUNT])
    }
}

#[repr(C, align(32))]
struct ControlBuffer(UnsafeCell<[u8; CONTROL_BUFFER_SIZE]>);

/// Descriptors and a data buffer for one control transfer at a time.
pub(crate) struct ControlMemory {
    /// Data stage.
    pub data: Dtd,
    /// Status stage.
    pub status: Dtd,
    buffer: ControlBuffer,
}

impl ControlMemory {
    const fn new() -> Self {
        ControlMemory {
            data: Dtd::new(),
            status: Dtd::new(),
            buffer: ControlBuffer(UnsafeCell::new([0; CONTROL_BUFFER_SIZE])),
        }
    }

    /// # Safety
    ///
    /// Caller must be the only user of this control memory. The ISR owns
    /// one, and the request dispatcher owns the other.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn buffer(&self) -> &mut [u8; CONTROL_BUFFER_SIZE] {
        &mut *self.buffer.0.get()
    }

    /// The buffer, for DMA.
    pub fn buffer_ptr(&self) -> *mut u8 {
        self.buffer.0.get().cast()
    }
}

/// Static memory for one USB device.
///
/// Allocate one `static` pool per controller, in memory that the USB DMA
/// engine can reach. Prefer non-cacheable memory (DTCM). Supply it to
/// [`Device::new`].
///
/// ```
/// use imxrt_dcd::DescriptorPool;
///
/// static POOL: DescriptorPool = DescriptorPool::new();
/// ```
pub struct DescriptorPool {
    qhs: QhList,
    queues: [Queue; QH_COUNT],
    isr: ControlMemory,
    thread: ControlMemory,
    device: UnsafeCell<MaybeUninit<Device>>,
    taken: AtomicBool,
}

// Safety: the device slot is written once, guarded by `taken`. The
// rest is atomics, or memory that's handed out with documented
// ownership.
unsafe impl Sync for DescriptorPool {}

impl DescriptorPool {
    pub const fn new() -> Self {
        const QUEUE: Queue = Queue::new();
        DescriptorPool {
            qhs: QhList::new(),
            queues: [QUEUE; QH_COUNT],
            isr: ControlMemory::new(),
            thread: ControlMemory::new(),
            device: UnsafeCell::new(MaybeUninit::uninit()),
            taken: AtomicBool::new(false),
        }
    }

    /// Returns `false` if the pool was already taken.
    pub(crate) fn take(&self) -> bool {
        !self.taken.swap(true, Ordering::SeqCst)
    }

    /// Move the device into the pool.
    ///
    /// # Safety
    ///
    /// Call once, after a successful [`take`](Self::take).
    pub(crate) unsafe fn install(&'static self, device: Device) -> &'static Device {
        let slot = &mut *self.device.get();
        slot.write(device)
    }

    /// The address of the queue head table. Controller requires 4KiB
    /// alignment.
    pub(crate) fn qh_list_addr(&self) -> u32 {
        self.qhs.0.as_ptr() as usize as u32
    }

    pub(crate) fn qh(&self, he: usize) -> &Qh {
        &self.qhs.0[he]
    }

    pub(crate) fn queue(&self, he: usize) -> &Queue {
        &self.queues[he]
    }

    /// Control memory used by the ISR.
    pub(crate) fn isr_control(&'static self) -> &'static ControlMemory {
        &self.isr
    }

    /// Control memory used by the request dispatcher.
    pub(crate) fn thread_control(&'static self) -> &'static ControlMemory {
        &self.thread
    }
}

impl Default for DescriptorPool {
    fn default() -> Self {
        Self::new()
    }
}
