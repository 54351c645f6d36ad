//! A USB device controller driver for i.MX RT processors
//!
//! `imxrt-dcd` drives the ChipIdea high-speed USB controller in device
//! mode. It manages the endpoint queue heads and transfer descriptors,
//! services the USB interrupt, answers the standard control requests, and
//! hands every other control request to your [`ControlHandler`]s. On top
//! of that, [`serial`] offers a CDC-ACM serial port.
//!
//! Transfers are submitted from threads with [`Device::prime`], and never
//! wait on a lock that the ISR holds. A thread sleeps on the [`Signal`]
//! of its last transfer descriptor until the ISR completes it.
//!
//! To interface the library, you must define a safe implementation of
//! [`Peripherals`]. See the peripherals documentation for more
//! information.
//!
//! # Example
//!
//! ```no_run
//! use imxrt_dcd::{Config, DescriptorPool, Device, Peripherals, Timeout};
//!
//! static POOL: DescriptorPool = DescriptorPool::new();
//!
//! # struct Usb1; unsafe impl Peripherals for Usb1 {
//! #   fn core(&self) -> *const () { 0x402e_0200 as _ }
//! #   fn phy(&self) -> *const () { 0x400d_9000 as _ }
//! # }
//! # static DESCRIPTORS: [imxrt_dcd::descriptor::Descriptor; 0] = [];
//! let device = Device::new(1, Usb1, &POOL).unwrap();
//! device.init(Config::new(&DESCRIPTORS));
//! device.enable();
//!
//! // In the USB_OTG1 interrupt handler:
//! imxrt_dcd::on_interrupt(1);
//!
//! // In a thread of its own:
//! loop {
//!     device.process_control_requests(Timeout::Forever);
//! }
//! ```
//!
//! # Memory
//!
//! The controller reads and writes queue heads, transfer descriptors, and
//! data buffers behind the CPU's back. Place the [`DescriptorPool`], every
//! [`DtdPool`], and your data buffers in memory that the USB DMA engine
//! can reach. Non-cacheable memory (DTCM) is simplest. Cacheable buffers
//! must be aligned to [`cache::LINESIZE`]; the driver cleans and
//! invalidates them around transfers.

#![cfg_attr(not(test), no_std)]

#[cfg(feature = "defmt-03")]
extern crate defmt_03 as defmt;

#[macro_use]
mod log;

pub mod cache;
pub mod control;
pub mod descriptor;
mod device;
#[cfg(test)]
mod emulator;
mod error;
mod isr;
mod pool;
mod qh;
mod queue;
mod ral;
pub mod serial;
mod signal;
mod td;
mod time;
mod vcell;

pub use control::{ControlHandler, ControlRequest, RequestKey};
pub use device::{he, le, on_interrupt, Config, Device, Speed};
pub use error::{Error, Result, TransferError};
pub use pool::{DescriptorPool, CONTROL_BUFFER_SIZE, LE_COUNT};
pub use signal::Signal;
pub use td::{Dtd, DtdPool, Ownership, Status};
pub use time::{set_core_clock_hz, Timeout};

/// A type that owns USB register blocks
///
/// An implementation of `Peripherals` is expected to own
///
/// - USB core registers
/// - USB PHY registers
///
/// For a USB1 or USB2 peripheral.
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that
/// owns the various register blocks required for all USB
/// operation. The pointer returned by the methods are
/// assumed to be valid, and will be cast to a register
/// definition.
///
/// # Example
///
/// A safe implementation of `Peripherals` that works with the
/// `imxrt-ral` register access layer. Assume that `ral` is
/// shorthand for `imxrt_ral`, like
///
/// ```ignore
/// use imxrt_ral as ral;
/// ```
///
/// ```
/// # mod ral {
/// #   use core::ops::Deref; pub struct Instance; impl Deref for Instance { type Target = u32; fn deref(&self) -> &u32 { unsafe { &*(0x402e0200 as *const u32)} } }
/// #   pub fn take() -> Result<Instance, ()> { Ok(Instance) }
/// #   pub mod usb { pub use super::Instance; pub mod USB1 { pub use super::super::take; } }
/// #   pub mod usbphy { pub use super::Instance; pub mod USBPHY1 { pub use super::super::take; } }
/// # }
/// use ral::{usb, usbphy};
/// use imxrt_dcd::Peripherals;
///
/// struct Instances {
///     usb: usb::Instance,
///     usbphy: usbphy::Instance,
/// }
///
/// impl Instances {
///     /// Panics if the instances are already taken
///     pub fn usb1() -> Instances {
///         Self {
///             usb: usb::USB1::take().unwrap(),
///             usbphy: usbphy::USBPHY1::take().unwrap(),
///         }
///     }
/// }
///
/// unsafe impl Peripherals for Instances {
///     fn core(&self) -> *const () {
///         &*self.usb as *const _ as _
///     }
///     fn phy(&self) -> *const () {
///         &*self.usbphy as *const _ as _
///     }
/// }
///
/// let instances = Instances::usb1();
/// assert_eq!(instances.core(), 0x402e0200 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the USB core registers
    /// for this peripheral instance
    fn core(&self) -> *const ();
    /// Returns the address of the USB PHY registers
    /// for this peripheral instance
    fn phy(&self) -> *const ();
}
