//! The USB device
//!
//! A [`Device`] owns one USB controller. Create it with [`Device::new`],
//! call [`init`](Device::init) once, then [`enable`](Device::enable) it.
//! Call [`on_interrupt`] (or [`Device::isr`]) from the USB interrupt
//! handler.

#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::{
    cell::UnsafeCell,
    ptr,
    sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU8, AtomicUsize, Ordering},
};

use usb_device::UsbDirection;

use crate::{
    control::Handlers,
    descriptor::{Descriptor, CONTROL_MAX_PACKET},
    error::{Error, Result, TransferError},
    pool::{DescriptorPool, LE_COUNT, QH_COUNT},
    qh::{self, Qh},
    queue::{self, Tripwire},
    ral,
    signal::Signal,
    td::Dtd,
    time::{self, Deadline, Timeout},
};

/// The hardware endpoint of a logical endpoint and direction.
pub const fn he(le: usize, direction: UsbDirection) -> usize {
    le * 2 + matches!(direction, UsbDirection::In) as usize
}

/// The logical endpoint of a hardware endpoint.
pub const fn le(he: usize) -> usize {
    he / 2
}

/// How long we wait for the controller to finish a reset, prime, or
/// flush command.
pub(crate) const COMMAND_TIMEOUT_US: u32 = 10_000;

/// Most threads that can wait for a configuration at once. Extra
/// waiters poll.
const MAX_WAITERS: usize = 8;

/// Negotiated bus speed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Speed {
    Full,
    High,
}

impl Speed {
    fn from_u8(raw: u8) -> Self {
        if raw == Speed::High as u8 {
            Speed::High
        } else {
            Speed::Full
        }
    }
}

/// Run-time configuration for [`Device::init`].
#[derive(Clone, Copy)]
pub struct Config {
    /// NVIC priority of the USB interrupt.
    pub interrupt_priority: u8,
    /// Everything the host can ask for with GET_DESCRIPTOR.
    pub descriptors: &'static [Descriptor],
    /// Don't negotiate high speed.
    pub force_full_speed: bool,
}

impl Config {
    pub const fn new(descriptors: &'static [Descriptor]) -> Self {
        Config {
            interrupt_priority: 0x80,
            descriptors,
            force_full_speed: false,
        }
    }
}

/// A USB device.
pub struct Device {
    controller: u8,
    pub(crate) usb: ral::Instance<ral::usb::RegisterBlock>,
    phy: ral::Instance<ral::usbphy::RegisterBlock>,
    pub(crate) pool: &'static DescriptorPool,
    descriptors: UnsafeCell<&'static [Descriptor]>,
    initialized: AtomicBool,
    /// Number of logical endpoints that the controller implements.
    endpoints: AtomicUsize,
    config: AtomicU8,
    /// Changes whenever the configuration changes, including resets.
    epoch: AtomicU32,
    speed: AtomicU8,
    tripwire: Tripwire,
    /// Logical endpoints with a SETUP for the dispatcher.
    pub(crate) pending: AtomicU32,
    pub(crate) setups: [[AtomicU32; 2]; LE_COUNT],
    pub(crate) dispatching: AtomicBool,
    pub(crate) dispatch: Signal,
    waiters: [AtomicPtr<Signal>; MAX_WAITERS],
    pub(crate) handlers: Handlers,
}

// Safety: the descriptor table is written once, in init, before the
// interrupt is enabled. Everything else is atomic, or register access.
unsafe impl Sync for Device {}

/// Devices, indexed by controller.
static DEVICES: [AtomicPtr<Device>; 2] = [
    AtomicPtr::new(ptr::null_mut()),
    AtomicPtr::new(ptr::null_mut()),
];

/// Service the USB interrupt of `controller`, 1 or 2.
///
/// Call this from your USB_OTG1 or USB_OTG2 interrupt handler. Does
/// nothing if there's no device for the controller.
pub fn on_interrupt(controller: u8) {
    let device = (controller as usize)
        .checked_sub(1)
        .and_then(|idx| DEVICES.get(idx))
        .map(|device| device.load(Ordering::Acquire));
    // Safety: we only store pointers to devices that live in a static pool.
    if let Some(device) = device.and_then(|device| unsafe { device.as_ref() }) {
        device.isr();
    }
}

#[cfg(target_arch = "arm")]
#[derive(Clone, Copy)]
struct Irq(u16);

// Safety: the number is a valid i.MX RT interrupt.
#[cfg(target_arch = "arm")]
unsafe impl cortex_m::interrupt::InterruptNumber for Irq {
    fn number(self) -> u16 {
        self.0
    }
}

impl Device {
    /// Create the device for USB `controller`, 1 or 2.
    ///
    /// The device lives in `pool`. A pool backs exactly one device.
    pub fn new<P: crate::Peripherals>(
        controller: u8,
        peripherals: P,
        pool: &'static DescriptorPool,
    ) -> Result<&'static Device> {
        if !(1..=2).contains(&controller) {
            return Err(Error::InvalidController(controller));
        }
        if !pool.take() {
            return Err(Error::PoolTaken);
        }

        const SETUP: [AtomicU32; 2] = [AtomicU32::new(0), AtomicU32::new(0)];
        const WAITER: AtomicPtr<Signal> = AtomicPtr::new(ptr::null_mut());
        // Safety: Peripherals implementations guarantee ownership of the
        // register blocks.
        let (usb, phy) = unsafe {
            (
                ral::Instance::new(peripherals.core()),
                ral::Instance::new(peripherals.phy()),
            )
        };
        let device = Device {
            controller,
            usb,
            phy,
            pool,
            descriptors: UnsafeCell::new(&[]),
            initialized: AtomicBool::new(false),
            endpoints: AtomicUsize::new(1),
            config: AtomicU8::new(0),
            epoch: AtomicU32::new(0),
            speed: AtomicU8::new(Speed::Full as u8),
            tripwire: Tripwire::new(),
            pending: AtomicU32::new(0),
            setups: [SETUP; LE_COUNT],
            dispatching: AtomicBool::new(false),
            dispatch: Signal::new(),
            waiters: [WAITER; MAX_WAITERS],
            handlers: Handlers::new(),
        };
        // Safety: we took the pool above.
        let device = unsafe { pool.install(device) };
        DEVICES[controller as usize - 1].store(device as *const Device as *mut Device, Ordering::Release);
        Ok(device)
    }

    /// Initialize the USB PHY and controller, and enable the USB
    /// interrupt.
    ///
    /// Assumes that the CCM clock gates are enabled, and the PLL is on.
    /// The ISR may run as soon as this returns.
    ///
    /// # Panics
    ///
    /// Panics if called more than once.
    pub fn init(&self, config: Config) {
        assert!(
            !self.initialized.swap(true, Ordering::AcqRel),
            "USB device already initialized"
        );
        time::enable();
        // Safety: the ISR doesn't look at descriptors until we enable
        // interrupts, below.
        unsafe { *self.descriptors.get() = config.descriptors };

        ral::write_reg!(ral::usbphy, self.phy, CTRL_SET, SFTRST: 1);
        ral::write_reg!(ral::usbphy, self.phy, CTRL_CLR, SFTRST: 1);
        ral::write_reg!(ral::usbphy, self.phy, CTRL_CLR, CLKGATE: 1);
        ral::write_reg!(ral::usbphy, self.phy, PWD, 0);

        ral::write_reg!(ral::usb, self.usb, USBCMD, RST: 1);
        let mut deadline = Deadline::after_us(COMMAND_TIMEOUT_US);
        while ral::read_reg!(ral::usb, self.usb, USBCMD, RST == 1) {
            if deadline.expired() {
                error!("USB{=u8} reset timeout", self.controller);
                break;
            }
        }
        // ITC is reset to some non-immediate value. Use the 'immediate' value by default.
        // (Note: this also zeros all other USBCMD fields.)
        ral::write_reg!(ral::usb, self.usb, USBCMD, ITC: 0);

        ral::write_reg!(ral::usb, self.usb, USBMODE, CM: ral::usb::CM_DEVICE, SLOM: 1);
        ral::modify_reg!(ral::usb, self.usb, PORTSC1, PFSC: config.force_full_speed as u32);

        let den = ral::read_reg!(ral::usb, self.usb, DCCPARAMS, DEN) as usize;
        self.endpoints.store(den.clamp(1, LE_COUNT), Ordering::Release);
        ral::write_reg!(ral::usb, self.usb, ENDPTLISTADDR, self.pool.qh_list_addr());

        for (he, flags) in [
            (
                0,
                qh::Flags {
                    interrupt_on_setup: true,
                    zero_length_termination: false,
                },
            ),
            (1, qh::Flags::default()),
        ] {
            self.qh(he).set_config(CONTROL_MAX_PACKET as usize, flags);
            self.qh(he).set_next(None);
        }

        ral::modify_reg!(ral::usb, self.usb, USBSTS, |usbsts: u32| usbsts);
        ral::write_reg!(ral::usb, self.usb, USBINTR, UE: 1, UEE: 1, PCE: 1, URE: 1, SLE: 1);

        #[cfg(target_arch = "arm")]
        {
            let irq = Irq(if self.controller == 1 { 113 } else { 112 });
            // Safety: we own this interrupt, and the ISR is ready.
            unsafe {
                cortex_m::Peripherals::steal()
                    .NVIC
                    .set_priority(irq, config.interrupt_priority);
                cortex_m::peripheral::NVIC::unmask(irq);
            }
        }
        #[cfg(not(target_arch = "arm"))]
        let _ = config.interrupt_priority;

        debug!("USB{=u8} initialized", self.controller);
    }

    /// Connect to the host.
    ///
    /// Waits 20ms first, so the host sees a disconnect after power up.
    pub fn enable(&self) {
        time::delay_us(20_000);
        ral::modify_reg!(ral::usb, self.usb, USBCMD, RS: 1);
    }

    /// Disconnect from the host.
    ///
    /// The device is no longer configured. Transfers in flight complete
    /// with a bus reset error; see [`TransferError::is_bus_reset`](crate::TransferError::is_bus_reset).
    pub fn disable(&self) {
        ral::modify_reg!(ral::usb, self.usb, USBCMD, RS: 0);
        self.deconfigure();
    }

    /// The USB controller, 1 or 2.
    pub fn controller(&self) -> u8 {
        self.controller
    }

    /// The configuration that the host selected, or zero.
    pub fn config(&self) -> u8 {
        self.config.load(Ordering::Acquire)
    }

    pub fn speed(&self) -> Speed {
        Speed::from_u8(self.speed.load(Ordering::Relaxed))
    }

    pub(crate) fn set_speed(&self, speed: Speed) {
        self.speed.store(speed as u8, Ordering::Relaxed);
    }

    pub(crate) fn endpoints(&self) -> usize {
        self.endpoints.load(Ordering::Acquire)
    }

    pub(crate) fn descriptors(&self) -> &'static [Descriptor] {
        // Safety: only written in init, before the ISR runs.
        unsafe { *self.descriptors.get() }
    }

    pub(crate) fn qh(&self, he: usize) -> &Qh {
        self.pool.qh(he)
    }

    /// Wait until the host selects configuration `n`, or any
    /// configuration if `n` is zero.
    ///
    /// Returns `false` on timeout.
    pub fn wait_config(&self, n: u8, timeout: Timeout) -> bool {
        let reached = || match self.config() {
            0 => false,
            config => n == 0 || config == n,
        };
        let mut deadline = match timeout {
            Timeout::Forever => None,
            Timeout::Micros(us) => Some(Deadline::after_us(us)),
        };

        let signal = Signal::new();
        let ptr = &signal as *const Signal as *mut Signal;
        loop {
            signal.clear();
            let slot = self.waiters.iter().find(|slot| {
                slot.compare_exchange(ptr::null_mut(), ptr, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            });
            // The ISR may have configured the device before we registered.
            if reached() {
                self.unregister(slot, &signal);
                return true;
            }
            let remaining = match deadline.as_mut().map(Deadline::remaining) {
                None => Timeout::Forever,
                Some(Some(remaining)) => remaining,
                Some(None) => {
                    self.unregister(slot, &signal);
                    return reached();
                }
            };
            if slot.is_some() {
                signal.sleep(remaining);
            } else {
                // No slot; poll.
                signal.sleep(match remaining {
                    Timeout::Micros(us) => Timeout::Micros(us.min(1_000)),
                    Timeout::Forever => Timeout::Micros(1_000),
                });
            }
            self.unregister(slot, &signal);
        }
    }

    fn unregister(&self, slot: Option<&AtomicPtr<Signal>>, signal: &Signal) {
        let Some(slot) = slot else { return };
        let ptr = signal as *const Signal as *mut Signal;
        if slot
            .compare_exchange(ptr, ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            // The ISR took the signal. Don't leave until it's done with it.
            signal.sleep(Timeout::Forever);
        }
    }

    fn wake_waiters(&self) {
        for slot in &self.waiters {
            let signal = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            // Safety: a waiter stays until it sees its signal set.
            if let Some(signal) = unsafe { signal.as_ref() } {
                signal.wakeup();
            }
        }
    }

    /// Store the configuration, and wake everyone waiting for it.
    pub(crate) fn set_config(&self, value: u8) {
        self.config.store(value, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.wake_waiters();
    }

    /// Disable every endpoint but the control endpoint, and complete all
    /// of their transfers.
    ///
    /// Transfers that didn't finish keep their ACTIVE status.
    pub(crate) fn deconfigure(&self) {
        let usb = &*self.usb;
        for le in 1..self.endpoints() {
            usb.ENDPTCTRL[le].write(0);
        }
        ral::write_reg!(ral::usb, usb, ENDPTFLUSH, 0xFFFE_FFFE);
        if !wait_clear(|| ral::read_reg!(ral::usb, usb, ENDPTFLUSH), 0xFFFE_FFFE) {
            warn!("Endpoint flush timeout");
        }
        let mut drained = 0;
        for he in 2..QH_COUNT {
            drained += self.pool.queue(he).drain();
            self.qh(he).set_next(None);
        }
        if drained != 0 {
            debug!("Completed {=usize} transfers", drained);
        }
        self.set_config(0);
    }

    /// Submit the transfer `first` through `last` on hardware endpoint
    /// `he`.
    ///
    /// Set up each descriptor with [`Dtd::setup_transfer`], and chain
    /// them with [`Dtd::set_next`]. The descriptors belong to the
    /// controller until their completion signal fires.
    ///
    /// Returns [`Error::NotReady`] if the device isn't configured. Wait
    /// with [`wait_config`](Self::wait_config), then try again.
    ///
    /// Submit to one endpoint from one execution priority. An interrupt
    /// that primes an endpoint while it preempts another prime of the
    /// same endpoint spins forever.
    ///
    /// # Panics
    ///
    /// Panics if `he` is a control endpoint, or isn't implemented. Panics
    /// if the descriptors weren't set up, or are still active.
    pub fn prime(&self, he: usize, first: &'static Dtd, last: &'static Dtd) -> Result<()> {
        assert!(
            (2..self.endpoints() * 2).contains(&he),
            "Invalid hardware endpoint"
        );
        let epoch = self.epoch.load(Ordering::Acquire);
        if self.config() == 0 {
            return Err(Error::NotReady);
        }
        queue::prime(&self.usb, &self.tripwire, self.qh(he), self.pool.queue(he), he, first, last);

        // The host reconfigured us while we primed. The endpoint may be
        // gone, and the descriptors may never complete. Make the host reset
        // the bus; that completes everything.
        if self.epoch.load(Ordering::Acquire) != epoch {
            warn!("Configuration changed while priming {=usize}; resetting", he);
            ral::modify_reg!(ral::usb, self.usb, USBCMD, RS: 0);
            time::delay_us(10_000);
            ral::modify_reg!(ral::usb, self.usb, USBCMD, RS: 1);
            return Err(Error::NotReady);
        }
        Ok(())
    }

    /// The outcome of a transfer on hardware endpoint `he`.
    ///
    /// Returns the number of bytes that were *not* transferred. Only
    /// meaningful after the descriptor's signal fired.
    pub fn transfer_status(&self, he: usize, dtd: &Dtd) -> Result<usize> {
        let (remaining, status) = dtd.status();
        if status.is_empty() {
            Ok(remaining)
        } else {
            Err(Error::Transfer(TransferError {
                controller: self.controller,
                he: he as u8,
                status,
            }))
        }
    }
}

/// Spin until the controller clears `mask` in a command register.
pub(crate) fn wait_clear(read: impl Fn() -> u32, mask: u32) -> bool {
    let mut deadline = Deadline::after_us(COMMAND_TIMEOUT_US);
    while read() & mask != 0 {
        if deadline.expired() {
            return false;
        }
        core::hint::spin_loop();
    }
    true
}
