//! A software model of the USB controller, for tests
//!
//! The [`Emulator`] owns simulated register blocks and a device that's
//! been initialized on them. It plays the host and the controller: it
//! delivers SETUP packets, completes transfer descriptors, and raises
//! interrupts by calling the ISR.

use std::{
    ptr,
    sync::{
        atomic::{fence, Ordering},
        Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    descriptor::{self, Descriptor, DeviceDescriptor},
    device::{Config, Device, Speed},
    pool::DescriptorPool,
    ral::{
        self,
        usb::{self, USBSTS},
        usbphy,
    },
    serial::descriptors::{self as acm, AcmFunction},
    td::{self, Dtd, Status},
};

const DEVICE: DeviceDescriptor = DeviceDescriptor {
    vendor_id: 0x1209,
    product_id: 0x2001,
    ..DeviceDescriptor::MISC_IAD
};
static DEVICE_BYTES: [u8; 18] = DEVICE.bytes();
static QUALIFIER: [u8; 10] = DEVICE.qualifier();
const FUNCTION: AcmFunction = AcmFunction::new(0);
static HIGH_SPEED: [u8; acm::CONFIGURATION_LEN] =
    acm::configuration(descriptor::CONFIGURATION, 1, &FUNCTION, Speed::High);
static FULL_SPEED: [u8; acm::CONFIGURATION_LEN] =
    acm::configuration(descriptor::OTHER_SPEED_CONFIGURATION, 1, &FUNCTION, Speed::Full);
static PRODUCT: [u8; 10] = descriptor::string_descriptor("ACM1");

/// A device with one CDC-ACM function.
pub(crate) static ACM_DESCRIPTORS: &[Descriptor] = &[
    Descriptor::new(descriptor::DEVICE, 0, 0, &DEVICE_BYTES),
    Descriptor::new(descriptor::DEVICE_QUALIFIER, 0, 0, &QUALIFIER),
    Descriptor::new(descriptor::CONFIGURATION, 0, 0, &HIGH_SPEED),
    Descriptor::new(descriptor::OTHER_SPEED_CONFIGURATION, 0, 0, &FULL_SPEED),
    Descriptor::new(descriptor::STRING, 0, 0, &descriptor::LANGUAGES_EN_US),
    Descriptor::new(descriptor::STRING, 2, descriptor::EN_US, &PRODUCT),
];

/// Give up on the driver after this long.
const PATIENCE: Duration = Duration::from_secs(5);

pub(crate) struct SimPeripherals {
    usb: &'static usb::RegisterBlock,
    phy: &'static usbphy::RegisterBlock,
}

// Safety: the register blocks are leaked, so they live forever.
unsafe impl crate::Peripherals for SimPeripherals {
    fn core(&self) -> *const () {
        (self.usb as *const usb::RegisterBlock).cast()
    }
    fn phy(&self) -> *const () {
        (self.phy as *const usbphy::RegisterBlock).cast()
    }
}

pub(crate) struct Emulator {
    pub device: &'static Device,
    pub usb: &'static usb::RegisterBlock,
    pub phy: &'static usbphy::RegisterBlock,
    /// Descriptors, other than control memory, that can complete.
    tracked: Mutex<Vec<&'static Dtd>>,
}

impl Emulator {
    /// A device without descriptors.
    pub fn new() -> Self {
        Self::with_descriptors(&[])
    }

    pub fn with_descriptors(descriptors: &'static [Descriptor]) -> Self {
        let usb: &'static usb::RegisterBlock = Box::leak(Box::default());
        let phy: &'static usbphy::RegisterBlock = Box::leak(Box::default());
        usb.DCCPARAMS.write(8);
        let pool: &'static DescriptorPool = Box::leak(Box::new(DescriptorPool::new()));
        let device = Device::new(1, SimPeripherals { usb, phy }, pool).unwrap();
        device.init(Config::new(descriptors));
        Emulator {
            device,
            usb,
            phy,
            tracked: Mutex::new(Vec::new()),
        }
    }

    /// Another handle on the same registers.
    pub fn peripherals(&self) -> SimPeripherals {
        SimPeripherals {
            usb: self.usb,
            phy: self.phy,
        }
    }

    /// Let the emulator complete `dtds`.
    pub fn track(&self, dtds: &'static [Dtd]) {
        self.tracked.lock().unwrap().extend(dtds.iter());
    }

    /// Raise `bits` in USBSTS, and run the ISR.
    pub fn interrupt(&self, bits: u32) {
        self.usb.USBSTS.raise(bits);
        self.device.isr();
    }

    /// The host sends a SETUP to control endpoint `le`.
    pub fn setup(&self, le: usize, packet: [u8; 8]) {
        let words = [
            u32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]),
            u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]),
        ];
        self.device.qh(le * 2).sim_setup(words);
        self.usb.ENDPTSETUPSTAT.raise(1 << le);
        self.interrupt(USBSTS::UI::mask);
    }

    /// The port settled at `speed`.
    pub fn port_change(&self, speed: Speed) {
        let pspd = match speed {
            Speed::High => 2,
            Speed::Full => 0,
        };
        ral::modify_reg!(ral::usb, self.usb, PORTSC1, PSPD: pspd);
        self.interrupt(USBSTS::PCI::mask);
    }

    /// The host resets the bus.
    pub fn bus_reset(&self) {
        self.accept_primes();
        self.usb.ENDPTSTAT.write(0);
        self.interrupt(USBSTS::URI::mask);
    }

    /// The controller starts on every primed endpoint.
    pub fn accept_primes(&self) {
        let primed = self.usb.ENDPTPRIME.take();
        self.usb.ENDPTSTAT.write(self.usb.ENDPTSTAT.read() | primed);
    }

    fn find(&self, he: usize) -> Option<&'static Dtd> {
        let next = td::hw_link_addr(self.device.qh(he).overlay().NEXT.read())?;
        let pool = self.device.pool;
        let control = [
            &pool.isr_control().data,
            &pool.isr_control().status,
            &pool.thread_control().data,
            &pool.thread_control().status,
        ];
        let tracked = self.tracked.lock().unwrap();
        control
            .into_iter()
            .chain(tracked.iter().copied())
            .find(|dtd| dtd.hw().addr() == next && dtd.is_active())
    }

    /// Wait until the driver primes a descriptor on hardware endpoint
    /// `he`.
    pub fn wait_active(&self, he: usize) -> &'static Dtd {
        let start = Instant::now();
        loop {
            self.accept_primes();
            if let Some(dtd) = self.find(he) {
                return dtd;
            }
            assert!(start.elapsed() < PATIENCE, "nothing primed on {he}");
            thread::sleep(Duration::from_micros(200));
        }
    }

    /// Complete the next descriptor on `he`, transferring `n` bytes, or
    /// everything if `None`.
    ///
    /// Returns the descriptor, and the number of bytes it asked for.
    pub fn complete(&self, he: usize, n: Option<usize>) -> (&'static Dtd, usize) {
        let dtd = self.wait_active(he);
        let (len, _) = dtd.status();
        self.finish(he, dtd, n.unwrap_or(len));
        (dtd, len)
    }

    /// The host sends `data` to `he`. The driver must have primed a
    /// descriptor at `dst`.
    pub fn receive(&self, he: usize, dst: *mut u8, data: &[u8]) -> (&'static Dtd, usize) {
        let dtd = self.wait_active(he);
        let (len, _) = dtd.status();
        assert!(data.len() <= len, "{} bytes don't fit in {len}", data.len());
        // Safety: the driver lends dst to the controller.
        unsafe { ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        self.finish(he, dtd, data.len());
        (dtd, len)
    }

    /// The next descriptor on `he` fails. The controller halts it, and
    /// raises the error interrupt without flagging the endpoint as
    /// complete.
    pub fn halt(&self, he: usize) -> &'static Dtd {
        use td::TOKEN::STATUS;

        let dtd = self.wait_active(he);
        let token = dtd.hw().TOKEN.read();
        dtd.hw()
            .TOKEN
            .write(token & !STATUS::mask | Status::HALTED.bits());
        let qh = self.device.qh(he);
        qh.sim_current(dtd.hw().addr());
        qh.overlay().NEXT.write(td::hw_link(None));
        let mask = ral::endpoint_mask(he);
        self.usb.ENDPTSTAT.write(self.usb.ENDPTSTAT.read() & !mask);
        self.interrupt(USBSTS::UEI::mask);
        dtd
    }

    fn finish(&self, he: usize, dtd: &'static Dtd, n: usize) {
        use td::TOKEN::{STATUS, TOTAL_BYTES};

        let qh = self.device.qh(he);
        let mask = ral::endpoint_mask(he);
        let token = dtd.hw().TOKEN.read();
        let remaining = ((token & TOTAL_BYTES::mask) >> TOTAL_BYTES::offset).saturating_sub(n as u32);
        dtd.hw()
            .TOKEN
            .write(token & !(TOTAL_BYTES::mask | STATUS::mask) | remaining << TOTAL_BYTES::offset);

        qh.sim_current(dtd.hw().addr());
        let next = dtd.hw().NEXT.read();
        qh.overlay().NEXT.write(next);
        if td::hw_link_addr(next).is_none() {
            self.usb.ENDPTSTAT.write(self.usb.ENDPTSTAT.read() & !mask);
            fence(Ordering::SeqCst);
            // An appender linked behind us while we went idle. The
            // controller would have seen that.
            let next = dtd.hw().NEXT.read();
            if td::hw_link_addr(next).is_some() {
                qh.overlay().NEXT.write(next);
                self.usb.ENDPTSTAT.write(self.usb.ENDPTSTAT.read() | mask);
            }
        }

        self.usb.ENDPTCOMPLETE.raise(mask);
        if he >= 2 {
            self.interrupt(USBSTS::UI::mask);
        }
    }
}
