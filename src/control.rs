//! Control transfers
//!
//! The ISR answers the standard requests of endpoint 0 itself. Every
//! other request waits for the thread that calls
//! [`Device::process_control_requests`], which hands it to the
//! [`ControlHandler`] registered for the request's [`RequestKey`].
//!
//! A control transfer has a SETUP stage, an optional data stage, and a
//! status stage. The data stage is always primed before the status stage,
//! and the status stage is always zero length, in the direction opposite
//! to the data.

#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::{
    cell::UnsafeCell,
    sync::atomic::{AtomicU32, AtomicU8, Ordering},
};

use usb_device::{
    control::{Recipient, Request, RequestType},
    endpoint::EndpointAddress,
    UsbDirection,
};

use crate::{
    cache,
    descriptor::{self, EndpointDescriptors},
    device::{self, Device},
    pool::{ControlMemory, CONTROL_BUFFER_SIZE, LE_COUNT},
    qh, ral,
    td::{self, Dtd},
    time::{Deadline, Timeout},
};

/// How long we wait on the host during a control transfer.
const CONTROL_TIMEOUT_US: u32 = 50_000;

/// Endpoint type for the unused half of an endpoint.
const BULK: u32 = 2;

/// A request received on a control endpoint.
pub struct ControlRequest<'a> {
    /// The logical (control) endpoint that received the request.
    pub le: usize,
    /// bmRequestType
    pub request_type: u8,
    /// bRequest
    pub request: u8,
    /// wValue
    pub value: u16,
    /// wIndex
    pub index: u16,
    /// wLength
    pub length: u16,
    /// Data stage.
    ///
    /// For host-to-device requests, the data that the host sent. For
    /// device-to-host requests, room for the response, up to `length`
    /// bytes.
    pub data: &'a mut [u8],
}

impl ControlRequest<'_> {
    pub fn direction(&self) -> UsbDirection {
        direction(self.request_type)
    }
    pub fn kind(&self) -> RequestType {
        kind(self.request_type)
    }
    pub fn recipient(&self) -> Recipient {
        recipient(self.request_type)
    }
    pub fn key(&self) -> RequestKey {
        RequestKey::from_raw(self.request_type, self.request)
    }
}

fn direction(request_type: u8) -> UsbDirection {
    if request_type & 0x80 != 0 {
        UsbDirection::In
    } else {
        UsbDirection::Out
    }
}

fn kind(request_type: u8) -> RequestType {
    match (request_type >> 5) & 0b11 {
        0 => RequestType::Standard,
        1 => RequestType::Class,
        2 => RequestType::Vendor,
        _ => RequestType::Reserved,
    }
}

fn recipient(request_type: u8) -> Recipient {
    match request_type & 0b11111 {
        0 => Recipient::Device,
        1 => Recipient::Interface,
        2 => Recipient::Endpoint,
        3 => Recipient::Other,
        _ => Recipient::Reserved,
    }
}

/// Answers control requests in thread context.
pub trait ControlHandler: Sync {
    /// Handle the request.
    ///
    /// Return the number of response bytes written to `request.data`
    /// for device-to-host requests, or any number to accept a
    /// host-to-device request. Return `None` to stall the request.
    fn handle(&self, request: &mut ControlRequest<'_>) -> Option<usize>;
}

/// Identifies a request: its direction, type, recipient, and code.
///
/// ```
/// use imxrt_dcd::control::RequestKey;
/// use usb_device::{control::{Recipient, RequestType}, UsbDirection};
///
/// const SET_LINE_CODING: RequestKey =
///     RequestKey::new(UsbDirection::Out, RequestType::Class, Recipient::Interface, 0x20);
/// assert_eq!(SET_LINE_CODING, RequestKey::from_raw(0x21, 0x20));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestKey(u16);

impl RequestKey {
    pub const fn new(
        direction: UsbDirection,
        kind: RequestType,
        recipient: Recipient,
        request: u8,
    ) -> Self {
        let request_type = direction as u8 | (kind as u8) << 5 | recipient as u8;
        Self::from_raw(request_type, request)
    }

    /// From bmRequestType and bRequest.
    pub const fn from_raw(request_type: u8, request: u8) -> Self {
        RequestKey(request_type as u16 | (request as u16) << 8)
    }

    const fn to_bits(self) -> u32 {
        self.0 as u32
    }
}

const EMPTY: u8 = 0;
const BUSY: u8 = 1;
const READY: u8 = 2;

/// Most handlers a device can register.
pub const MAX_HANDLERS: usize = 8;

struct Slot {
    state: AtomicU8,
    key: AtomicU32,
    handler: UnsafeCell<Option<&'static dyn ControlHandler>>,
}

impl Slot {
    const fn new() -> Self {
        Slot {
            state: AtomicU8::new(EMPTY),
            key: AtomicU32::new(0),
            handler: UnsafeCell::new(None),
        }
    }

    /// Own a ready slot. Spins while someone else owns it.
    fn acquire(&self) -> bool {
        loop {
            match self
                .state
                .compare_exchange_weak(READY, BUSY, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(EMPTY) => return false,
                Err(_) => core::hint::spin_loop(),
            }
        }
    }

    fn release(&self) {
        self.state.store(READY, Ordering::Release);
    }
}

/// A fixed table of request handlers.
///
/// Only threads use the table; the ISR never looks at it.
pub(crate) struct Handlers {
    slots: [Slot; MAX_HANDLERS],
}

// Safety: a slot's handler is only accessed while the slot is BUSY, and
// only one party can make it BUSY.
unsafe impl Sync for Handlers {}

impl Handlers {
    pub const fn new() -> Self {
        const SLOT: Slot = Slot::new();
        Handlers {
            slots: [SLOT; MAX_HANDLERS],
        }
    }

    /// Returns `false` if the table is full.
    pub fn insert(&self, key: RequestKey, handler: &'static dyn ControlHandler) -> bool {
        for slot in &self.slots {
            if slot.acquire() {
                if slot.key.load(Ordering::Relaxed) == key.to_bits() {
                    // Safety: slot is BUSY, and we made it BUSY.
                    unsafe { *slot.handler.get() = Some(handler) };
                    slot.release();
                    return true;
                }
                slot.release();
            }
        }
        for slot in &self.slots {
            if slot
                .state
                .compare_exchange(EMPTY, BUSY, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                slot.key.store(key.to_bits(), Ordering::Relaxed);
                // Safety: slot is BUSY, and we made it BUSY.
                unsafe { *slot.handler.get() = Some(handler) };
                slot.release();
                return true;
            }
        }
        false
    }

    pub fn get(&self, key: RequestKey) -> Option<&'static dyn ControlHandler> {
        for slot in &self.slots {
            if slot.acquire() {
                let handler = if slot.key.load(Ordering::Relaxed) == key.to_bits() {
                    // Safety: slot is BUSY, and we made it BUSY.
                    unsafe { *slot.handler.get() }
                } else {
                    None
                };
                slot.release();
                if handler.is_some() {
                    return handler;
                }
            }
        }
        None
    }
}

/// The fixed part of a SETUP packet.
#[derive(Clone, Copy)]
pub(crate) struct Setup {
    request_type: u8,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
}

impl Setup {
    pub fn from_words(words: [u32; 2]) -> Self {
        Setup {
            request_type: words[0] as u8,
            request: (words[0] >> 8) as u8,
            value: (words[0] >> 16) as u16,
            index: words[1] as u16,
            length: (words[1] >> 16) as u16,
        }
    }

    /// The standard requests for the device, an interface, or an
    /// endpoint.
    pub fn is_standard(&self) -> bool {
        self.request_type & 0x7F <= 2
    }

    fn direction(&self) -> UsbDirection {
        direction(self.request_type)
    }

    fn data_len(&self) -> usize {
        (self.length as usize).min(CONTROL_BUFFER_SIZE)
    }
}

/// Stages of one control transfer.
struct Transfer<'a> {
    device: &'a Device,
    memory: &'a ControlMemory,
    le: usize,
}

impl Transfer<'_> {
    fn prime(&self, he: usize, dtd: &Dtd, ptr: *const u8, len: usize) {
        let usb = &*self.device.usb;
        let qh = self.device.qh(he);
        let mask = ral::endpoint_mask(he);

        // Let the previous transfer on this endpoint finish.
        let mut deadline = Deadline::after_us(CONTROL_TIMEOUT_US);
        while td::hw_link_addr(qh.overlay().NEXT.read()).is_some()
            && ral::read_reg!(ral::usb, usb, ENDPTCOMPLETE) & mask == 0
        {
            if deadline.expired() {
                warn!("Control endpoint {=usize} busy", he);
                break;
            }
        }
        ral::write_reg!(ral::usb, usb, ENDPTCOMPLETE, mask);

        dtd.set_signal(None);
        // Safety: control memory outlives the transfer, and the buffer is
        // smaller than a page.
        unsafe { dtd.setup_transfer(ptr, len) };
        dtd.set_hw_next(None);
        qh.set_next(Some(dtd.hw()));
        ral::write_reg!(ral::usb, usb, ENDPTPRIME, mask);
    }

    /// Data stage, device to host. `requested` is wLength.
    fn send(&self, len: usize, requested: usize) {
        let he = device::he(self.le, UsbDirection::In);
        // A reply shorter than requested ends with a short packet.
        self.device.qh(he).set_config(
            descriptor::CONTROL_MAX_PACKET as usize,
            qh::Flags {
                interrupt_on_setup: false,
                zero_length_termination: len < requested,
            },
        );
        let buffer = self.memory.buffer_ptr();
        cache::flush(buffer, len);
        self.prime(he, &self.memory.data, buffer, len);
    }

    /// Data stage, host to device. Returns the number of received bytes,
    /// or `None` if the host didn't send the data in time.
    fn receive(&self, len: usize) -> Option<usize> {
        let buffer = self.memory.buffer_ptr();
        let dtd = &self.memory.data;
        cache::invalidate(buffer, len);
        self.prime(device::he(self.le, UsbDirection::Out), dtd, buffer, len);
        let mut deadline = Deadline::after_us(CONTROL_TIMEOUT_US);
        while dtd.is_active() {
            if deadline.expired() {
                warn!("Control OUT data timeout");
                return None;
            }
            core::hint::spin_loop();
        }
        cache::invalidate(buffer, len);
        let (remaining, _) = dtd.status();
        Some(len.saturating_sub(remaining))
    }

    /// Zero length status stage.
    fn status(&self, direction: UsbDirection) {
        let he = device::he(self.le, direction);
        self.prime(he, &self.memory.status, core::ptr::null(), 0);
    }

    fn stall(&self, setup: &Setup) {
        warn!(
            "STALL le {=usize} bmRequestType {=u8:#x} bRequest {=u8} wValue {=u16:#x} wIndex {=u16} wLength {=u16}",
            self.le,
            setup.request_type,
            setup.request,
            setup.value,
            setup.index,
            setup.length
        );
        let ctrl = ral::usb::endptctrl(&self.device.usb, self.le);
        ral::modify_reg!(ral::usb, &ctrl, ENDPTCTRL, RXS: 1, TXS: 1);
    }

    /// Run the data and status stages around `handler`.
    fn execute(
        &self,
        setup: Setup,
        handler: impl FnOnce(&mut ControlRequest<'_>) -> Option<usize>,
    ) {
        let len = setup.data_len();
        let direction = setup.direction();
        let room = if direction == UsbDirection::Out && len > 0 {
            match self.receive(len) {
                Some(received) => received,
                None => return self.stall(&setup),
            }
        } else {
            len
        };

        let result = {
            // Safety: each control memory has one user, and the transfer
            // stages don't touch the buffer while the handler has it.
            let buffer = unsafe { self.memory.buffer() };
            let mut request = ControlRequest {
                le: self.le,
                request_type: setup.request_type,
                request: setup.request,
                value: setup.value,
                index: setup.index,
                length: setup.length,
                data: &mut buffer[..room],
            };
            handler(&mut request)
        };

        match result {
            None => self.stall(&setup),
            Some(n) if direction == UsbDirection::In && len > 0 => {
                self.send(n.min(len), setup.length as usize);
                self.status(UsbDirection::Out);
            }
            Some(_) => self.status(UsbDirection::In),
        }
    }
}

/// Handle a standard request on endpoint 0. Call from the ISR.
pub(crate) fn standard(device: &Device, setup: Setup) {
    let transfer = Transfer {
        device,
        memory: device.pool.isr_control(),
        le: 0,
    };

    // Nothing standard has host-to-device data that we'd accept, and the
    // ISR doesn't wait for data.
    if setup.direction() == UsbDirection::Out && setup.length > 0 {
        return transfer.stall(&setup);
    }

    match (recipient(setup.request_type), setup.request) {
        (Recipient::Device, Request::SET_ADDRESS) => {
            // The controller latches the address after the status stage.
            transfer.status(UsbDirection::In);
            let address = setup.value as u32 & 0x7F;
            ral::write_reg!(ral::usb, device.usb, DEVICEADDR, USBADR: address, USBADRA: 1);
            debug!("ADDRESS {=u32}", address);
        }
        (Recipient::Device, Request::SET_CONFIGURATION) => {
            if set_configuration(device, setup.value as u8) {
                transfer.status(UsbDirection::In);
            } else {
                transfer.stall(&setup);
            }
        }
        _ => transfer.execute(setup, |request| standard_request(device, request)),
    }
}

fn reply(data: &mut [u8], bytes: &[u8]) -> usize {
    let n = data.len().min(bytes.len());
    data[..n].copy_from_slice(&bytes[..n]);
    n
}

fn standard_request(device: &Device, request: &mut ControlRequest<'_>) -> Option<usize> {
    const HALT: u16 = Request::FEATURE_ENDPOINT_HALT;
    match (request.recipient(), request.request) {
        (Recipient::Device | Recipient::Interface, Request::GET_STATUS) => {
            Some(reply(request.data, &[0, 0]))
        }
        (Recipient::Endpoint, Request::GET_STATUS) => {
            let halted = halt(device, request.index, None)?;
            Some(reply(request.data, &[halted as u8, 0]))
        }
        (Recipient::Endpoint, Request::CLEAR_FEATURE) if request.value == HALT => {
            halt(device, request.index, Some(false)).map(|_| 0)
        }
        (Recipient::Endpoint, Request::SET_FEATURE) if request.value == HALT => {
            halt(device, request.index, Some(true)).map(|_| 0)
        }
        (_, Request::GET_DESCRIPTOR) => {
            let kind = (request.value >> 8) as u8;
            let index = request.value as u8;
            let (bytes, patched) = device.descriptor(kind, index, request.index)?;
            let n = reply(request.data, bytes);
            if patched && n > 1 {
                request.data[1] = kind;
            }
            Some(n)
        }
        (Recipient::Device, Request::GET_CONFIGURATION) => {
            Some(reply(request.data, &[device.config()]))
        }
        (Recipient::Interface, Request::GET_INTERFACE) => Some(reply(request.data, &[0])),
        (Recipient::Interface, Request::SET_INTERFACE) if request.value == 0 => Some(0),
        _ => None,
    }
}

/// Query, set, or clear an endpoint's stall bit. `index` is wIndex, the
/// endpoint address.
///
/// Returns the stall state before any change, or `None` if there's no
/// such endpoint.
fn halt(device: &Device, index: u16, stall: Option<bool>) -> Option<bool> {
    let address = EndpointAddress::from(index as u8);
    let le = address.index();
    if le >= device.endpoints() {
        return None;
    }
    let ctrl = ral::usb::endptctrl(&device.usb, le);
    let halted = if address.is_in() {
        ral::read_reg!(ral::usb, &ctrl, ENDPTCTRL, TXS == 1)
    } else {
        ral::read_reg!(ral::usb, &ctrl, ENDPTCTRL, RXS == 1)
    };
    match (stall, address.is_in()) {
        (Some(true), true) => ral::modify_reg!(ral::usb, &ctrl, ENDPTCTRL, TXS: 1),
        (Some(true), false) => ral::modify_reg!(ral::usb, &ctrl, ENDPTCTRL, RXS: 1),
        (Some(false), true) => ral::modify_reg!(ral::usb, &ctrl, ENDPTCTRL, TXS: 0, TXR: 1),
        (Some(false), false) => ral::modify_reg!(ral::usb, &ctrl, ENDPTCTRL, RXS: 0, RXR: 1),
        (None, _) => {}
    }
    Some(halted)
}

/// Program the endpoints of configuration `value`.
///
/// Returns `false` if there's no such configuration. The device is
/// unconfigured after a `false` return.
fn set_configuration(device: &Device, value: u8) -> bool {
    use ral::usb::ENDPTCTRL::{RXE, RXR, RXT, TXT};

    device.deconfigure();
    if value == 0 {
        debug!("SET_CONFIGURATION 0");
        return true;
    }
    let Some(configuration) = device.configuration(value) else {
        return false;
    };

    let endpoints = device.endpoints();
    let mut ctrl = [0u32; LE_COUNT];
    for ep in EndpointDescriptors::new(configuration) {
        let le = ep.address.index();
        if le == 0 || le >= endpoints {
            warn!("Endpoint {=usize} not supported", le);
            continue;
        }
        let is_in = ep.address.is_in();
        let qh = device.qh(device::he(le, ep.address.direction()));
        qh.set_config(
            ep.max_packet_size as usize,
            qh::Flags {
                interrupt_on_setup: false,
                zero_length_termination: is_in,
            },
        );
        qh.set_next(None);
        let half = (ep.transfer_type as u32) << RXT::offset | RXR::mask | RXE::mask;
        ctrl[le] |= if is_in { half << 16 } else { half };
    }

    for (le, &cfg) in ctrl.iter().enumerate().take(endpoints).skip(1) {
        let mut cfg = cfg;
        let (rx, tx) = (cfg & 0xFFFF, cfg >> 16);
        // The unused half of an enabled endpoint can't stay a control
        // endpoint.
        if rx == 0 && tx & RXT::mask != 0 {
            cfg |= BULK << RXT::offset;
        }
        if tx == 0 && rx & RXT::mask != 0 {
            cfg |= BULK << TXT::offset;
        }
        if cfg != 0 {
            device.usb.ENDPTCTRL[le].write(cfg);
        }
    }

    debug!("SET_CONFIGURATION {=u8}", value);
    device.set_config(value);
    true
}

impl Device {
    /// Register `handler` for requests that match `key`.
    ///
    /// Replaces the handler that was registered for `key`. Handlers run
    /// in the thread that calls
    /// [`process_control_requests`](Device::process_control_requests).
    ///
    /// # Panics
    ///
    /// Panics if there are already [`MAX_HANDLERS`] handlers.
    pub fn handle(&self, key: RequestKey, handler: &'static dyn ControlHandler) {
        assert!(
            self.handlers.insert(key, handler),
            "Too many control request handlers"
        );
    }

    /// The handler registered for `key`.
    pub fn handler(&self, key: RequestKey) -> Option<&'static dyn ControlHandler> {
        self.handlers.get(key)
    }

    /// Answer the control requests that the ISR deferred.
    ///
    /// Waits for requests, up to `timeout`, if there are none. Returns
    /// the number of requests that were handled. Call this in a loop,
    /// from the thread that should run your [`ControlHandler`]s.
    pub fn process_control_requests(&self, timeout: Timeout) -> usize {
        if self.dispatching.swap(true, Ordering::Acquire) {
            return 0;
        }

        self.dispatch.clear();
        if self.pending.load(Ordering::Acquire) == 0 {
            self.dispatch.sleep(timeout);
        }

        let mut pending = self.pending.swap(0, Ordering::AcqRel);
        let handled = pending.count_ones() as usize;
        while pending != 0 {
            let le = pending.trailing_zeros() as usize;
            pending &= pending - 1;
            let setup = Setup::from_words([
                self.setups[le][0].load(Ordering::Acquire),
                self.setups[le][1].load(Ordering::Acquire),
            ]);
            let transfer = Transfer {
                device: self,
                memory: self.pool.thread_control(),
                le,
            };
            let key = RequestKey::from_raw(setup.request_type, setup.request);
            match self.handlers.get(key) {
                Some(handler) => transfer.execute(setup, |request| handler.handle(request)),
                None => transfer.stall(&setup),
            }
        }

        self.dispatching.store(false, Ordering::Release);
        handled
    }

    /// Find a descriptor for GET_DESCRIPTOR.
    ///
    /// At full speed, the configuration and other speed configuration
    /// trade places. Returns `true` alongside a swapped descriptor, whose
    /// type byte needs patching.
    fn descriptor(&self, kind: u8, index: u8, language: u16) -> Option<(&'static [u8], bool)> {
        use descriptor::{CONFIGURATION, OTHER_SPEED_CONFIGURATION};

        let table = self.descriptors();
        if self.speed() == device::Speed::Full {
            let other = match kind {
                CONFIGURATION => Some(OTHER_SPEED_CONFIGURATION),
                OTHER_SPEED_CONFIGURATION => Some(CONFIGURATION),
                _ => None,
            };
            if let Some(bytes) = other.and_then(|other| descriptor::lookup(table, other, index, language)) {
                return Some((bytes, true));
            }
        }
        descriptor::lookup(table, kind, index, language).map(|bytes| (bytes, false))
    }

    /// The configuration that matches the negotiated speed.
    fn configuration(&self, value: u8) -> Option<&'static [u8]> {
        use descriptor::{find_configuration, CONFIGURATION, OTHER_SPEED_CONFIGURATION};

        let table = self.descriptors();
        if self.speed() == device::Speed::Full {
            if let Some(bytes) = find_configuration(table, OTHER_SPEED_CONFIGURATION, value) {
                return Some(bytes);
            }
        }
        find_configuration(table, CONFIGURATION, value)
    }
}
