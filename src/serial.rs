//! A CDC-ACM serial port
//!
//! [`Serial`] turns a pair of bulk endpoints into a byte stream. It
//! answers the CDC-ACM class requests of its communication interface,
//! so the host sees a serial port.
//!
//! The USB protocol is packet oriented. Reads return at most one packet;
//! a short buffer drains a packet over several reads. Writes keep up to
//! two descriptors in flight. Call [`flush`](Serial::flush) to wait for
//! the last one, or enable [auto flush](Serial::set_auto_flush).
//!
//! # Example
//!
//! ```no_run
//! use imxrt_dcd::{serial::{Serial, SerialMemory}, Device, Timeout};
//!
//! static MEMORY: SerialMemory<512> = SerialMemory::new();
//!
//! fn echo(device: &'static Device) -> imxrt_dcd::Result<()> {
//!     let mut serial = Serial::new(device, 0, 2, 2, &MEMORY)?;
//!     let mut buffer = [0; 64];
//!     loop {
//!         device.wait_config(1, Timeout::Forever);
//!         match serial.read(&mut buffer).and_then(|n| serial.write(&buffer[..n])) {
//!             Err(err) if err.is_not_ready() => continue,
//!             result => result?,
//!         };
//!         serial.flush()?;
//!     }
//! }
//! ```

#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

pub mod descriptors;

use core::{
    cell::UnsafeCell,
    fmt, ptr,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
};

use usb_device::{
    control::{Recipient, RequestType},
    UsbDirection,
};

use crate::{
    cache,
    control::{ControlHandler, ControlRequest, RequestKey},
    device::{self, Device},
    error::{Error, Result},
    signal::Signal,
    td::{Dtd, Ownership},
    time::Timeout,
};

/// Size of one transmit scratch buffer.
const TX_SCRATCH: usize = 2 * cache::LINESIZE;

/// Descriptor (and signal) index of the read.
const READ: usize = 2;

const SET_LINE_CODING: u8 = 0x20;
const GET_LINE_CODING: u8 = 0x21;
const SET_CONTROL_LINE_STATE: u8 = 0x22;

const fn class_request(direction: UsbDirection, request: u8) -> RequestKey {
    RequestKey::new(direction, RequestType::Class, Recipient::Interface, request)
}

/// Line coding that the host selected with SET_LINE_CODING.
///
/// The data are informational; the USB link doesn't care.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineCoding {
    pub baud: u32,
    /// 0: 1 stop bit, 1: 1.5 stop bits, 2: 2 stop bits.
    pub stop_bits: u8,
    /// 0: none, 1: odd, 2: even, 3: mark, 4: space.
    pub parity: u8,
    pub data_bits: u8,
}

impl LineCoding {
    fn from_bytes(bytes: &[u8; 7]) -> Self {
        LineCoding {
            baud: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            stop_bits: bytes[4],
            parity: bytes[5],
            data_bits: bytes[6],
        }
    }

    fn to_bytes(self) -> [u8; 7] {
        let [b0, b1, b2, b3] = self.baud.to_le_bytes();
        [b0, b1, b2, b3, self.stop_bits, self.parity, self.data_bits]
    }
}

/// 115200 8N1
impl Default for LineCoding {
    fn default() -> Self {
        LineCoding {
            baud: 115_200,
            stop_bits: 0,
            parity: 0,
            data_bits: 8,
        }
    }
}

/// What the host told us about the line.
struct LineState {
    baud: AtomicU32,
    /// stop bits, parity, and data bits, from low to high byte.
    format: AtomicU32,
    /// DTR (bit 0), RTS (bit 1).
    control: AtomicU8,
}

impl LineState {
    const fn new() -> Self {
        LineState {
            baud: AtomicU32::new(115_200),
            format: AtomicU32::new(8 << 16),
            control: AtomicU8::new(0),
        }
    }

    fn coding(&self) -> LineCoding {
        let format = self.format.load(Ordering::Acquire);
        LineCoding {
            baud: self.baud.load(Ordering::Acquire),
            stop_bits: format as u8,
            parity: (format >> 8) as u8,
            data_bits: (format >> 16) as u8,
        }
    }

    fn set_coding(&self, coding: LineCoding) {
        self.baud.store(coding.baud, Ordering::Release);
        self.format.store(
            coding.stop_bits as u32 | (coding.parity as u32) << 8 | (coding.data_bits as u32) << 16,
            Ordering::Release,
        );
    }
}

/// The class requests that a serial port answers, in `previous` order.
const REQUESTS: [u8; 3] = [SET_LINE_CODING, GET_LINE_CODING, SET_CONTROL_LINE_STATE];

#[repr(C, align(32))]
struct Scratch<const N: usize>(UnsafeCell<[u8; N]>);

impl<const N: usize> Scratch<N> {
    const fn new() -> Self {
        Scratch(UnsafeCell::new([0; N]))
    }
    fn as_ptr(&self) -> *mut u8 {
        self.0.get().cast()
    }
}

/// Static memory for one serial port.
///
/// `PKT` is the max packet size of the receive endpoint, or a multiple of
/// it; use 512 for high speed. It must be a power of two. Place the
/// memory where the USB DMA engine can reach it; prefer DTCM.
///
/// ```
/// use imxrt_dcd::serial::SerialMemory;
///
/// static MEMORY: SerialMemory<512> = SerialMemory::new();
/// ```
pub struct SerialMemory<const PKT: usize> {
    rx: Scratch<PKT>,
    tx: [Scratch<TX_SCRATCH>; 2],
    /// Two for writes, one for reads.
    dtds: [Dtd; 3],
    signals: [Signal; 3],
    line: LineState,
    /// Communication interface; requests for others go to `previous`.
    interface: AtomicU8,
    /// Handlers that were registered before us, by request.
    previous: UnsafeCell<[Option<&'static dyn ControlHandler>; 3]>,
    taken: AtomicBool,
}

// Safety: scratch buffers are owned by the one Serial that took the
// memory, and they're only shared with the DMA engine. `previous` is
// written once, before the memory is registered as a handler.
unsafe impl<const PKT: usize> Sync for SerialMemory<PKT> {}

impl<const PKT: usize> SerialMemory<PKT> {
    pub const fn new() -> Self {
        const TX: Scratch<TX_SCRATCH> = Scratch::new();
        SerialMemory {
            rx: Scratch::new(),
            tx: [TX; 2],
            dtds: [Dtd::new(), Dtd::new(), Dtd::new()],
            signals: [Signal::new(), Signal::new(), Signal::new()],
            line: LineState::new(),
            interface: AtomicU8::new(0),
            previous: UnsafeCell::new([None; 3]),
            taken: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub(crate) fn dtds(&'static self) -> &'static [Dtd] {
        &self.dtds
    }

    #[cfg(test)]
    pub(crate) fn rx_ptr(&self) -> *mut u8 {
        self.rx.as_ptr()
    }
}

impl<const PKT: usize> Default for SerialMemory<PKT> {
    fn default() -> Self {
        Self::new()
    }
}

/// CDC-ACM requests of one communication interface.
impl<const PKT: usize> ControlHandler for SerialMemory<PKT> {
    fn handle(&self, request: &mut ControlRequest<'_>) -> Option<usize> {
        if request.index as u8 != self.interface.load(Ordering::Acquire) {
            let idx = REQUESTS.iter().position(|&r| r == request.request)?;
            // Safety: previous doesn't change after registration.
            let previous = unsafe { (*self.previous.get())[idx] };
            return previous?.handle(request);
        }
        let line = &self.line;
        match request.request {
            SET_LINE_CODING => {
                let bytes: &[u8; 7] = request.data.get(..7)?.try_into().ok()?;
                line.set_coding(LineCoding::from_bytes(bytes));
                Some(0)
            }
            GET_LINE_CODING => {
                let bytes = line.coding().to_bytes();
                let n = request.data.len().min(bytes.len());
                request.data[..n].copy_from_slice(&bytes[..n]);
                Some(n)
            }
            SET_CONTROL_LINE_STATE => {
                line.control.store(request.value as u8 & 0b11, Ordering::Release);
                Some(0)
            }
            _ => None,
        }
    }
}

/// A CDC-ACM serial port.
pub struct Serial<const PKT: usize> {
    device: &'static Device,
    memory: &'static SerialMemory<PKT>,
    /// Hardware endpoints.
    rx: usize,
    tx: usize,
    /// Rolling write index. Bit 0 selects the next write descriptor;
    /// non-zero means the other descriptor may be in flight.
    wn: u8,
    /// Received scratch bytes, and how many were read.
    rn: usize,
    ri: usize,
    auto_flush: bool,
    write_sink: bool,
}

impl<const PKT: usize> Serial<PKT> {
    /// Create a serial port on communication interface `comm_interface`,
    /// receiving on logical endpoint `rx_le` and sending on `tx_le`.
    ///
    /// Registers the CDC-ACM class requests with `device`. Ports on other
    /// interfaces of the same device keep answering their own requests.
    /// Returns [`Error::PoolTaken`] if `memory` backs another port.
    ///
    /// # Panics
    ///
    /// Panics if `PKT` isn't a power of two, or if the device's handler
    /// table is full.
    pub fn new(
        device: &'static Device,
        comm_interface: u8,
        rx_le: usize,
        tx_le: usize,
        memory: &'static SerialMemory<PKT>,
    ) -> Result<Self> {
        assert!(PKT.is_power_of_two(), "Packet size must be a power of two");
        if memory.taken.swap(true, Ordering::SeqCst) {
            return Err(Error::PoolTaken);
        }

        memory.interface.store(comm_interface, Ordering::Release);
        for (idx, request) in REQUESTS.into_iter().enumerate() {
            let direction = if request == GET_LINE_CODING {
                UsbDirection::In
            } else {
                UsbDirection::Out
            };
            let key = class_request(direction, request);
            // Safety: we took the memory, and it isn't registered yet.
            unsafe { (*memory.previous.get())[idx] = device.handler(key) };
            device.handle(key, memory);
        }

        Ok(Serial {
            device,
            memory,
            rx: device::he(rx_le, UsbDirection::Out),
            tx: device::he(tx_le, UsbDirection::In),
            wn: 0,
            rn: 0,
            ri: 0,
            auto_flush: false,
            write_sink: false,
        })
    }

    /// Wait for the controller to release descriptor `idx`.
    ///
    /// A descriptor stays with the controller after a failed prime,
    /// until the next bus reset.
    fn settle(&self, idx: usize) {
        if self.memory.dtds[idx].ownership() == Ownership::ActiveHardware {
            self.memory.signals[idx].sleep(Timeout::Forever);
        }
    }

    /// Prime descriptor `idx` for `len` bytes at `ptr`. Returns the
    /// number of bytes that the descriptor covers.
    ///
    /// If the prime fails, waits until the controller is done with the
    /// buffer.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `len` bytes until the descriptor's signal
    /// fires.
    unsafe fn submit(&self, he: usize, idx: usize, ptr: *const u8, len: usize) -> Result<usize> {
        let dtd = &self.memory.dtds[idx];
        let signal = &self.memory.signals[idx];
        self.settle(idx);
        signal.clear();
        dtd.set_signal(Some(signal));
        let n = dtd.setup_transfer(ptr, len);
        if let Err(err) = self.device.prime(he, dtd, dtd) {
            self.settle(idx);
            return Err(err);
        }
        Ok(n)
    }

    /// Wait for descriptor `idx`, and return the number of bytes it
    /// didn't transfer.
    fn complete(&self, he: usize, idx: usize) -> Result<usize> {
        self.memory.signals[idx].sleep(Timeout::Forever);
        self.device.transfer_status(he, &self.memory.dtds[idx])
    }

    /// Read at most one packet into `buffer`.
    ///
    /// Blocks until the host sends a packet, unless there are bytes left
    /// from the previous packet. If `buffer` is cache-line aligned and
    /// holds at least one packet, the controller writes straight into it.
    pub fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }
        let scratch = self.memory.rx.as_ptr();
        if self.ri != self.rn {
            let n = buffer.len().min(self.rn - self.ri);
            // Safety: the read descriptor is done with the scratch buffer.
            unsafe { ptr::copy_nonoverlapping(scratch.add(self.ri), buffer.as_mut_ptr(), n) };
            self.ri += n;
            return Ok(n);
        }

        let direct = buffer.len() & !(PKT - 1);
        let (ptr, len) = if direct != 0 && cache::is_aligned(buffer.as_ptr()) {
            (buffer.as_mut_ptr(), direct)
        } else {
            (scratch, PKT)
        };
        cache::invalidate(ptr, len);
        // Safety: ptr is the user's buffer, or scratch. We wait for the
        // transfer, even when it fails.
        let n = unsafe { self.submit(self.rx, READ, ptr, len)? };
        let remaining = self.complete(self.rx, READ)?;
        cache::invalidate(ptr, len);
        let received = n.saturating_sub(remaining);
        if ptr == scratch {
            self.rn = received;
            let n = buffer.len().min(received);
            // Safety: the controller is done with scratch.
            unsafe { ptr::copy_nonoverlapping(scratch, buffer.as_mut_ptr(), n) };
            self.ri = n;
            Ok(n)
        } else {
            Ok(received)
        }
    }

    /// Send `bytes` through a scratch buffer (`direct == false`) or
    /// straight from memory.
    fn send(&mut self, bytes: &[u8], direct: bool) -> Result<()> {
        let mut sent = 0;
        while sent < bytes.len() {
            let idx = (self.wn & 1) as usize;
            let rest = &bytes[sent..];
            let ptr = if direct {
                rest.as_ptr()
            } else {
                self.settle(idx);
                let scratch = self.memory.tx[idx].as_ptr();
                let len = rest.len().min(TX_SCRATCH);
                // Safety: the slot's descriptor is done with its scratch.
                unsafe { ptr::copy_nonoverlapping(rest.as_ptr(), scratch, len) };
                cache::flush(scratch, len);
                scratch as *const u8
            };
            let len = if direct { rest.len() } else { rest.len().min(TX_SCRATCH) };
            // Safety: scratch is static. Direct data outlives the write; the
            // write waits for the last direct descriptor.
            let n = match unsafe { self.submit(self.tx, idx, ptr, len) } {
                Ok(n) => n,
                Err(err) => return Err(self.abort(err)),
            };
            if self.wn != 0 {
                let prev = (self.wn.wrapping_sub(1) & 1) as usize;
                if let Err(err) = self.complete(self.tx, prev) {
                    return Err(self.abort(err));
                }
            }
            self.wn = 2 | (self.wn.wrapping_add(1) & 1);
            sent += n;
        }
        Ok(())
    }

    /// Wait for every write descriptor, and forget them.
    fn abort(&mut self, err: Error) -> Error {
        self.settle(0);
        self.settle(1);
        self.wn = 0;
        err
    }

    /// Write all of `data`.
    ///
    /// Returns before the host has the last bytes, unless auto flush is
    /// on. In write sink mode, silently drops the data while nobody
    /// listens.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.write_sink && (self.device.config() == 0 || !self.dtr()) {
            return Ok(data.len());
        }

        // Unaligned head, cache-aligned middle, unaligned tail. Small
        // writes go through scratch entirely.
        let (mut head, mut middle, mut tail) = (data.len(), 0, 0);
        if head > TX_SCRATCH {
            const ALIGN: usize = cache::LINESIZE - 1;
            head = cache::LINESIZE.wrapping_sub(data.as_ptr() as usize) & ALIGN;
            middle = data.len() - head;
            tail = middle & ALIGN;
            middle -= tail;
            cache::flush(data[head..].as_ptr(), middle);
        }

        if head != 0 {
            self.send(&data[..head], false)?;
        }
        if middle != 0 {
            self.send(&data[head..head + middle], true)?;
        }
        if tail != 0 {
            self.send(&data[head + middle..], false)?;
        }

        // The controller may still read the middle from data.
        if self.auto_flush || (middle != 0 && tail == 0) {
            self.flush()?;
        }
        Ok(data.len())
    }

    /// Wait until the host has everything that was written.
    pub fn flush(&mut self) -> Result<()> {
        if self.wn == 0 {
            return Ok(());
        }
        let last = (self.wn.wrapping_sub(1) & 1) as usize;
        self.wn = 0;
        self.complete(self.tx, last).map(|_| ())
    }

    /// Flush at the end of every write.
    pub fn set_auto_flush(&mut self, auto_flush: bool) {
        self.auto_flush = auto_flush;
    }

    /// Drop writes while the device isn't configured, or the host hasn't
    /// raised DTR.
    ///
    /// Use this for logs that nobody may read.
    pub fn set_write_sink(&mut self, write_sink: bool) {
        self.write_sink = write_sink;
    }

    pub fn line_coding(&self) -> LineCoding {
        self.memory.line.coding()
    }

    /// Data terminal ready; the host opened the port.
    pub fn dtr(&self) -> bool {
        self.memory.line.control.load(Ordering::Acquire) & 1 != 0
    }

    /// Request to send.
    pub fn rts(&self) -> bool {
        self.memory.line.control.load(Ordering::Acquire) & 2 != 0
    }
}

impl<const PKT: usize> fmt::Write for Serial<PKT> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write(s.as_bytes()).map(|_| ()).map_err(|_| fmt::Error)
    }
}
