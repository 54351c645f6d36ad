//! USB descriptors
//!
//! The device answers GET_DESCRIPTOR from a table of [`Descriptor`]s.
//! Keep the high-speed configuration under `CONFIGURATION`, and the
//! full-speed configuration under [`OTHER_SPEED_CONFIGURATION`]. The
//! driver swaps them when it runs at full speed.
//!
//! The `const` builders in this module produce the byte layouts of the
//! common descriptors, so that tables can live in flash.

use usb_device::{descriptor::descriptor_type, endpoint::EndpointAddress};

pub use usb_device::descriptor::descriptor_type::{CONFIGURATION, DEVICE, ENDPOINT, INTERFACE, STRING};

/// Descriptor type of the device qualifier.
pub const DEVICE_QUALIFIER: u8 = 6;
/// Descriptor type of the other speed configuration.
pub const OTHER_SPEED_CONFIGURATION: u8 = 7;
/// Descriptor type of the interface association descriptor.
pub const INTERFACE_ASSOCIATION: u8 = descriptor_type::IAD;

/// An entry of the descriptor table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Descriptor {
    /// Descriptor type, the high byte of wValue.
    pub kind: u8,
    /// Descriptor index, the low byte of wValue.
    pub index: u8,
    /// Language ID (wIndex); zero for everything but strings.
    pub language: u16,
    pub bytes: &'static [u8],
}

impl Descriptor {
    pub const fn new(kind: u8, index: u8, language: u16, bytes: &'static [u8]) -> Self {
        Descriptor {
            kind,
            index,
            language,
            bytes,
        }
    }

    /// The bConfigurationValue of a configuration descriptor.
    pub fn configuration_value(&self) -> Option<u8> {
        matches!(self.kind, CONFIGURATION | OTHER_SPEED_CONFIGURATION)
            .then(|| self.bytes.get(5).copied())
            .flatten()
    }
}

/// Find the descriptor for a GET_DESCRIPTOR request.
pub fn lookup(table: &[Descriptor], kind: u8, index: u8, language: u16) -> Option<&'static [u8]> {
    table
        .iter()
        .find(|d| d.kind == kind && d.index == index && d.language == language)
        .map(|d| d.bytes)
}

/// Find the configuration (or other speed configuration) whose
/// bConfigurationValue is `value`.
pub fn find_configuration(table: &[Descriptor], kind: u8, value: u8) -> Option<&'static [u8]> {
    table
        .iter()
        .filter(|d| d.kind == kind)
        .find(|d| d.configuration_value() == Some(value))
        .map(|d| d.bytes)
}

/// An endpoint, as described in a configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: EndpointAddress,
    /// Transfer type, bits 0..2 of bmAttributes.
    pub transfer_type: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

/// Walks the endpoint descriptors of a configuration descriptor.
///
/// Stops at the first descriptor that's shorter than two bytes, or that
/// runs past the end of the configuration.
pub struct EndpointDescriptors<'a> {
    bytes: &'a [u8],
}

impl<'a> EndpointDescriptors<'a> {
    pub fn new(configuration: &'a [u8]) -> Self {
        EndpointDescriptors {
            bytes: configuration,
        }
    }
}

impl Iterator for EndpointDescriptors<'_> {
    type Item = EndpointDescriptor;

    fn next(&mut self) -> Option<EndpointDescriptor> {
        loop {
            let len = *self.bytes.first()? as usize;
            if len < 2 || len > self.bytes.len() {
                self.bytes = &[];
                return None;
            }
            let (desc, rest) = self.bytes.split_at(len);
            self.bytes = rest;
            if desc[1] == ENDPOINT && len >= 7 {
                return Some(EndpointDescriptor {
                    address: EndpointAddress::from(desc[2]),
                    transfer_type: desc[3] & 0b11,
                    max_packet_size: u16::from_le_bytes([desc[4], desc[5]]) & 0x7FF,
                    interval: desc[6],
                });
            }
        }
    }
}

/// Fields of a device descriptor.
///
/// ```
/// use imxrt_dcd::descriptor::DeviceDescriptor;
///
/// const DEVICE: DeviceDescriptor = DeviceDescriptor {
///     vendor_id: 0x1209,
///     product_id: 0x0001,
///     ..DeviceDescriptor::MISC_IAD
/// };
/// const BYTES: [u8; 18] = DEVICE.bytes();
/// const QUALIFIER: [u8; 10] = DEVICE.qualifier();
///
/// assert_eq!(BYTES[0], 18);
/// assert_eq!(BYTES[4], 0xEF);
/// assert_eq!(QUALIFIER[1], 6);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice.
    pub release: u16,
    pub manufacturer: u8,
    pub product: u8,
    pub serial_number: u8,
    pub configurations: u8,
}

impl DeviceDescriptor {
    /// A composite device built from interface associations, like
    /// CDC-ACM functions.
    pub const MISC_IAD: Self = DeviceDescriptor {
        class: 0xEF,
        subclass: 0x02,
        protocol: 0x01,
        vendor_id: 0,
        product_id: 0,
        release: 0x0100,
        manufacturer: 1,
        product: 2,
        serial_number: 3,
        configurations: 1,
    };

    /// USB 2.0 device descriptor.
    pub const fn bytes(&self) -> [u8; 18] {
        let [vid_lo, vid_hi] = self.vendor_id.to_le_bytes();
        let [pid_lo, pid_hi] = self.product_id.to_le_bytes();
        let [rel_lo, rel_hi] = self.release.to_le_bytes();
        [
            18,
            DEVICE,
            0x00,
            0x02,
            self.class,
            self.subclass,
            self.protocol,
            CONTROL_MAX_PACKET,
            vid_lo,
            vid_hi,
            pid_lo,
            pid_hi,
            rel_lo,
            rel_hi,
            self.manufacturer,
            self.product,
            self.serial_number,
            self.configurations,
        ]
    }

    /// Device qualifier, describing the device at the other speed.
    pub const fn qualifier(&self) -> [u8; 10] {
        [
            10,
            DEVICE_QUALIFIER,
            0x00,
            0x02,
            self.class,
            self.subclass,
            self.protocol,
            CONTROL_MAX_PACKET,
            self.configurations,
            0,
        ]
    }
}

/// Max packet size of the control endpoints.
pub const CONTROL_MAX_PACKET: u8 = 64;

/// String descriptor zero, announcing US English.
pub const LANGUAGES_EN_US: [u8; 4] = [4, STRING, 0x09, 0x04];

/// The US English language ID.
pub const EN_US: u16 = 0x0409;

/// Encode an ASCII string as a string descriptor.
///
/// `N` must be `2 + 2 * s.len()`; otherwise, this fails to compile when
/// evaluated in a `const`.
///
/// ```
/// use imxrt_dcd::descriptor::string_descriptor;
///
/// const PRODUCT: [u8; 8] = string_descriptor("USB");
/// assert_eq!(PRODUCT, [8, 3, b'U', 0, b'S', 0, b'B', 0]);
/// ```
pub const fn string_descriptor<const N: usize>(s: &str) -> [u8; N] {
    let s = s.as_bytes();
    assert!(N == 2 + 2 * s.len(), "wrong string descriptor length");
    assert!(N <= 255, "string too long");
    let mut out = [0; N];
    out[0] = N as u8;
    out[1] = STRING;
    let mut i = 0;
    while i < s.len() {
        assert!(s[i] < 0x80, "only ASCII is supported");
        out[2 + 2 * i] = s[i];
        i += 1;
    }
    out
}
