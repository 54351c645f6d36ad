//! Configuration descriptors for a CDC-ACM function
//!
//! [`configuration`] builds the whole configuration of a device with one
//! CDC-ACM function, in a `const` context. Build one for each speed:
//!
//! ```
//! use imxrt_dcd::{
//!     descriptor::{Descriptor, CONFIGURATION, OTHER_SPEED_CONFIGURATION},
//!     serial::descriptors::{configuration, AcmFunction, CONFIGURATION_LEN},
//!     Speed,
//! };
//!
//! const ACM: AcmFunction = AcmFunction::new(0);
//! static HIGH_SPEED: [u8; CONFIGURATION_LEN] =
//!     configuration(CONFIGURATION, 1, &ACM, Speed::High);
//! static FULL_SPEED: [u8; CONFIGURATION_LEN] =
//!     configuration(OTHER_SPEED_CONFIGURATION, 1, &ACM, Speed::Full);
//!
//! static TABLE: [Descriptor; 2] = [
//!     Descriptor::new(CONFIGURATION, 0, 0, &HIGH_SPEED),
//!     Descriptor::new(OTHER_SPEED_CONFIGURATION, 0, 0, &FULL_SPEED),
//! ];
//! # assert_eq!(HIGH_SPEED[2], 75);
//! ```

use crate::{
    descriptor::{ENDPOINT, INTERFACE, INTERFACE_ASSOCIATION},
    device::Speed,
};

/// Size of the configuration from [`configuration`].
pub const CONFIGURATION_LEN: usize = 75;

/// Max packet size of the notification endpoint.
pub const NOTIFY_PACKET: u16 = 16;

const CS_INTERFACE: u8 = 0x24;
const CDC_CLASS: u8 = 0x02;
const ACM_SUBCLASS: u8 = 0x02;
const AT_PROTOCOL: u8 = 0x01;
const DATA_CLASS: u8 = 0x0A;

const BULK: u8 = 0x02;
const INTERRUPT: u8 = 0x03;

/// Interfaces and endpoints of a CDC-ACM function.
///
/// The data interface is `comm_interface + 1`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcmFunction {
    /// Communication (control) interface number.
    pub comm_interface: u8,
    /// Logical endpoint of the notification (interrupt IN) endpoint.
    pub notify_le: u8,
    /// Logical endpoint that receives data from the host (bulk OUT).
    pub rx_le: u8,
    /// Logical endpoint that sends data to the host (bulk IN).
    pub tx_le: u8,
    /// String index of the function name, or zero.
    pub function_string: u8,
}

impl AcmFunction {
    /// Notifications on endpoint 1, data on endpoint 2.
    pub const fn new(comm_interface: u8) -> Self {
        AcmFunction {
            comm_interface,
            notify_le: 1,
            rx_le: 2,
            tx_le: 2,
            function_string: 0,
        }
    }
}

/// A configuration with one CDC-ACM function.
///
/// `kind` is [`CONFIGURATION`](crate::descriptor::CONFIGURATION) or
/// [`OTHER_SPEED_CONFIGURATION`](crate::descriptor::OTHER_SPEED_CONFIGURATION),
/// and `value` is bConfigurationValue. `speed` selects the packet sizes
/// and polling interval.
pub const fn configuration(
    kind: u8,
    value: u8,
    function: &AcmFunction,
    speed: Speed,
) -> [u8; CONFIGURATION_LEN] {
    let ci = function.comm_interface;
    let di = ci + 1;
    let [data_lo, data_hi] = match speed {
        Speed::High => 512u16,
        Speed::Full => 64u16,
    }
    .to_le_bytes();
    let interval = match speed {
        Speed::High => 5,
        Speed::Full => 16,
    };
    let [notify_lo, notify_hi] = NOTIFY_PACKET.to_le_bytes();
    [
        // Configuration
        9,
        kind,
        CONFIGURATION_LEN as u8,
        0,
        2,
        value,
        0,
        0xC0,
        50,
        // Interface association
        8,
        INTERFACE_ASSOCIATION,
        ci,
        2,
        CDC_CLASS,
        ACM_SUBCLASS,
        AT_PROTOCOL,
        function.function_string,
        // Communication interface
        9,
        INTERFACE,
        ci,
        0,
        1,
        CDC_CLASS,
        ACM_SUBCLASS,
        AT_PROTOCOL,
        0,
        // Header, CDC 1.10
        5,
        CS_INTERFACE,
        0x00,
        0x10,
        0x01,
        // Call management
        5,
        CS_INTERFACE,
        0x01,
        0x01,
        di,
        // Abstract control management: line coding and serial state
        4,
        CS_INTERFACE,
        0x02,
        0x06,
        // Union
        5,
        CS_INTERFACE,
        0x06,
        ci,
        di,
        // Notifications
        7,
        ENDPOINT,
        0x80 | function.notify_le,
        INTERRUPT,
        notify_lo,
        notify_hi,
        interval,
        // Data interface
        9,
        INTERFACE,
        di,
        0,
        2,
        DATA_CLASS,
        0,
        0,
        0,
        // Bulk IN
        7,
        ENDPOINT,
        0x80 | function.tx_le,
        BULK,
        data_lo,
        data_hi,
        0,
        // Bulk OUT
        7,
        ENDPOINT,
        function.rx_le,
        BULK,
        data_lo,
        data_hi,
        0,
    ]
}
