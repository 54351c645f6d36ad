//! Driver errors

use core::fmt;

use crate::td::Status;

/// A transfer finished with an error status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransferError {
    /// USB controller, 1 or 2.
    pub controller: u8,
    /// Hardware endpoint, `2 * logical + direction`.
    pub he: u8,
    /// Descriptor status when the transfer completed.
    pub status: Status,
}

impl TransferError {
    /// The transfer was force-completed by a bus reset.
    ///
    /// The data isn't corrupt. Wait for the host to configure the
    /// device again, and retry.
    pub fn is_bus_reset(&self) -> bool {
        self.status == Status::ACTIVE
    }

    /// Logical endpoint.
    pub fn le(&self) -> u8 {
        self.he >> 1
    }

    /// `true` for IN (device to host) endpoints.
    pub fn is_in(&self) -> bool {
        self.he & 1 != 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// Controller number isn't 1 or 2.
    InvalidController(u8),
    /// The descriptor pool already backs a device.
    PoolTaken,
    /// The device isn't configured, so nothing was submitted.
    ///
    /// Also returned when the host changed the configuration while we
    /// were priming. In that case, the descriptors are queued, and the
    /// bus reset that follows completes them.
    NotReady,
    /// The controller reported a transfer error.
    Transfer(TransferError),
}

impl Error {
    /// `true` when the caller should wait for a configuration, then retry.
    pub fn is_not_ready(&self) -> bool {
        match self {
            Error::NotReady => true,
            Error::Transfer(err) => err.is_bus_reset(),
            _ => false,
        }
    }
}

impl From<TransferError> for Error {
    fn from(err: TransferError) -> Self {
        Error::Transfer(err)
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = if self.is_in() { "in" } else { "out" };
        write!(
            f,
            "USB{}: endpoint {} {}: status {:#04x}",
            self.controller,
            self.le(),
            dir,
            self.status.bits()
        )?;
        if self.is_bus_reset() {
            f.write_str(" (bus reset)")?;
        }
        Ok(())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidController(n) => write!(f, "invalid USB controller {n}"),
            Error::PoolTaken => f.write_str("descriptor pool already taken"),
            Error::NotReady => f.write_str("USB device not configured"),
            Error::Transfer(err) => err.fmt(f),
        }
    }
}

#[cfg(feature = "defmt-03")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        match self {
            Error::InvalidController(n) => defmt::write!(f, "InvalidController({=u8})", n),
            Error::PoolTaken => defmt::write!(f, "PoolTaken"),
            Error::NotReady => defmt::write!(f, "NotReady"),
            Error::Transfer(err) => defmt::write!(
                f,
                "Transfer(USB{=u8} he {=u8} status {=u32:#x})",
                err.controller,
                err.he,
                err.status.bits()
            ),
        }
    }
}

pub type Result<T> = core::result::Result<T, Error>;
