//! A RAL-like module for the USB core and USB PHY registers
//!
//! The DCD only needs two register blocks, so we describe them here
//! instead of depending on a chip-specific RAL. The field modules follow
//! the RAL conventions (`offset`, `mask`, `R`, `W`, `RW`), so the
//! `ral-registers` macros work on these blocks, and on the in-memory
//! hardware structures in `qh` and `td`.
//!
//! The endpoint control registers are represented as an array, which the
//! SVD-generated RALs can't do.

#![allow(non_snake_case, non_upper_case_globals)]

pub use ral_registers::{modify_reg, read_reg, write_reg};

/// Defines a RAL-compatible field module.
macro_rules! field {
    ($name:ident, $offset:expr, $width:expr) => {
        pub mod $name {
            pub const offset: u32 = $offset;
            pub const mask: u32 = (((1u64 << $width) - 1) as u32) << offset;
            pub mod R {}
            pub mod W {}
            pub mod RW {}
        }
    };
}

/// A pointer to a register block.
///
/// Similar to the RAL's `Instance` type, but it's `Copy`, and it
/// doesn't care about the address.
pub struct Instance<T>(*const T);

impl<T> Instance<T> {
    /// # Safety
    ///
    /// `ptr` must point to a `T` that lives forever.
    pub const unsafe fn new(ptr: *const ()) -> Self {
        Instance(ptr.cast())
    }
    pub fn addr(&self) -> usize {
        self.0 as usize
    }
}

impl<T> core::ops::Deref for Instance<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        // Safety: pointer points to static memory (peripheral memory)
        unsafe { &*self.0 }
    }
}

impl<T> Clone for Instance<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Instance<T> {}

#[cfg(not(test))]
mod reg {
    pub type Rw = ral_registers::RWRegister<u32>;
    pub type Ro = ral_registers::RORegister<u32>;
    /// Write one to clear.
    pub type W1c = ral_registers::RWRegister<u32>;
    /// Set by software, cleared by hardware.
    pub type Strobe = ral_registers::RWRegister<u32>;
    pub type Prime = ral_registers::RWRegister<u32>;
    pub type Cmd = ral_registers::RWRegister<u32>;
}

#[cfg(test)]
mod reg {
    pub use super::sim::{Cmd, Plain as Rw, Plain as Ro, Prime, Strobe, W1c};
}

/// The bit for hardware endpoint `he` in ENDPTPRIME, ENDPTFLUSH,
/// ENDPTSTAT, and ENDPTCOMPLETE.
///
/// Receive (OUT) endpoints are in the low half, transmit (IN) in the high half.
pub const fn endpoint_mask(he: usize) -> u32 {
    1 << ((he & 1) * 16 + (he >> 1))
}

/// The hardware endpoint for bit `bit` of an endpoint bitmask.
pub const fn endpoint_of_bit(bit: u32) -> usize {
    ((bit as usize & 15) << 1) | (bit as usize >> 4)
}

pub mod usb {
    use super::reg::{Cmd, Prime, Ro, Rw, Strobe, W1c};

    #[repr(C)]
    #[cfg_attr(test, derive(Default))]
    pub struct RegisterBlock {
        pub ID: Ro,
        pub HWGENERAL: Ro,
        pub HWHOST: Ro,
        pub HWDEVICE: Ro,
        pub HWTXBUF: Ro,
        pub HWRXBUF: Ro,
        _reserved0: [u32; 26],
        pub GPTIMER0LD: Rw,
        pub GPTIMER0CTRL: Rw,
        pub GPTIMER1LD: Rw,
        pub GPTIMER1CTRL: Rw,
        pub SBUSCFG: Rw,
        _reserved1: [u32; 27],
        pub CAPLENGTH: Ro,
        pub HCSPARAMS: Ro,
        pub HCCPARAMS: Ro,
        _reserved2: [u32; 5],
        pub DCIVERSION: Ro,
        pub DCCPARAMS: Ro,
        _reserved3: [u32; 6],
        pub USBCMD: Cmd,
        pub USBSTS: W1c,
        pub USBINTR: Rw,
        pub FRINDEX: Rw,
        _reserved4: [u32; 1],
        pub DEVICEADDR: Rw,
        pub ENDPTLISTADDR: Rw,
        _reserved5: [u32; 1],
        pub BURSTSIZE: Rw,
        pub TXFILLTUNING: Rw,
        _reserved6: [u32; 4],
        pub ENDPTNAK: W1c,
        pub ENDPTNAKEN: Rw,
        pub CONFIGFLAG: Ro,
        pub PORTSC1: Rw,
        _reserved7: [u32; 7],
        pub OTGSC: Rw,
        pub USBMODE: Rw,
        pub ENDPTSETUPSTAT: W1c,
        pub ENDPTPRIME: Prime,
        pub ENDPTFLUSH: Strobe,
        pub ENDPTSTAT: Ro,
        pub ENDPTCOMPLETE: W1c,
        pub ENDPTCTRL: [Rw; 16],
    }

    #[cfg(not(test))]
    const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x200) as usize];

    pub mod DCCPARAMS {
        field!(DEN, 0, 5);
        field!(DC, 7, 1);
    }

    pub mod USBCMD {
        field!(RS, 0, 1);
        field!(RST, 1, 1);
        field!(SUTW, 13, 1);
        field!(ATDTW, 14, 1);
        field!(ITC, 16, 8);
    }

    pub mod USBSTS {
        field!(UI, 0, 1);
        field!(UEI, 1, 1);
        field!(PCI, 2, 1);
        field!(URI, 6, 1);
        field!(SRI, 7, 1);
        field!(SLI, 8, 1);
    }

    pub mod USBINTR {
        field!(UE, 0, 1);
        field!(UEE, 1, 1);
        field!(PCE, 2, 1);
        field!(URE, 6, 1);
        field!(SRE, 7, 1);
        field!(SLE, 8, 1);
    }

    pub mod DEVICEADDR {
        field!(USBADRA, 24, 1);
        field!(USBADR, 25, 7);
    }

    pub mod PORTSC1 {
        field!(PR, 8, 1);
        field!(PFSC, 24, 1);
        field!(PSPD, 26, 2);
    }

    pub mod USBMODE {
        field!(CM, 0, 2);
        field!(SLOM, 3, 1);
    }

    /// Device controller mode
    pub const CM_DEVICE: u32 = 0b10;

    pub mod ENDPTCTRL {
        field!(RXS, 0, 1);
        field!(RXT, 2, 2);
        field!(RXR, 6, 1);
        field!(RXE, 7, 1);
        field!(TXS, 16, 1);
        field!(TXT, 18, 2);
        field!(TXR, 22, 1);
        field!(TXE, 23, 1);
    }

    /// The RAL macros want a named register. This gives them one for
    /// an element of the ENDPTCTRL array.
    pub struct EndptCtrl<'a> {
        pub ENDPTCTRL: &'a super::reg::Rw,
    }

    pub fn endptctrl(usb: &RegisterBlock, le: usize) -> EndptCtrl<'_> {
        EndptCtrl {
            ENDPTCTRL: &usb.ENDPTCTRL[le],
        }
    }
}

pub mod usbphy {
    use super::reg::Rw;

    #[repr(C)]
    #[cfg_attr(test, derive(Default))]
    pub struct RegisterBlock {
        pub PWD: Rw,
        pub PWD_SET: Rw,
        pub PWD_CLR: Rw,
        pub PWD_TOG: Rw,
        _reserved0: [u32; 8],
        pub CTRL: Rw,
        pub CTRL_SET: Rw,
        pub CTRL_CLR: Rw,
        pub CTRL_TOG: Rw,
    }

    #[cfg(not(test))]
    const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x40) as usize];

    pub mod CTRL_SET {
        field!(CLKGATE, 30, 1);
        field!(SFTRST, 31, 1);
    }

    pub mod CTRL_CLR {
        pub use super::CTRL_SET::*;
    }
}
