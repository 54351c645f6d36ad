//! Endpoint Queue Head (dQH)

#![allow(non_snake_case, non_upper_case_globals)]

use crate::ral;
use crate::{td::Td, vcell::VCell};

#[repr(C, align(64))]
pub struct Qh {
    CAPABILITIES: VCell,
    CURRENT: VCell,
    overlay: Td,
    setup: [VCell; 2],
}

impl Qh {
    /// Create a new QH, setting all bits to zero
    pub const fn new() -> Self {
        Qh {
            CAPABILITIES: VCell::new(0),
            CURRENT: VCell::new(0),
            overlay: Td::new(),
            setup: [VCell::new(0), VCell::new(0)],
        }
    }

    /// Read the setup buffer
    ///
    /// Caller is responsible for managing the setup tripwire.
    #[inline(always)]
    pub fn setup(&self) -> [u32; 2] {
        [self.setup[0].read(), self.setup[1].read()]
    }

    /// The transfer overlay. Its NEXT is where the controller fetches the
    /// next descriptor when the endpoint is primed.
    pub fn overlay(&self) -> &Td {
        &self.overlay
    }

    /// The address of the descriptor the controller worked on last.
    pub fn current(&self) -> u32 {
        self.CURRENT.read()
    }

    /// Point the overlay at `next`, and clear the overlay status, so the
    /// next prime starts there.
    pub fn set_next(&self, next: Option<&Td>) {
        self.overlay.TOKEN.write(0);
        self.overlay.NEXT.write(crate::td::hw_link(next));
    }

    /// Configure the endpoint
    ///
    /// Clamps `max_packet_len` to 1024. This also forgets the current
    /// descriptor.
    pub fn set_config(&self, max_packet_len: usize, flags: Flags) {
        ral::write_reg!(
            crate::qh,
            self,
            CAPABILITIES,
            MAXIMUM_PACKET_LENGTH: max_packet_len.min(1024) as u32,
            IOS: flags.interrupt_on_setup as u32,
            // 0 == Enable zero length packet when transfer is equal to multiple of max packet length
            // 1 == Disable zero length packet
            ZLT: !flags.zero_length_termination as u32
        );
        self.CURRENT.write(0);
    }

    /// Returns the maximum packet length
    pub fn max_packet_len(&self) -> usize {
        ral::read_reg!(crate::qh, self, CAPABILITIES, MAXIMUM_PACKET_LENGTH) as usize
    }

    #[cfg(test)]
    pub(crate) fn sim_current(&self, addr: u32) {
        self.CURRENT.write(addr);
    }

    #[cfg(test)]
    pub(crate) fn sim_setup(&self, setup: [u32; 2]) {
        self.setup[0].write(setup[0]);
        self.setup[1].write(setup[1]);
    }
}

/// Queue head configuration flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct Flags {
    pub interrupt_on_setup: bool,
    pub zero_length_termination: bool,
}

mod CAPABILITIES {
    pub mod ZLT {
        pub const offset: u32 = 29;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod MAXIMUM_PACKET_LENGTH {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0x7FF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod IOS {
        pub const offset: u32 = 15;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Qh>() == 64) as usize];
