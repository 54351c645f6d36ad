//! USB interrupt service routine

use core::sync::atomic::Ordering;

use crate::{
    control::{self, Setup},
    device::{self, Device, Speed},
    ral::{self, usb::USBSTS},
};

/// Control endpoint bits of ENDPTCOMPLETE, ENDPTFLUSH, and friends.
const CONTROL_BITS: u32 = 0x0001_0001;

/// Give up on a SETUP that keeps changing after this many reads.
const SETUP_RETRIES: usize = 16;

impl Device {
    /// Handle the USB interrupt.
    ///
    /// Prefer [`on_interrupt`](crate::on_interrupt), unless you have
    /// your own way to find the device.
    pub fn isr(&self) {
        let usb = &*self.usb;
        let status = ral::read_reg!(ral::usb, usb, USBSTS);
        ral::write_reg!(ral::usb, usb, USBSTS, status);
        let status = status & ral::read_reg!(ral::usb, usb, USBINTR);

        if status & USBSTS::URI::mask != 0 {
            self.bus_reset();
        }
        if status & (USBSTS::UI::mask | USBSTS::UEI::mask) != 0 {
            self.setup_requests();
            self.completions();
        }
        if status & USBSTS::UEI::mask != 0 {
            self.errors();
        }
        if status & USBSTS::PCI::mask != 0 {
            let speed = if ral::read_reg!(ral::usb, usb, PORTSC1, PSPD) == 2 {
                Speed::High
            } else {
                Speed::Full
            };
            self.set_speed(speed);
            debug!("PORT CHANGE high speed {=bool}", speed == Speed::High);
        }
        if status & USBSTS::SLI::mask != 0 {
            debug!("SUSPEND");
        }
    }

    fn bus_reset(&self) {
        let usb = &*self.usb;
        ral::modify_reg!(ral::usb, usb, ENDPTSETUPSTAT, |setupstat: u32| setupstat);
        ral::modify_reg!(ral::usb, usb, ENDPTCOMPLETE, |complete: u32| complete);

        if !device::wait_clear(|| ral::read_reg!(ral::usb, usb, ENDPTPRIME), u32::MAX) {
            warn!("Prime still pending at reset");
        }
        ral::write_reg!(ral::usb, usb, ENDPTFLUSH, u32::MAX);
        if !device::wait_clear(|| ral::read_reg!(ral::usb, usb, ENDPTFLUSH), u32::MAX) {
            warn!("Flush still pending at reset");
        }

        self.pending.store(0, Ordering::Release);
        self.deconfigure();
        self.qh(0).set_next(None);
        self.qh(1).set_next(None);
        debug!("RESET");
    }

    /// Capture, then answer or defer, every pending SETUP.
    fn setup_requests(&self) {
        let usb = &*self.usb;
        let mut setupstat = ral::read_reg!(ral::usb, usb, ENDPTSETUPSTAT) & 0xFFFF;
        while setupstat != 0 {
            let le = setupstat.trailing_zeros() as usize;
            setupstat &= setupstat - 1;
            let words = self.read_setup(le);

            // Anything primed for the previous request is stale.
            let mask = CONTROL_BITS << le;
            ral::write_reg!(ral::usb, usb, ENDPTFLUSH, mask);
            if !device::wait_clear(|| ral::read_reg!(ral::usb, usb, ENDPTFLUSH), mask) {
                warn!("Control flush timeout");
            }
            self.qh(le * 2).set_next(None);
            self.qh(le * 2 + 1).set_next(None);
            ral::write_reg!(ral::usb, usb, ENDPTCOMPLETE, mask);

            let setup = Setup::from_words(words);
            if le == 0 && setup.is_standard() {
                control::standard(self, setup);
            } else {
                self.setups[le][0].store(words[0], Ordering::Relaxed);
                self.setups[le][1].store(words[1], Ordering::Relaxed);
                self.pending.fetch_or(1 << le, Ordering::AcqRel);
                self.dispatch.wakeup();
            }
        }
    }

    /// Read the SETUP of logical endpoint `le` under the setup tripwire.
    fn read_setup(&self, le: usize) -> [u32; 2] {
        let usb = &*self.usb;
        // The reference manual says to clear the status both before and after
        // reading the setup buffer, depending on the section. Clear before.
        ral::write_reg!(ral::usb, usb, ENDPTSETUPSTAT, 1 << le);
        let mut setup = [0; 2];
        for _ in 0..SETUP_RETRIES {
            ral::modify_reg!(ral::usb, usb, USBCMD, SUTW: 1);
            setup = self.qh(le * 2).setup();
            if ral::read_reg!(ral::usb, usb, USBCMD, SUTW == 1) {
                break;
            }
        }
        ral::modify_reg!(ral::usb, usb, USBCMD, SUTW: 0);
        setup
    }

    /// Remove the descriptors of every endpoint that completed a
    /// transfer.
    fn completions(&self) {
        let usb = &*self.usb;
        let mut complete = ral::read_reg!(ral::usb, usb, ENDPTCOMPLETE) & !CONTROL_BITS;
        ral::write_reg!(ral::usb, usb, ENDPTCOMPLETE, complete);
        while complete != 0 {
            let bit = complete.trailing_zeros();
            complete &= complete - 1;
            let he = ral::endpoint_of_bit(bit);
            self.pool.queue(he).remove();
        }
    }

    /// Remove the descriptors that retired with an error.
    ///
    /// A halted descriptor raises the error interrupt, but its endpoint
    /// isn't always flagged in ENDPTCOMPLETE.
    fn errors(&self) {
        let mut removed = 0;
        for he in 2..self.endpoints() * 2 {
            let queue = self.pool.queue(he);
            if !queue.is_empty() {
                removed += queue.remove();
            }
        }
        warn!("USB error; removed {=usize} descriptors", removed);
    }
}

#[cfg(test)]
mod test {
    use crate::{
        device::Speed,
        emulator::{Emulator, ACM_DESCRIPTORS},
        ral::{self, usb::USBSTS},
        signal::Signal,
        td::{Dtd, Ownership, Status},
    };
    use std::sync::atomic::Ordering;

    fn configured() -> Emulator {
        let emu = Emulator::with_descriptors(ACM_DESCRIPTORS);
        emu.port_change(Speed::High);
        emu.setup(0, [0x00, 9, 1, 0, 0, 0, 0, 0]);
        assert_eq!(emu.device.config(), 1);
        emu
    }

    fn submit(emu: &Emulator, he: usize) -> (&'static Dtd, &'static Signal) {
        let dtd: &'static Dtd = Box::leak(Box::new(Dtd::new()));
        let signal: &'static Signal = Box::leak(Box::new(Signal::new()));
        dtd.set_signal(Some(signal));
        unsafe { dtd.setup_transfer(core::ptr::null(), 0) };
        emu.device.prime(he, dtd, dtd).unwrap();
        (dtd, signal)
    }

    #[test]
    fn port_change_speed() {
        let emu = Emulator::new();
        emu.port_change(Speed::High);
        assert_eq!(emu.device.speed(), Speed::High);
        emu.port_change(Speed::Full);
        assert_eq!(emu.device.speed(), Speed::Full);
    }

    #[test]
    fn masked_status_ignored() {
        let emu = Emulator::new();
        // SRI isn't enabled.
        emu.interrupt(USBSTS::SRI::mask);
        assert_eq!(emu.usb.USBSTS.read(), 0);
        assert!(emu.usb.ENDPTFLUSH.history().is_empty());
    }

    #[test]
    fn bus_reset_completes_everything() {
        let emu = configured();
        let transfers: Vec<_> = [2, 4, 5, 5, 5]
            .into_iter()
            .map(|he| submit(&emu, he))
            .collect();
        assert!(!emu.device.pool.queue(5).is_empty());

        emu.bus_reset();
        for (dtd, signal) in &transfers {
            assert!(signal.is_set());
            assert_eq!(dtd.ownership(), Ownership::Completed);
            assert_eq!(dtd.status().1, Status::ACTIVE);
        }
        for he in 2..6 {
            assert!(emu.device.pool.queue(he).is_empty());
        }
        assert_eq!(emu.device.config(), 0);
        assert!(emu.usb.ENDPTFLUSH.history().contains(&u32::MAX));
        assert!((1..8).all(|le| emu.usb.ENDPTCTRL[le].read() == 0));

        // Unconfigured until the host says otherwise.
        let dtd = Box::leak(Box::new(Dtd::new()));
        unsafe { dtd.setup_transfer(core::ptr::null(), 0) };
        assert!(emu.device.prime(4, dtd, dtd).unwrap_err().is_not_ready());
    }

    #[test]
    fn completion_wakes_in_order() {
        let emu = configured();
        let transfers: Vec<_> = (0..3).map(|_| submit(&emu, 5)).collect();
        for (dtd, _) in &transfers {
            emu.track(core::slice::from_ref(*dtd));
        }

        for (idx, (dtd, signal)) in transfers.iter().enumerate() {
            let (completed, _) = emu.complete(5, None);
            assert!(core::ptr::eq(completed, *dtd));
            assert!(signal.is_set());
            assert_eq!(emu.device.transfer_status(5, dtd), Ok(0));
            for (_, later) in &transfers[idx + 1..] {
                assert!(!later.is_set());
            }
        }
        assert!(emu.device.pool.queue(5).is_empty());
    }

    #[test]
    fn error_interrupt_removes_halted() {
        let emu = configured();
        let (halted, halted_signal) = submit(&emu, 5);
        let (busy, busy_signal) = submit(&emu, 2);
        halted.hw().TOKEN.write(Status::HALTED.bits());

        emu.interrupt(USBSTS::UEI::mask);
        assert!(halted_signal.is_set());
        assert_eq!(halted.ownership(), Ownership::Completed);
        match emu.device.transfer_status(5, halted) {
            Err(crate::Error::Transfer(err)) => {
                assert_eq!(err.status, Status::HALTED);
                assert!(!err.is_bus_reset());
            }
            other => panic!("{other:?}"),
        }
        assert!(emu.device.pool.queue(5).is_empty());

        // Still running.
        assert!(!busy_signal.is_set());
        assert_eq!(busy.ownership(), Ownership::ActiveHardware);
    }

    #[test]
    fn control_completions_left_alone() {
        let emu = Emulator::new();
        emu.usb.ENDPTCOMPLETE.raise(0x0001_0001 | ral::endpoint_mask(4));
        emu.interrupt(USBSTS::UI::mask);
        assert_eq!(emu.usb.ENDPTCOMPLETE.read(), 0x0001_0001);
    }

    #[test]
    fn other_setups_deferred() {
        let emu = Emulator::new();
        // Vendor request on EP0, and anything on EP1.
        emu.setup(0, [0xC0, 0x10, 0, 0, 0, 0, 4, 0]);
        emu.setup(1, [0x80, 6, 0, 1, 0, 0, 18, 0]);
        let device = emu.device;
        assert_eq!(device.pending.load(Ordering::Relaxed), 0b11);
        assert!(device.dispatch.is_set());
        assert_eq!(device.setups[0][0].load(Ordering::Relaxed), 0x0000_10C0);
        assert_eq!(device.setups[0][1].load(Ordering::Relaxed), 0x0004_0000);
        assert_eq!(device.setups[1][0].load(Ordering::Relaxed), 0x0100_0680);
        // Nothing answered yet.
        assert!(emu.usb.ENDPTPRIME.history().is_empty());
        assert_eq!(emu.usb.ENDPTFLUSH.history(), [0x0001_0001, 0x0002_0002]);
        assert_eq!(emu.usb.ENDPTSETUPSTAT.read(), 0);
    }

    #[test]
    fn reset_forgets_deferred_setups() {
        let emu = Emulator::new();
        emu.setup(0, [0x21, 0x22, 0, 0, 0, 0, 0, 0]);
        emu.bus_reset();
        assert_eq!(emu.device.pending.load(Ordering::Relaxed), 0);
        assert_eq!(emu.device.process_control_requests(crate::Timeout::Micros(0)), 0);
    }
}
