//! Endpoint transfer lists
//!
//! Each non-control hardware endpoint has a [`Queue`] of descriptors that
//! the controller hasn't released yet. Threads append at the tail; the
//! ISR removes from the head. Neither side takes a lock that the other
//! side waits on.
//!
//! Appenders to one endpoint wait for each other. Submit to an endpoint
//! from one execution priority only: an interrupt that appends to an
//! endpoint while the thread it preempted is appending to that same
//! endpoint spins forever.
//!
//! The controller follows the hardware links (`Td::NEXT`). The software
//! links ([`Link`]) carry one extra state, `Removed`, that lets the ISR
//! and an appender agree on who finishes the last descriptor of a list.

use core::{
    ptr,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};

use crate::{
    qh::Qh,
    ral,
    td::{Dtd, Link, Ownership},
    time::Deadline,
};

/// How long to wait for the controller to accept a prime.
const PRIME_TIMEOUT_US: u32 = 1_000;

/// The list of descriptors owned by one hardware endpoint.
pub(crate) struct Queue {
    head: AtomicPtr<Dtd>,
    tail: AtomicPtr<Dtd>,
    /// Serializes appenders. Never taken by the ISR.
    busy: AtomicBool,
}

fn as_ptr(dtd: &'static Dtd) -> *mut Dtd {
    dtd as *const Dtd as *mut Dtd
}

fn as_ref(dtd: *mut Dtd) -> Option<&'static Dtd> {
    // Safety: queues only hold pointers to static descriptors.
    unsafe { dtd.as_ref() }
}

/// Release a descriptor to software, and wake its waiter.
///
/// Returns `false` if someone already finished it.
fn finish(dtd: &Dtd) -> bool {
    let finished = dtd.transition(Ownership::ActiveHardware, Ownership::Completed);
    if finished {
        dtd.wakeup();
    }
    finished
}

/// Where an appended chain landed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Append {
    /// The list was empty. The caller must prime the endpoint.
    Empty,
    /// Linked behind the previous tail.
    Linked,
}

struct Busy<'a>(&'a AtomicBool);

fn spin(flag: &AtomicBool) -> Busy<'_> {
    while flag
        .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
        .is_err()
    {
        core::hint::spin_loop();
    }
    Busy(flag)
}

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Queue {
    pub const fn new() -> Self {
        Queue {
            head: AtomicPtr::new(ptr::null_mut()),
            tail: AtomicPtr::new(ptr::null_mut()),
            busy: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> Busy<'_> {
        spin(&self.busy)
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// `true` if there's nothing queued.
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Acquire).is_null()
    }

    /// The first descriptor that the ISR hasn't removed.
    #[cfg(test)]
    pub(crate) fn head(&self) -> Option<&'static Dtd> {
        as_ref(self.head.load(Ordering::Acquire))
    }

    /// Put `first` through `last` at the end of the list.
    ///
    /// The chain must already be handed to the hardware.
    fn append(&self, first: &'static Dtd, last: &'static Dtd) -> Append {
        let prev = self.tail.swap(as_ptr(last), Ordering::AcqRel);
        if let Some(prev) = as_ref(prev) {
            match prev.compare_link(Link::End, Link::Next(first)) {
                Ok(()) => {
                    prev.set_hw_next(Some(first));
                    return Append::Linked;
                }
                // The ISR is detaching prev, and it left prev for us.
                Err(_) => {
                    finish(prev);
                }
            }
        }
        self.head.store(as_ptr(first), Ordering::Release);
        Append::Empty
    }

    /// Remove the descriptors that the controller released, and wake
    /// their waiters.
    ///
    /// Stops at the first descriptor that's still active. Call from the
    /// ISR only.
    pub fn remove(&self) -> usize {
        self.reap(false)
    }

    /// Remove and wake every descriptor, active or not.
    ///
    /// Use after a bus reset flushed the endpoint. Returns the number of
    /// woken descriptors. Call from the ISR only.
    pub fn drain(&self) -> usize {
        self.reap(true)
    }

    fn reap(&self, force: bool) -> usize {
        let mut woken = 0;
        let mut current = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        while let Some(dtd) = as_ref(current) {
            if !force && dtd.is_active() {
                self.head.store(current, Ordering::Release);
                break;
            }
            let next = match dtd.link() {
                Link::Next(next) => next,
                _ => match dtd.compare_link(Link::End, Link::Removed) {
                    // An appender got here first.
                    Err(Link::Next(next)) => next,
                    _ => {
                        if self
                            .tail
                            .compare_exchange(
                                current,
                                ptr::null_mut(),
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            woken += finish(dtd) as usize;
                        }
                        // Otherwise, an appender swapped the tail, and it
                        // still holds dtd. It finishes dtd when it sees
                        // that it's removed.
                        break;
                    }
                },
            };
            woken += finish(dtd) as usize;
            current = as_ptr(next);
        }
        woken
    }
}

/// Hand the chain `first` through `last` to the hardware.
///
/// Terminates the chain at `last`.
///
/// # Panics
///
/// Panics if a descriptor in the chain wasn't set up for a transfer, or
/// if `last` doesn't follow `first`.
fn claim_chain(first: &'static Dtd, last: &'static Dtd) {
    last.set_link(Link::End);
    last.set_hw_next(None);
    let mut dtd = first;
    loop {
        assert!(
            dtd.transition(Ownership::Queued, Ownership::ActiveHardware),
            "DTD wasn't set up for a transfer"
        );
        if ptr::eq(dtd, last) {
            return;
        }
        match dtd.link() {
            Link::Next(next) => dtd = next,
            _ => panic!("DTD chain doesn't reach its last DTD"),
        }
    }
}

/// Point the endpoint at `first`, and prime it.
fn prime_empty(usb: &ral::usb::RegisterBlock, qh: &Qh, mask: u32, first: &'static Dtd) {
    let mut deadline = Deadline::after_us(PRIME_TIMEOUT_US);
    while ral::read_reg!(ral::usb, usb, ENDPTPRIME) & mask != 0 {
        if deadline.expired() {
            warn!("Prime bit {=u32:#x} stuck", mask);
            break;
        }
    }
    qh.set_next(Some(first.hw()));
    ral::write_reg!(ral::usb, usb, ENDPTPRIME, mask);
}

/// Owner of the ATDTW tripwire.
///
/// USBCMD has one ATDTW bit for the whole controller, so every endpoint
/// of a device shares one `Tripwire`.
pub(crate) struct Tripwire(AtomicBool);

impl Tripwire {
    pub const fn new() -> Self {
        Tripwire(AtomicBool::new(false))
    }

    /// Run `f` while nobody else uses the tripwire.
    ///
    /// On target, `f` also runs with interrupts masked, so an interrupt
    /// that primes can't find the tripwire taken.
    fn hold<R>(&self, f: impl FnOnce() -> R) -> R {
        let held = || {
            let _busy = spin(&self.0);
            f()
        };
        #[cfg(target_arch = "arm")]
        return cortex_m::interrupt::free(|_| held());
        #[cfg(not(target_arch = "arm"))]
        held()
    }
}

/// `true` if the controller is working on the endpoint(s) in `mask`.
///
/// Reads ENDPTSTAT under the ATDTW tripwire, so that a descriptor
/// that the controller adds while we look doesn't go unnoticed.
fn endpoint_status(usb: &ral::usb::RegisterBlock, tripwire: &Tripwire, mask: u32) -> bool {
    tripwire.hold(|| {
        let mut status;
        loop {
            ral::modify_reg!(ral::usb, usb, USBCMD, ATDTW: 1);
            status = ral::read_reg!(ral::usb, usb, ENDPTSTAT) & mask;
            if ral::read_reg!(ral::usb, usb, USBCMD, ATDTW == 1) {
                break;
            }
        }
        ral::modify_reg!(ral::usb, usb, USBCMD, ATDTW: 0);
        status != 0
    })
}

/// Append `first` through `last` to the endpoint's list, and make sure
/// the controller gets to them.
///
/// Appenders on the same endpoint are serialized; different endpoints
/// only share the `tripwire`.
pub(crate) fn prime(
    usb: &ral::usb::RegisterBlock,
    tripwire: &Tripwire,
    qh: &Qh,
    queue: &Queue,
    he: usize,
    first: &'static Dtd,
    last: &'static Dtd,
) {
    let mask = ral::endpoint_mask(he);
    let _busy = queue.lock();
    claim_chain(first, last);

    if Append::Empty == queue.append(first, last) {
        prime_empty(usb, qh, mask, first);
        return;
    }

    if ral::read_reg!(ral::usb, usb, ENDPTPRIME) & mask != 0 {
        return;
    }

    // The controller may have read the old terminating link before we
    // replaced it. If the endpoint went idle without reaching our chain,
    // start it again.
    if !endpoint_status(usb, tripwire, mask) && qh.current() != last.hw().addr() {
        debug!("Re-prime endpoint {=usize}", he);
        prime_empty(usb, qh, mask, first);
    }
}

#[cfg(test)]
mod test {
    use super::{prime, Queue, Tripwire};
    use crate::{
        qh::Qh,
        ral::{self, usb},
        signal::Signal,
        td::{Dtd, Link, Ownership, Status},
    };
    use std::{sync::Arc, thread};

    static TRIPWIRE: Tripwire = Tripwire::new();

    fn dtd() -> &'static Dtd {
        Box::leak(Box::new(Dtd::new()))
    }

    fn signal() -> &'static Signal {
        Box::leak(Box::new(Signal::new()))
    }

    /// Set up a zero-length transfer that wakes `signal`.
    fn submit(dtd: &'static Dtd, signal: &'static Signal) {
        signal.clear();
        dtd.set_signal(Some(signal));
        unsafe { dtd.setup_transfer(core::ptr::null(), 0) };
    }

    /// What the controller does when it finishes a descriptor.
    fn complete(qh: &Qh, dtd: &Dtd) {
        dtd.hw().TOKEN.write(dtd.hw().TOKEN.read() & !Status::ACTIVE.bits());
        qh.sim_current(dtd.hw().addr());
    }

    #[test]
    fn first_append_primes() {
        let regs = usb::RegisterBlock::default();
        let (qh, queue) = (Qh::new(), Queue::new());
        let (a, s) = (dtd(), signal());
        submit(a, s);

        prime(&regs, &TRIPWIRE, &qh, &queue, 4, a, a);

        assert_eq!(regs.ENDPTPRIME.history(), [1 << 2]);
        assert_eq!(qh.overlay().NEXT.read(), a.hw().addr());
        assert_eq!(a.ownership(), Ownership::ActiveHardware);
        assert!(core::ptr::eq(queue.head().unwrap(), a));
        assert!(!queue.is_empty());
    }

    #[test]
    fn append_while_busy_links() {
        let regs = usb::RegisterBlock::default();
        regs.ENDPTSTAT.write(1 << 18);
        let (qh, queue) = (Qh::new(), Queue::new());
        let (a, b) = (dtd(), dtd());
        submit(a, signal());
        submit(b, signal());

        prime(&regs, &TRIPWIRE, &qh, &queue, 5, a, a);
        prime(&regs, &TRIPWIRE, &qh, &queue, 5, b, b);

        assert_eq!(regs.ENDPTPRIME.history(), [1 << 18]);
        assert_eq!(a.hw().NEXT.read(), b.hw().addr());
        assert_eq!(b.hw().NEXT.read(), 1);
        assert!(matches!(a.link(), Link::Next(next) if core::ptr::eq(next, b)));
    }

    #[test]
    fn append_while_idle_reprimes() {
        let regs = usb::RegisterBlock::default();
        let (qh, queue) = (Qh::new(), Queue::new());
        let (a, b, c) = (dtd(), dtd(), dtd());
        for d in [a, b, c] {
            submit(d, signal());
        }

        prime(&regs, &TRIPWIRE, &qh, &queue, 2, a, a);
        regs.ENDPTPRIME.take();
        // The controller went idle before it saw b.
        complete(&qh, a);
        prime(&regs, &TRIPWIRE, &qh, &queue, 2, b, b);
        assert_eq!(regs.ENDPTPRIME.history(), [2, 2]);
        assert_eq!(qh.overlay().NEXT.read(), b.hw().addr());

        // The controller already finished c; don't run it again.
        regs.ENDPTPRIME.take();
        complete(&qh, b);
        let (d, e) = (c, dtd());
        submit(e, signal());
        d.set_next(Some(e));
        qh.sim_current(e.hw().addr());
        prime(&regs, &TRIPWIRE, &qh, &queue, 2, d, e);
        assert_eq!(regs.ENDPTPRIME.history(), [2, 2]);
    }

    #[test]
    fn removal_stops_at_active() {
        let regs = usb::RegisterBlock::default();
        regs.ENDPTSTAT.write(u32::MAX);
        let (qh, queue) = (Qh::new(), Queue::new());
        let (a, b, c) = (dtd(), dtd(), dtd());
        let signals = [signal(), signal(), signal()];
        for (d, s) in [a, b, c].into_iter().zip(signals) {
            submit(d, s);
        }
        a.set_next(Some(b));
        prime(&regs, &TRIPWIRE, &qh, &queue, 6, a, b);
        prime(&regs, &TRIPWIRE, &qh, &queue, 6, c, c);

        complete(&qh, a);
        assert_eq!(queue.remove(), 1);
        assert!(signals[0].is_set());
        assert!(!signals[1].is_set());
        assert_eq!(a.ownership(), Ownership::Completed);
        assert_eq!(b.ownership(), Ownership::ActiveHardware);
        assert!(core::ptr::eq(queue.head().unwrap(), b));

        complete(&qh, b);
        complete(&qh, c);
        assert_eq!(queue.remove(), 2);
        assert!(signals.iter().all(|s| s.is_set()));
        assert!(queue.is_empty());
        assert!(queue.head().is_none());
        assert!(matches!(c.link(), Link::Removed));

        // The list is empty again, so this is a first append.
        regs.ENDPTPRIME.take();
        submit(a, signal());
        prime(&regs, &TRIPWIRE, &qh, &queue, 6, a, a);
        assert_eq!(regs.ENDPTPRIME.history(), [1 << 3, 1 << 3]);
    }

    #[test]
    fn appender_finishes_removed_tail() {
        let regs = usb::RegisterBlock::default();
        regs.ENDPTSTAT.write(u32::MAX);
        let (qh, queue) = (Qh::new(), Queue::new());
        let (a, b) = (dtd(), dtd());
        let (sa, sb) = (signal(), signal());
        submit(a, sa);
        submit(b, sb);
        prime(&regs, &TRIPWIRE, &qh, &queue, 3, a, a);

        // The appender swapped the tail, then the ISR ran before the
        // appender could link a to b.
        queue.tail.store(super::as_ptr(b), core::sync::atomic::Ordering::SeqCst);
        complete(&qh, a);
        assert_eq!(queue.remove(), 0);
        assert!(matches!(a.link(), Link::Removed));
        assert_eq!(a.ownership(), Ownership::ActiveHardware);
        assert!(!sa.is_set());

        // The appender resumes, and finds a removed.
        assert!(b.transition(Ownership::Queued, Ownership::ActiveHardware));
        b.set_link(Link::End);
        queue.tail.store(super::as_ptr(a), core::sync::atomic::Ordering::SeqCst);
        assert_eq!(queue.append(b, b), super::Append::Empty);
        assert!(sa.is_set());
        assert_eq!(a.ownership(), Ownership::Completed);
        assert!(core::ptr::eq(queue.head().unwrap(), b));
    }

    #[test]
    fn drain_wakes_everything() {
        const N: usize = 5;
        let regs = usb::RegisterBlock::default();
        regs.ENDPTSTAT.write(u32::MAX);
        let (qh, queue) = (Qh::new(), Queue::new());
        let dtds: Vec<_> = (0..N).map(|_| dtd()).collect();
        let signals: Vec<_> = (0..N).map(|_| signal()).collect();
        for (d, s) in dtds.iter().zip(&signals) {
            submit(d, s);
            prime(&regs, &TRIPWIRE, &qh, &queue, 8, d, d);
        }
        // One of them already completed, but nobody removed it.
        complete(&qh, dtds[0]);

        assert_eq!(queue.drain(), N);
        assert!(queue.is_empty());
        assert!(queue.head().is_none());
        for (d, s) in dtds.iter().zip(&signals) {
            assert!(s.is_set());
            assert_eq!(d.ownership(), Ownership::Completed);
        }
        assert_eq!(dtds[1].status().1, Status::ACTIVE);
        assert_eq!(queue.drain(), 0);
    }

    #[test]
    fn concurrent_appenders_keep_order() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 64;

        let regs = Arc::new(usb::RegisterBlock::default());
        regs.ENDPTSTAT.write(u32::MAX);
        let qh: &'static Qh = Box::leak(Box::new(Qh::new()));
        let queue: &'static Queue = Box::leak(Box::new(Queue::new()));

        let dtds: Vec<Vec<&'static Dtd>> = (0..THREADS)
            .map(|_| (0..PER_THREAD).map(|_| dtd()).collect())
            .collect();

        let handles: Vec<_> = dtds
            .iter()
            .cloned()
            .map(|mine| {
                let regs = Arc::clone(&regs);
                thread::spawn(move || {
                    for d in mine {
                        submit(d, signal());
                        prime(&regs, &TRIPWIRE, qh, queue, 10, d, d);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Walk the list, in hardware and software.
        let mut walked = Vec::new();
        let mut current = queue.head();
        while let Some(d) = current {
            walked.push(d as *const Dtd as usize);
            current = match d.link() {
                Link::Next(next) => {
                    assert_eq!(d.hw().NEXT.read(), next.hw().addr());
                    Some(next)
                }
                _ => {
                    assert_eq!(d.hw().NEXT.read(), 1);
                    None
                }
            };
        }
        assert_eq!(walked.len(), THREADS * PER_THREAD);
        let mut unique = walked.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), walked.len());

        // Each thread's descriptors appear in submission order.
        for mine in &dtds {
            let positions: Vec<_> = mine
                .iter()
                .map(|d| {
                    let addr = *d as *const Dtd as usize;
                    walked.iter().position(|&w| w == addr).unwrap()
                })
                .collect();
            assert!(positions.windows(2).all(|w| w[0] < w[1]));
        }
        assert_eq!(regs.ENDPTPRIME.history(), [ral::endpoint_mask(10)]);
    }

    #[test]
    fn tripwire_shared_across_endpoints() {
        const ROUNDS: usize = 2_000;

        let regs: &'static usb::RegisterBlock = Box::leak(Box::default());
        // Both endpoints stay busy, so every append reads ENDPTSTAT under
        // the tripwire.
        regs.ENDPTSTAT.write(u32::MAX);
        let tripwire: &'static Tripwire = Box::leak(Box::new(Tripwire::new()));

        let handles: Vec<_> = [2usize, 5]
            .into_iter()
            .map(|he| {
                thread::spawn(move || {
                    let qh: &'static Qh = Box::leak(Box::new(Qh::new()));
                    let queue: &'static Queue = Box::leak(Box::new(Queue::new()));
                    for _ in 0..ROUNDS {
                        let d = dtd();
                        submit(d, signal());
                        prime(regs, tripwire, qh, queue, he, d, d);
                        regs.ENDPTPRIME.take();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(regs.USBCMD.tripwire_overlaps(), 0);
        assert_eq!(regs.USBCMD.read() & ral::usb::USBCMD::ATDTW::mask, 0);
    }

    #[test]
    fn endpoints_append_independently() {
        let regs = usb::RegisterBlock::default();
        let (qh2, queue2) = (Qh::new(), Queue::new());
        let (qh3, queue3) = (Qh::new(), Queue::new());
        let (a, b) = (dtd(), dtd());
        submit(a, signal());
        submit(b, signal());

        // Endpoint 2 has an appender in progress.
        let busy = queue2.lock();
        assert!(queue2.is_locked());
        prime(&regs, &TRIPWIRE, &qh3, &queue3, 3, b, b);
        assert_eq!(qh3.overlay().NEXT.read(), b.hw().addr());
        assert!(!queue3.is_locked());

        drop(busy);
        prime(&regs, &TRIPWIRE, &qh2, &queue2, 2, a, a);
        assert_eq!(qh2.overlay().NEXT.read(), a.hw().addr());
    }
}
