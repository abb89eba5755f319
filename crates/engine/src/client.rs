//! The `AddressClient` contract (§4.9): a uniform start/stop/event
//! surface the acquisition engine drives, shared by the four
//! per-address-family clients. Their wire protocols are out of scope
//! (§1 Non-goals); only this contract, and enough internal state to
//! exercise the engine's own state machine end to end, is implemented.

use std::cell::Cell;
use std::net::Ipv4Addr;

use slot::{Slot, SlotList};

use dhcp::types::Lease;

/// Every event an `AddressClient` can hand back to the engine.
/// Concrete clients only ever emit the subset relevant to their
/// protocol.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// `ipv4ll` offered an address.
    Bound { address: Ipv4Addr },
    /// `ipv4ll` detected an address conflict on its offered address.
    Conflict,
    /// The client stopped (voluntarily or on request).
    Stopped,
    /// `dhcp4`/`dhcp6` completed an exchange.
    LeaseBound(Lease),
    /// `ndisc` received a router advertisement.
    RouterAdvertisement,
}

/// Uniform lifecycle every per-address-family client implements. The
/// engine calls `start`/`stop` on carrier/IPV6LL transitions and
/// subscribes once to learn of `Bind`/`Conflict`/lease/advertisement
/// events (§4.4).
pub trait AddressClient {
    /// Start the client against `ifindex`/`hw_addr`. `seed` is the
    /// link's stable identifier, threaded into `ipv4ll`'s address
    /// selection; other clients ignore it.
    fn start(&self, ifindex: u32, hw_addr: [u8; 6], seed: u64);

    /// Stop the client if running. A no-op if already stopped.
    fn stop(&self);

    fn is_running(&self) -> bool;

    fn subscribe(&self, callback: Box<dyn FnMut(&ClientEvent)>) -> Slot<ClientEvent>;
}

/// Shared bookkeeping every stub client wraps: a running flag and an
/// event sink. Real wire I/O would replace the bodies of `do_start`/
/// `do_stop` with actual socket setup/teardown; here they only flip
/// the flag, matching the out-of-scope wire protocol.
#[derive(Default)]
struct Shared {
    running: Cell<bool>,
    events: SlotList<ClientEvent>,
}

impl Shared {
    fn start(&self) {
        self.running.set(true);
    }

    fn stop(&self) {
        if self.running.get() {
            self.running.set(false);
            self.events.notify(&ClientEvent::Stopped);
        }
    }
}

/// IPv4 link-local (RFC 3927) client stub. `simulate_bind`/
/// `simulate_conflict` stand in for the ARP-probe state machine a real
/// implementation would run; they are the seam a transport layer (or
/// a test) drives.
#[derive(Default)]
pub struct Ipv4LinkLocal {
    shared: Shared,
    seed: Cell<u64>,
}

impl Ipv4LinkLocal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self) -> u64 {
        self.seed.get()
    }

    pub fn simulate_bind(&self, address: Ipv4Addr) {
        self.shared.events.notify(&ClientEvent::Bound { address });
    }

    pub fn simulate_conflict(&self) {
        self.shared.events.notify(&ClientEvent::Conflict);
    }
}

impl AddressClient for Ipv4LinkLocal {
    fn start(&self, _ifindex: u32, _hw_addr: [u8; 6], seed: u64) {
        self.seed.set(seed);
        self.shared.start();
    }

    fn stop(&self) {
        self.shared.stop();
    }

    fn is_running(&self) -> bool {
        self.shared.running.get()
    }

    fn subscribe(&self, callback: Box<dyn FnMut(&ClientEvent)>) -> Slot<ClientEvent> {
        self.shared.events.subscribe(callback)
    }
}

/// IPv4 DHCP client stub. `inject_lease` is the seam a UDP transport
/// (not built here, per the wire-protocol Non-goal) would call once it
/// decodes a reply via [`dhcp::types::Lease::from_raw`].
#[derive(Default)]
pub struct Dhcp4Client {
    shared: Shared,
}

impl Dhcp4Client {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_lease(&self, lease: Lease) {
        self.shared.events.notify(&ClientEvent::LeaseBound(lease));
    }
}

impl AddressClient for Dhcp4Client {
    fn start(&self, _ifindex: u32, _hw_addr: [u8; 6], _seed: u64) {
        self.shared.start();
    }

    fn stop(&self) {
        self.shared.stop();
    }

    fn is_running(&self) -> bool {
        self.shared.running.get()
    }

    fn subscribe(&self, callback: Box<dyn FnMut(&ClientEvent)>) -> Slot<ClientEvent> {
        self.shared.events.subscribe(callback)
    }
}

/// IPv6 DHCP client stub, analogous to [`Dhcp4Client`] (§4.4).
#[derive(Default)]
pub struct Dhcp6Client {
    shared: Shared,
}

impl Dhcp6Client {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AddressClient for Dhcp6Client {
    fn start(&self, _ifindex: u32, _hw_addr: [u8; 6], _seed: u64) {
        self.shared.start();
    }

    fn stop(&self) {
        self.shared.stop();
    }

    fn is_running(&self) -> bool {
        self.shared.running.get()
    }

    fn subscribe(&self, callback: Box<dyn FnMut(&ClientEvent)>) -> Slot<ClientEvent> {
        self.shared.events.subscribe(callback)
    }
}

/// IPv6 router discovery client stub. `simulate_advertisement` stands
/// in for a real ICMPv6 listener.
#[derive(Default)]
pub struct RouterDiscoveryClient {
    shared: Shared,
}

impl RouterDiscoveryClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn simulate_advertisement(&self) {
        self.shared.events.notify(&ClientEvent::RouterAdvertisement);
    }
}

impl AddressClient for RouterDiscoveryClient {
    fn start(&self, _ifindex: u32, _hw_addr: [u8; 6], _seed: u64) {
        self.shared.start();
    }

    fn stop(&self) {
        self.shared.stop();
    }

    fn is_running(&self) -> bool {
        self.shared.running.get()
    }

    fn subscribe(&self, callback: Box<dyn FnMut(&ClientEvent)>) -> Slot<ClientEvent> {
        self.shared.events.subscribe(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn ipv4ll_start_records_seed_and_bind_notifies_subscriber() {
        let client = Ipv4LinkLocal::new();
        let seen: Rc<RefCell<Option<Ipv4Addr>>> = Rc::new(RefCell::new(None));
        let seen2 = seen.clone();
        let _slot = client.subscribe(Box::new(move |e| {
            if let ClientEvent::Bound { address } = e {
                *seen2.borrow_mut() = Some(*address);
            }
        }));

        client.start(3, [0; 6], 42);
        assert_eq!(client.seed(), 42);
        assert!(client.is_running());

        client.simulate_bind(Ipv4Addr::new(169, 254, 1, 2));
        assert_eq!(*seen.borrow(), Some(Ipv4Addr::new(169, 254, 1, 2)));
    }

    #[test]
    fn stop_emits_stopped_exactly_once_when_running() {
        let client = Dhcp4Client::new();
        let count = Rc::new(Cell::new(0));
        let count2 = count.clone();
        let _slot = client.subscribe(Box::new(move |e| {
            if matches!(e, ClientEvent::Stopped) {
                count2.set(count2.get() + 1);
            }
        }));

        client.stop();
        assert_eq!(count.get(), 0, "stopping an already-stopped client is a no-op");

        client.start(3, [0; 6], 0);
        client.stop();
        assert_eq!(count.get(), 1);
    }
}
