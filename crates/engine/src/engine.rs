//! Per-link IP address acquisition state machine (§4.4).

use std::cell::{Cell, RefCell};
use std::net::Ipv4Addr;
use std::rc::Rc;

use rtnl::ObservedState;
use slot::Slot;

use dhcp::types::Lease;

use crate::client::{AddressClient, ClientEvent};

/// The mutation surface the engine needs from an RTNL cache. Kept as
/// a trait (rather than taking `Rc<rtnl::RtnlCache>` directly) so
/// tests can exercise the state machine against a fake that just
/// records calls, without a real netlink socket.
pub trait AddressInstaller {
    fn create_address(&self, ifindex: u32, family: u8, prefix: &[u8], prefix_len: u8, broadcast: Option<&[u8]>);
    fn destroy_address(&self, ifindex: u32, family: u8, prefix: &[u8], prefix_len: u8);
    fn create_route(&self, family: u8, dst: &[u8], dst_prefix_len: u8, gateway: Option<&[u8]>, oif: u32);
    fn destroy_route(&self, family: u8, dst: &[u8], dst_prefix_len: u8, oif: u32);
}

/// Installs onto a live [`rtnl::RtnlCache`] by spawning the mutation
/// as a detached task on the current `LocalSet` (§5: mutations return
/// immediately, their effect is observed later via the cache's own
/// `New*` ingestion).
impl AddressInstaller for Rc<rtnl::RtnlCache> {
    fn create_address(&self, ifindex: u32, family: u8, prefix: &[u8], prefix_len: u8, broadcast: Option<&[u8]>) {
        let cache = self.clone();
        let prefix = prefix.to_vec();
        let broadcast = broadcast.map(|b| b.to_vec());
        tokio::task::spawn_local(async move {
            let result = cache
                .create_address(ifindex, family, &prefix, prefix_len, broadcast.as_deref())
                .await;
            if let Err(err) = result {
                tracing::warn!(%err, ifindex, "address installation refused");
            }
        });
    }

    fn destroy_address(&self, ifindex: u32, family: u8, prefix: &[u8], prefix_len: u8) {
        let cache = self.clone();
        let prefix = prefix.to_vec();
        tokio::task::spawn_local(async move {
            if let Err(err) = cache.destroy_address(ifindex, family, &prefix, prefix_len).await {
                tracing::warn!(%err, ifindex, "address removal refused");
            }
        });
    }

    fn create_route(&self, family: u8, dst: &[u8], dst_prefix_len: u8, gateway: Option<&[u8]>, oif: u32) {
        let cache = self.clone();
        let dst = dst.to_vec();
        let gateway = gateway.map(|g| g.to_vec());
        tokio::task::spawn_local(async move {
            let result = cache
                .create_route(family, &dst, dst_prefix_len, gateway.as_deref(), oif)
                .await;
            if let Err(err) = result {
                tracing::warn!(%err, oif, "route installation refused");
            }
        });
    }

    fn destroy_route(&self, family: u8, dst: &[u8], dst_prefix_len: u8, oif: u32) {
        let cache = self.clone();
        let dst = dst.to_vec();
        tokio::task::spawn_local(async move {
            if let Err(err) = cache.destroy_route(family, &dst, dst_prefix_len, oif).await {
                tracing::warn!(%err, oif, "route removal refused");
            }
        });
    }
}

const AF_INET: u8 = libc::AF_INET as u8;

fn mask_to_prefix_len(mask: Ipv4Addr) -> u8 {
    u32::from(mask).count_ones() as u8
}

/// One instance per managed link (§4.4). Owns the four per-family
/// clients and translates `observed_state` transitions into
/// start/stop calls, the `ipv4ll` bind/conflict/stop events into RTNL
/// address mutations, and `dhcp4` lease events into RTNL address and
/// route mutations.
pub struct IpAcquisitionEngine<I: AddressInstaller> {
    ifindex: u32,
    hw_addr: [u8; 6],
    seed: u64,

    installer: I,

    ipv4ll: Rc<dyn AddressClient>,
    dhcp4: Rc<dyn AddressClient>,
    dhcp6: Rc<dyn AddressClient>,
    ndisc: Rc<dyn AddressClient>,

    observed_state: Cell<ObservedState>,
    installed_ipv4ll: RefCell<Option<Ipv4Addr>>,
    installed_dhcp4: RefCell<Option<(Ipv4Addr, u8)>>,
    installed_dhcp4_routes: RefCell<Vec<(Vec<u8>, u8)>>,

    // Held so the client event subscriptions stay alive for the
    // engine's lifetime; dropping the engine drops these, detaching
    // from every client (§5 cancellation).
    _ipv4ll_slot: RefCell<Option<Slot<ClientEvent>>>,
    _dhcp4_slot: RefCell<Option<Slot<ClientEvent>>>,
    _dhcp6_slot: RefCell<Option<Slot<ClientEvent>>>,
    _ndisc_slot: RefCell<Option<Slot<ClientEvent>>>,
}

impl<I: AddressInstaller + 'static> IpAcquisitionEngine<I> {
    pub fn new(
        ifindex: u32,
        hw_addr: [u8; 6],
        seed: u64,
        installer: I,
        ipv4ll: Rc<dyn AddressClient>,
        dhcp4: Rc<dyn AddressClient>,
        dhcp6: Rc<dyn AddressClient>,
        ndisc: Rc<dyn AddressClient>,
    ) -> Rc<Self> {
        let engine = Rc::new(Self {
            ifindex,
            hw_addr,
            seed,
            installer,
            ipv4ll,
            dhcp4,
            dhcp6,
            ndisc,
            observed_state: Cell::new(ObservedState::empty()),
            installed_ipv4ll: RefCell::new(None),
            installed_dhcp4: RefCell::new(None),
            installed_dhcp4_routes: RefCell::new(Vec::new()),
            _ipv4ll_slot: RefCell::new(None),
            _dhcp4_slot: RefCell::new(None),
            _dhcp6_slot: RefCell::new(None),
            _ndisc_slot: RefCell::new(None),
        });

        let weak = Rc::downgrade(&engine);
        let slot = engine.ipv4ll.subscribe(Box::new(move |event| {
            if let Some(engine) = weak.upgrade() {
                engine.on_ipv4ll_event(event);
            }
        }));
        *engine._ipv4ll_slot.borrow_mut() = Some(slot);

        let weak = Rc::downgrade(&engine);
        let slot = engine.dhcp4.subscribe(Box::new(move |event| {
            if let Some(engine) = weak.upgrade() {
                engine.on_dhcp4_event(event);
            }
        }));
        *engine._dhcp4_slot.borrow_mut() = Some(slot);

        let weak = Rc::downgrade(&engine);
        let slot = engine.dhcp6.subscribe(Box::new(move |event| {
            if let Some(engine) = weak.upgrade() {
                engine.on_dhcp6_event(event);
            }
        }));
        *engine._dhcp6_slot.borrow_mut() = Some(slot);

        let weak = Rc::downgrade(&engine);
        let slot = engine.ndisc.subscribe(Box::new(move |event| {
            if let Some(engine) = weak.upgrade() {
                engine.on_ndisc_event(event);
            }
        }));
        *engine._ndisc_slot.borrow_mut() = Some(slot);

        engine
    }

    fn on_ipv4ll_event(&self, event: &ClientEvent) {
        match event {
            ClientEvent::Bound { address } => {
                // prefixlen=16, broadcast = address | ~mask(16), scope=LINK (§4.4).
                let mask: u32 = 0xFFFF_0000;
                let broadcast = Ipv4Addr::from(u32::from(*address) | !mask);
                self.installer
                    .create_address(self.ifindex, AF_INET, &address.octets(), 16, Some(&broadcast.octets()));
                *self.installed_ipv4ll.borrow_mut() = Some(*address);
            }
            ClientEvent::Conflict | ClientEvent::Stopped => {
                if let Some(address) = self.installed_ipv4ll.borrow_mut().take() {
                    self.installer.destroy_address(self.ifindex, AF_INET, &address.octets(), 16);
                }
            }
            _ => {}
        }
    }

    fn on_dhcp4_event(&self, event: &ClientEvent) {
        match event {
            ClientEvent::LeaseBound(lease) => self.install_dhcp4_lease(lease),
            ClientEvent::Stopped => self.teardown_dhcp4_lease(),
            _ => {}
        }
    }

    /// Translates a bound DHCPv4 lease into the address and route
    /// mutations it implies: the offered address (prefix length from
    /// the lease's subnet mask, broadcast if present), a default route
    /// via the lease's router if any, and one route per classless/
    /// classful static route the lease decoded (§4.5).
    fn install_dhcp4_lease(&self, lease: &Lease) {
        let address = lease.address();
        let prefix_len = mask_to_prefix_len(lease.subnet_mask());
        let broadcast = lease.broadcast().map(|b| b.octets());
        self.installer
            .create_address(self.ifindex, AF_INET, &address.octets(), prefix_len, broadcast.as_deref());
        *self.installed_dhcp4.borrow_mut() = Some((address, prefix_len));

        let mut routes = Vec::new();
        if let Some(router) = lease.router() {
            self.installer.create_route(AF_INET, &[], 0, Some(&router.octets()), self.ifindex);
            routes.push((Vec::new(), 0));
        }
        for route in lease.static_routes() {
            let significant = (route.prefix_len as usize).div_ceil(8);
            let dst = route.destination.octets()[..significant].to_vec();
            self.installer
                .create_route(AF_INET, &dst, route.prefix_len, Some(&route.gateway.octets()), self.ifindex);
            routes.push((dst, route.prefix_len));
        }
        *self.installed_dhcp4_routes.borrow_mut() = routes;
    }

    fn teardown_dhcp4_lease(&self) {
        if let Some((address, prefix_len)) = self.installed_dhcp4.borrow_mut().take() {
            self.installer.destroy_address(self.ifindex, AF_INET, &address.octets(), prefix_len);
        }
        for (dst, dst_prefix_len) in self.installed_dhcp4_routes.borrow_mut().drain(..) {
            self.installer.destroy_route(AF_INET, &dst, dst_prefix_len, self.ifindex);
        }
    }

    /// `dhcp6`'s wire protocol is out of scope (§1 Non-goals; no lease
    /// type exists for it yet), so there is nothing to translate —
    /// this only keeps the subscription alive so future lease support
    /// has somewhere to plug in.
    fn on_dhcp6_event(&self, event: &ClientEvent) {
        tracing::debug!(ifindex = self.ifindex, ?event, "dhcp6 event (no v6 lease translation implemented)");
    }

    /// ICMPv6 router advertisement decoding is out of scope (§1
    /// Non-goals); the engine only logs receipt so the `ndisc` client's
    /// events are observably consumed rather than silently dropped.
    fn on_ndisc_event(&self, event: &ClientEvent) {
        if matches!(event, ClientEvent::RouterAdvertisement) {
            tracing::debug!(ifindex = self.ifindex, "router advertisement received");
        }
    }

    /// Explicit start (§4.4): if the link already has `CARRIER`,
    /// perform the same actions as a carrier-gain edge; if it also
    /// has `IPV6LL`, start `ndisc` too.
    pub fn start(&self, initial_state: ObservedState) {
        self.apply_transition(ObservedState::empty(), initial_state);
        self.observed_state.set(initial_state);
    }

    /// Stop every client that is currently running.
    pub fn stop(&self) {
        self.ipv4ll.stop();
        self.dhcp4.stop();
        self.dhcp6.stop();
        self.ndisc.stop();
        self.observed_state.set(ObservedState::empty());
    }

    /// Feed a new observed link state (from the cache's link
    /// subscription, or a detach delivering the empty state) and
    /// drive client transitions (§4.4 steps 1-7).
    pub fn on_link_state(&self, new_state: ObservedState) {
        let old_state = self.observed_state.get();
        self.apply_transition(old_state, new_state);
        self.observed_state.set(new_state);
    }

    fn apply_transition(&self, old_state: ObservedState, new_state: ObservedState) {
        let gained = new_state & !old_state;
        let lost = old_state & !new_state;

        if gained.contains(ObservedState::CARRIER) {
            self.ipv4ll.start(self.ifindex, self.hw_addr, self.seed);
            self.dhcp4.start(self.ifindex, self.hw_addr, self.seed);
        }
        if lost.contains(ObservedState::CARRIER) {
            self.ipv4ll.stop();
            self.dhcp4.stop();
        }

        let ipv6ll_and_carrier_gained = new_state.contains(ObservedState::CARRIER | ObservedState::IPV6LL)
            && !old_state.contains(ObservedState::CARRIER | ObservedState::IPV6LL);
        let ipv6ll_and_carrier_lost = old_state.contains(ObservedState::CARRIER | ObservedState::IPV6LL)
            && !new_state.contains(ObservedState::CARRIER | ObservedState::IPV6LL);

        if ipv6ll_and_carrier_gained {
            self.ndisc.start(self.ifindex, self.hw_addr, self.seed);
        }
        if ipv6ll_and_carrier_lost {
            self.ndisc.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{Dhcp4Client, Dhcp6Client, Ipv4LinkLocal, RouterDiscoveryClient};
    use std::cell::RefCell;
    use std::time::SystemTime;

    #[derive(Default)]
    struct FakeInstaller {
        created: RefCell<Vec<(u32, u8, Vec<u8>, u8, Option<Vec<u8>>)>>,
        destroyed: RefCell<Vec<(u32, u8, Vec<u8>, u8)>>,
        routes_created: RefCell<Vec<(u8, Vec<u8>, u8, Option<Vec<u8>>, u32)>>,
        routes_destroyed: RefCell<Vec<(u8, Vec<u8>, u8, u32)>>,
    }

    impl AddressInstaller for Rc<FakeInstaller> {
        fn create_address(&self, ifindex: u32, family: u8, prefix: &[u8], prefix_len: u8, broadcast: Option<&[u8]>) {
            // Mirrors the real `Rc<rtnl::RtnlCache>` impl's contract: a
            // 2-byte slice for an AF_INET prefix would fail `to_ip_addr`
            // in production, so the fake enforces the same width here.
            if family == AF_INET {
                assert_eq!(prefix.len(), 4, "AF_INET address must be the full 4 bytes");
            }
            self.created
                .borrow_mut()
                .push((ifindex, family, prefix.to_vec(), prefix_len, broadcast.map(|b| b.to_vec())));
        }

        fn destroy_address(&self, ifindex: u32, family: u8, prefix: &[u8], prefix_len: u8) {
            if family == AF_INET {
                assert_eq!(prefix.len(), 4, "AF_INET address must be the full 4 bytes");
            }
            self.destroyed.borrow_mut().push((ifindex, family, prefix.to_vec(), prefix_len));
        }

        fn create_route(&self, family: u8, dst: &[u8], dst_prefix_len: u8, gateway: Option<&[u8]>, oif: u32) {
            self.routes_created
                .borrow_mut()
                .push((family, dst.to_vec(), dst_prefix_len, gateway.map(|g| g.to_vec()), oif));
        }

        fn destroy_route(&self, family: u8, dst: &[u8], dst_prefix_len: u8, oif: u32) {
            self.routes_destroyed.borrow_mut().push((family, dst.to_vec(), dst_prefix_len, oif));
        }
    }

    fn build_engine() -> (
        Rc<IpAcquisitionEngine<Rc<FakeInstaller>>>,
        Rc<FakeInstaller>,
        Rc<Ipv4LinkLocal>,
        Rc<Dhcp4Client>,
        Rc<RouterDiscoveryClient>,
    ) {
        let installer = Rc::new(FakeInstaller::default());
        let ipv4ll = Rc::new(Ipv4LinkLocal::new());
        let dhcp4 = Rc::new(Dhcp4Client::new());
        let dhcp6 = Rc::new(Dhcp6Client::new());
        let ndisc = Rc::new(RouterDiscoveryClient::new());

        let engine = IpAcquisitionEngine::new(
            3,
            [0, 1, 2, 3, 4, 5],
            0xDEAD_BEEF,
            installer.clone(),
            ipv4ll.clone(),
            dhcp4.clone(),
            dhcp6,
            ndisc.clone(),
        );

        (engine, installer, ipv4ll, dhcp4, ndisc)
    }

    #[test]
    fn carrier_gain_starts_ipv4ll_and_dhcp4_exactly_once() {
        let (engine, _installer, ipv4ll, dhcp4, _ndisc) = build_engine();

        engine.on_link_state(ObservedState::CARRIER);

        assert!(ipv4ll.is_running());
        assert!(dhcp4.is_running());
    }

    #[test]
    fn carrier_loss_stops_ipv4ll_and_dhcp4_exactly_once() {
        let (engine, _installer, ipv4ll, dhcp4, _ndisc) = build_engine();

        engine.on_link_state(ObservedState::CARRIER);
        engine.on_link_state(ObservedState::empty());

        assert!(!ipv4ll.is_running());
        assert!(!dhcp4.is_running());
    }

    #[test]
    fn ipv6ll_and_carrier_gain_starts_ndisc() {
        let (engine, _installer, _ipv4ll, _dhcp4, ndisc) = build_engine();

        engine.on_link_state(ObservedState::CARRIER);
        assert!(!ndisc.is_running());

        engine.on_link_state(ObservedState::CARRIER | ObservedState::IPV6LL);
        assert!(ndisc.is_running());
    }

    #[test]
    fn ipv4ll_bind_installs_the_full_four_byte_address_with_prefixlen_16_and_broadcast() {
        let (_engine, installer, ipv4ll, _dhcp4, _ndisc) = build_engine();

        ipv4ll.simulate_bind(Ipv4Addr::new(169, 254, 3, 4));

        let created = installer.created.borrow();
        assert_eq!(created.len(), 1);
        assert_eq!(
            created[0],
            (3, AF_INET, vec![169, 254, 3, 4], 16, Some(vec![169, 254, 255, 255]))
        );
    }

    #[test]
    fn ipv4ll_conflict_destroys_the_installed_address_with_the_full_four_bytes() {
        let (_engine, installer, ipv4ll, _dhcp4, _ndisc) = build_engine();

        ipv4ll.simulate_bind(Ipv4Addr::new(169, 254, 3, 4));
        ipv4ll.simulate_conflict();

        let destroyed = installer.destroyed.borrow();
        assert_eq!(destroyed.len(), 1);
        assert_eq!(destroyed[0], (3, AF_INET, vec![169, 254, 3, 4], 16));
    }

    #[test]
    fn explicit_start_with_carrier_already_set_starts_clients() {
        let (engine, _installer, ipv4ll, dhcp4, ndisc) = build_engine();

        engine.start(ObservedState::CARRIER | ObservedState::IPV6LL);

        assert!(ipv4ll.is_running());
        assert!(dhcp4.is_running());
        assert!(ndisc.is_running());
    }

    #[test]
    fn stop_stops_every_running_client() {
        let (engine, _installer, ipv4ll, dhcp4, ndisc) = build_engine();

        engine.start(ObservedState::CARRIER | ObservedState::IPV6LL);
        engine.stop();

        assert!(!ipv4ll.is_running());
        assert!(!dhcp4.is_running());
        assert!(!ndisc.is_running());
    }

    fn dhcpv4_ack_with_router_and_classless_route() -> Vec<u8> {
        // DHCPv4 header (op=BOOTREPLY, htype=ethernet, hlen=6) + magic
        // cookie + options: message-type=ACK, server-id, lease-time,
        // router, classless static route 0.0.0.0/0 via 192.0.2.254,
        // end. `yiaddr` (offset 16..20) carries the offered address.
        let mut raw = vec![0u8; 240];
        raw[0] = 2; // BOOTREPLY
        raw[1] = 1; // ethernet
        raw[2] = 6;
        raw[16..20].copy_from_slice(&[192, 0, 2, 10]);
        raw[236..240].copy_from_slice(&[99, 130, 83, 99]); // magic cookie

        let mut options = vec![53, 1, 5]; // message type: ACK
        options.extend_from_slice(&[54, 4, 192, 0, 2, 1]); // server identifier
        options.extend_from_slice(&[51, 4, 0, 0, 14, 16]); // lease time 3600
        options.extend_from_slice(&[3, 4, 192, 0, 2, 254]); // router
        options.extend_from_slice(&[121, 5, 0, 192, 0, 2, 254]); // classless 0.0.0.0/0 via 192.0.2.254
        options.push(255); // end

        raw.extend_from_slice(&options);
        raw
    }

    #[test]
    fn dhcp4_lease_bound_installs_address_and_router_route() {
        let (_engine, installer, _ipv4ll, dhcp4, _ndisc) = build_engine();

        let raw = dhcpv4_ack_with_router_and_classless_route();
        let lease = Lease::from_raw(SystemTime::now(), &raw).expect("well-formed lease");
        dhcp4.inject_lease(lease);

        let created = installer.created.borrow();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].2, vec![192, 0, 2, 10]);

        let routes = installer.routes_created.borrow();
        assert!(
            routes.iter().any(|(_, dst, len, gw, _)| dst.is_empty() && *len == 0 && gw.as_deref() == Some(&[192, 0, 2, 254][..])),
            "expected a default route via the lease's router"
        );
    }

    #[test]
    fn dhcp4_stop_tears_down_installed_address_and_routes() {
        let (_engine, installer, _ipv4ll, dhcp4, _ndisc) = build_engine();

        let raw = dhcpv4_ack_with_router_and_classless_route();
        let lease = Lease::from_raw(SystemTime::now(), &raw).expect("well-formed lease");
        dhcp4.inject_lease(lease);
        dhcp4.start(3, [0; 6], 0);
        dhcp4.stop();

        assert_eq!(installer.destroyed.borrow().len(), 1);
        assert!(!installer.routes_destroyed.borrow().is_empty());
    }
}
