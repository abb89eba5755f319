//! RTNL object cache: enumerate-then-multicast startup, keyed storage,
//! and per-object/global change subscription (§4.3).
//!
//! Mirrors the `device` crate's split between "local snapshot" and
//! "live feed" but over route-netlink instead of the uevent socket,
//! and adds synchronous mutation primitives the device side has no
//! analogue for.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP,
    NLM_F_EXCL, NLM_F_REQUEST,
};
use netlink_packet_route::address::{AddressAttribute, AddressHeader, AddressMessage};
use netlink_packet_route::link::{LinkHeader, LinkMessage};
use netlink_packet_route::route::{RouteAttribute, RouteHeader, RouteMessage};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use netlink_sys::constants::{RTMGRP_IPV4_IFADDR, RTMGRP_IPV4_ROUTE, RTMGRP_IPV6_IFADDR, RTMGRP_IPV6_ROUTE, RTMGRP_LINK};
use netlink_sys::{protocols::NETLINK_ROUTE, SocketAddr, TokioSocket};
use slot::{PendingRequests, Slot, SlotList};

use crate::address::{Address, AddressKey};
use crate::error::CacheError;
use crate::link::Link;
use crate::route::{Route, RouteKey};

#[derive(Debug, Clone)]
pub enum LinkEvent {
    New(Link),
    Del(Link),
}

#[derive(Debug, Clone)]
pub enum AddressEvent {
    New(Address),
    Del(Address),
}

#[derive(Debug, Clone)]
pub enum RouteEvent {
    New(Route),
    Del(Route),
}

#[derive(Debug, Clone)]
enum MutationReply {
    Ack,
    Error(i32),
}

/// Multicast groups the cache subscribes to once its initial dump
/// completes. All four are on by default; narrowing this is only
/// useful for tests that want to avoid touching real interfaces.
#[derive(Debug, Clone, Copy)]
pub struct Groups {
    pub link: bool,
    pub ipv4_addr: bool,
    pub ipv6_addr: bool,
    pub ipv4_route: bool,
    pub ipv6_route: bool,
}

impl Default for Groups {
    fn default() -> Self {
        Self {
            link: true,
            ipv4_addr: true,
            ipv6_addr: true,
            ipv4_route: true,
            ipv6_route: true,
        }
    }
}

/// Which object kind a [`RtnlCache::dump`] call is currently replaying,
/// so [`RtnlCache::apply`] knows which `enumerating_<kind>` flag gates
/// subscriber notification (§4.3/§4.7: dump replies feed the same add
/// handlers as live events, but must not wake subscribers).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DumpKind {
    Link,
    Address,
    Route,
}

pub struct RtnlCache {
    socket: RefCell<TokioSocket>,
    seq: Cell<u32>,

    links: RefCell<HashMap<u32, Link>>,
    addresses: RefCell<HashMap<AddressKey, Address>>,
    routes: RefCell<HashMap<RouteKey, Route>>,

    link_subs: SlotList<LinkEvent>,
    address_subs: SlotList<AddressEvent>,
    route_subs: SlotList<RouteEvent>,
    per_link_subs: RefCell<HashMap<u32, SlotList<LinkEvent>>>,

    enumerating_links: Cell<bool>,
    enumerating_addresses: Cell<bool>,
    enumerating_routes: Cell<bool>,

    pending: PendingRequests<u32, MutationReply>,
}

impl RtnlCache {
    /// Opens the netlink socket and subscribes to `groups`. Does not
    /// perform the initial dump; call [`Self::bootstrap`] for that
    /// once the cache is otherwise ready to receive events (the two
    /// are kept separate so a caller can finish wiring subscribers
    /// before the first batch of `New*` events can possibly fire).
    pub fn connect(groups: Groups) -> Result<Rc<Self>, CacheError> {
        let mut socket = TokioSocket::new(NETLINK_ROUTE)?;

        let mut mask = 0u32;
        if groups.link {
            mask |= 1 << (RTMGRP_LINK - 1);
        }
        if groups.ipv4_addr {
            mask |= 1 << (RTMGRP_IPV4_IFADDR - 1);
        }
        if groups.ipv6_addr {
            mask |= 1 << (RTMGRP_IPV6_IFADDR - 1);
        }
        if groups.ipv4_route {
            mask |= 1 << (RTMGRP_IPV4_ROUTE - 1);
        }
        if groups.ipv6_route {
            mask |= 1 << (RTMGRP_IPV6_ROUTE - 1);
        }

        socket.bind(&SocketAddr::new(0, mask))?;

        Ok(Rc::new(Self {
            socket: RefCell::new(socket),
            seq: Cell::new(1),
            links: RefCell::new(HashMap::new()),
            addresses: RefCell::new(HashMap::new()),
            routes: RefCell::new(HashMap::new()),
            link_subs: SlotList::new(),
            address_subs: SlotList::new(),
            route_subs: SlotList::new(),
            per_link_subs: RefCell::new(HashMap::new()),
            enumerating_links: Cell::new(false),
            enumerating_addresses: Cell::new(false),
            enumerating_routes: Cell::new(false),
            pending: PendingRequests::new(),
        }))
    }

    fn next_seq(&self) -> u32 {
        let seq = self.seq.get();
        self.seq.set(seq.wrapping_add(1));
        seq
    }

    /// Dump links, then addresses, then routes, applying each result
    /// directly into the cache. Per the design notes, a dump that
    /// errors partway through is not retried — the caller sees
    /// whatever was applied before the error and may choose to retry
    /// the whole bootstrap itself.
    pub async fn bootstrap(&self) -> Result<(), CacheError> {
        self.dump(
            DumpKind::Link,
            RouteNetlinkMessage::GetLink(LinkMessage {
                header: LinkHeader::default(),
                attributes: vec![],
            }),
        )
        .await?;
        self.dump(
            DumpKind::Address,
            RouteNetlinkMessage::GetAddress(AddressMessage {
                header: AddressHeader::default(),
                attributes: vec![],
            }),
        )
        .await?;
        self.dump(
            DumpKind::Route,
            RouteNetlinkMessage::GetRoute(RouteMessage {
                header: RouteHeader::default(),
                attributes: vec![],
            }),
        )
        .await?;
        Ok(())
    }

    fn enumerating_flag(&self, kind: DumpKind) -> &Cell<bool> {
        match kind {
            DumpKind::Link => &self.enumerating_links,
            DumpKind::Address => &self.enumerating_addresses,
            DumpKind::Route => &self.enumerating_routes,
        }
    }

    /// Sends a dump request and applies every reply through the same
    /// [`Self::apply`] the live feed uses, with `enumerating_<kind>` set
    /// for the duration so those replies populate the cache without
    /// waking subscribers (§4.3/§4.7).
    async fn dump(&self, kind: DumpKind, payload: RouteNetlinkMessage) -> Result<(), CacheError> {
        let seq = self.next_seq();
        let mut header = NetlinkHeader::default();
        header.sequence_number = seq;
        header.flags = NLM_F_REQUEST | NLM_F_DUMP;

        let mut msg = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
        msg.finalize();
        let mut buf = vec![0u8; msg.header.length as usize];
        msg.serialize(&mut buf);
        self.socket.borrow_mut().send(&buf, &SocketAddr::new(0, 0)).await?;

        self.enumerating_flag(kind).set(true);
        let result = loop {
            match self.recv_and_apply_one().await {
                Ok(true) => break Ok(()),
                Ok(false) => continue,
                Err(err) => break Err(err),
            }
        };
        self.enumerating_flag(kind).set(false);
        result
    }

    /// Runs forever, applying every multicast event the kernel sends.
    /// Intended to be spawned once on the event loop's `LocalSet`.
    pub async fn run(&self) -> Result<(), CacheError> {
        loop {
            self.recv_and_apply_one().await?;
        }
    }

    /// Receives and applies exactly one netlink message, returning
    /// `true` if it was the terminating `Done` of a dump.
    async fn recv_and_apply_one(&self) -> Result<bool, CacheError> {
        let mut buf = vec![0u8; 1 << 16];
        let (n, _addr) = self.socket.borrow_mut().recv_from(&mut buf).await?;
        let parsed = NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[..n])?;
        let seq = parsed.header.sequence_number;

        match parsed.payload {
            NetlinkPayload::Done(_) => return Ok(true),
            NetlinkPayload::Error(err) => {
                let code = err.code.map(|c| c.get()).unwrap_or(0);
                let reply = if code == 0 { MutationReply::Ack } else { MutationReply::Error(code) };
                self.pending.fire(&seq, &reply);
            }
            NetlinkPayload::InnerMessage(inner) => self.apply(inner),
            _ => {}
        }

        Ok(false)
    }

    /// Applies one decoded message to the cache, then notifies
    /// subscribers per §4.3's update rule: a key that already existed
    /// fires per-object subscribers only, a brand new key fires global
    /// subscribers only. Notification is skipped entirely while the
    /// corresponding `enumerating_<kind>` flag is set (dump replay).
    fn apply(&self, msg: RouteNetlinkMessage) {
        match msg {
            RouteNetlinkMessage::NewLink(m) => {
                let link = Link::from_message(&m);
                let ifindex = link.ifindex;
                let existed = self.links.borrow_mut().insert(ifindex, link.clone()).is_some();
                if self.enumerating_links.get() {
                    return;
                }
                if existed {
                    if let Some(subs) = self.per_link_subs.borrow().get(&ifindex) {
                        subs.notify(&LinkEvent::New(link));
                    }
                } else {
                    self.link_subs.notify(&LinkEvent::New(link));
                }
            }
            RouteNetlinkMessage::DelLink(m) => {
                let link = Link::from_message(&m);
                let ifindex = link.ifindex;
                self.links.borrow_mut().remove(&ifindex);
                if self.enumerating_links.get() {
                    return;
                }
                self.link_subs.notify(&LinkEvent::Del(link.clone()));
                if let Some(subs) = self.per_link_subs.borrow().get(&ifindex) {
                    subs.notify(&LinkEvent::Del(link));
                }
            }
            RouteNetlinkMessage::NewAddress(m) => {
                let addr = Address::from_message(&m);
                let existed = self
                    .addresses
                    .borrow_mut()
                    .insert(addr.key.clone(), addr.clone())
                    .is_some();
                if self.enumerating_addresses.get() || existed {
                    return;
                }
                self.address_subs.notify(&AddressEvent::New(addr));
            }
            RouteNetlinkMessage::DelAddress(m) => {
                let addr = Address::from_message(&m);
                self.addresses.borrow_mut().remove(&addr.key);
                if self.enumerating_addresses.get() {
                    return;
                }
                self.address_subs.notify(&AddressEvent::Del(addr));
            }
            RouteNetlinkMessage::NewRoute(m) => {
                let route = Route::from_message(&m);
                let existed = self
                    .routes
                    .borrow_mut()
                    .insert(route.key.clone(), route.clone())
                    .is_some();
                if self.enumerating_routes.get() || existed {
                    return;
                }
                self.route_subs.notify(&RouteEvent::New(route));
            }
            RouteNetlinkMessage::DelRoute(m) => {
                let route = Route::from_message(&m);
                self.routes.borrow_mut().remove(&route.key);
                if self.enumerating_routes.get() {
                    return;
                }
                self.route_subs.notify(&RouteEvent::Del(route));
            }
            _ => {}
        }
    }

    pub fn link(&self, ifindex: u32) -> Option<Link> {
        self.links.borrow().get(&ifindex).cloned()
    }

    pub fn links(&self) -> Vec<Link> {
        self.links.borrow().values().cloned().collect()
    }

    pub fn addresses_for(&self, ifindex: u32) -> Vec<Address> {
        self.addresses
            .borrow()
            .values()
            .filter(|a| a.key.ifindex == ifindex)
            .cloned()
            .collect()
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.borrow().values().cloned().collect()
    }

    /// Whether `ifindex` currently has an observed IPv6 link-local
    /// address, feeding the `IPV6LL` bit of the engine's
    /// `observed_state` (§4.4).
    pub fn has_ipv6_link_local(&self, ifindex: u32) -> bool {
        self.addresses
            .borrow()
            .values()
            .any(|a| a.key.ifindex == ifindex && a.is_ipv6_link_local())
    }

    pub fn subscribe_links<F>(&self, callback: F) -> Slot<LinkEvent>
    where
        F: FnMut(&LinkEvent) + 'static,
    {
        self.link_subs.subscribe(callback)
    }

    pub fn subscribe_addresses<F>(&self, callback: F) -> Slot<AddressEvent>
    where
        F: FnMut(&AddressEvent) + 'static,
    {
        self.address_subs.subscribe(callback)
    }

    pub fn subscribe_routes<F>(&self, callback: F) -> Slot<RouteEvent>
    where
        F: FnMut(&RouteEvent) + 'static,
    {
        self.route_subs.subscribe(callback)
    }

    pub fn subscribe_link<F>(&self, ifindex: u32, callback: F) -> Slot<LinkEvent>
    where
        F: FnMut(&LinkEvent) + 'static,
    {
        self.per_link_subs
            .borrow_mut()
            .entry(ifindex)
            .or_insert_with(SlotList::new)
            .subscribe(callback)
    }

    async fn request(&self, payload: RouteNetlinkMessage, flags: u16) -> Result<(), CacheError> {
        let seq = self.next_seq();
        let mut header = NetlinkHeader::default();
        header.sequence_number = seq;
        header.flags = flags;

        let mut msg = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
        msg.finalize();
        let mut buf = vec![0u8; msg.header.length as usize];
        msg.serialize(&mut buf);

        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = RefCell::new(Some(tx));
        let _slot = self.pending.register(seq, move |reply: &MutationReply| {
            if let Some(tx) = tx.borrow_mut().take() {
                let _ = tx.send(reply.clone());
            }
        });

        self.socket.borrow_mut().send(&buf, &SocketAddr::new(0, 0)).await?;

        match rx.await {
            Ok(MutationReply::Ack) => Ok(()),
            Ok(MutationReply::Error(code)) => Err(CacheError::Netlink { seq, code }),
            Err(_) => Err(CacheError::Timeout(seq)),
        }
    }

    /// Create (`RTM_NEWADDR`, create+excl) an address on `ifindex`.
    /// `family` is `AF_INET`/`AF_INET6`; `prefix` is the address bytes
    /// matching that family's width. Per §4.3's attribute-mapping
    /// policy: `IFA_LOCAL` is always emitted; `IFA_ADDRESS` mirrors it
    /// (no point-to-point peer concept at this call boundary);
    /// `IFA_BROADCAST` is emitted only when `broadcast` is `Some` and
    /// non-zero.
    pub async fn create_address(
        &self,
        ifindex: u32,
        family: u8,
        prefix: &[u8],
        prefix_len: u8,
        broadcast: Option<&[u8]>,
    ) -> Result<(), CacheError> {
        let addr = to_ip_addr(family, prefix)?;
        let mut header = AddressHeader::default();
        header.family = AddressFamily::from(family);
        header.prefix_len = prefix_len;
        header.index = ifindex;

        let mut attributes = vec![AddressAttribute::Local(addr), AddressAttribute::Address(addr)];
        if let Some(bytes) = broadcast {
            if bytes.iter().any(|b| *b != 0) {
                attributes.push(AddressAttribute::Broadcast(to_ip_addr(family, bytes)?));
            }
        }

        let msg = AddressMessage { header, attributes };

        self.request(
            RouteNetlinkMessage::NewAddress(msg),
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        )
        .await
    }

    pub async fn destroy_address(
        &self,
        ifindex: u32,
        family: u8,
        prefix: &[u8],
        prefix_len: u8,
    ) -> Result<(), CacheError> {
        let addr = to_ip_addr(family, prefix)?;
        let mut header = AddressHeader::default();
        header.family = AddressFamily::from(family);
        header.prefix_len = prefix_len;
        header.index = ifindex;

        let msg = AddressMessage {
            header,
            attributes: vec![AddressAttribute::Local(addr), AddressAttribute::Address(addr)],
        };

        self.request(RouteNetlinkMessage::DelAddress(msg), NLM_F_REQUEST | NLM_F_ACK)
            .await
    }

    /// Create a route. `dst` empty means the default route. A
    /// `gateway` of `None` installs an on-link (direct) route.
    pub async fn create_route(
        &self,
        family: u8,
        dst: &[u8],
        dst_prefix_len: u8,
        gateway: Option<&[u8]>,
        oif: u32,
    ) -> Result<(), CacheError> {
        let mut header = RouteHeader::default();
        header.address_family = AddressFamily::from(family);
        header.destination_prefix_length = dst_prefix_len;

        let mut attributes = vec![RouteAttribute::Oif(oif)];
        if !dst.is_empty() {
            attributes.push(RouteAttribute::Destination(to_ip_addr(family, dst)?));
        }
        if let Some(gw) = gateway {
            attributes.push(RouteAttribute::Gateway(to_ip_addr(family, gw)?));
        }

        let msg = RouteMessage { header, attributes };

        self.request(
            RouteNetlinkMessage::NewRoute(msg),
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        )
        .await
    }

    pub async fn destroy_route(
        &self,
        family: u8,
        dst: &[u8],
        dst_prefix_len: u8,
        oif: u32,
    ) -> Result<(), CacheError> {
        let mut header = RouteHeader::default();
        header.address_family = AddressFamily::from(family);
        header.destination_prefix_length = dst_prefix_len;

        let mut attributes = vec![RouteAttribute::Oif(oif)];
        if !dst.is_empty() {
            attributes.push(RouteAttribute::Destination(to_ip_addr(family, dst)?));
        }

        let msg = RouteMessage { header, attributes };

        self.request(RouteNetlinkMessage::DelRoute(msg), NLM_F_REQUEST | NLM_F_ACK)
            .await
    }
}

fn to_ip_addr(family: u8, bytes: &[u8]) -> Result<std::net::IpAddr, CacheError> {
    match family as i32 {
        libc::AF_INET => {
            let arr: [u8; 4] = bytes.try_into().map_err(|_| {
                CacheError::Decode(netlink_packet_utils::DecodeError::from("expected 4 address bytes for AF_INET"))
            })?;
            Ok(std::net::IpAddr::V4(std::net::Ipv4Addr::from(arr)))
        }
        libc::AF_INET6 => {
            let arr: [u8; 16] = bytes.try_into().map_err(|_| {
                CacheError::Decode(netlink_packet_utils::DecodeError::from("expected 16 address bytes for AF_INET6"))
            })?;
            Ok(std::net::IpAddr::V6(std::net::Ipv6Addr::from(arr)))
        }
        _ => Err(CacheError::Decode(netlink_packet_utils::DecodeError::from("unsupported address family"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A cache with a real (but never bound or used for I/O) netlink
    /// socket, for exercising `apply` directly without going through
    /// `recv_and_apply_one`.
    fn test_cache() -> RtnlCache {
        RtnlCache {
            socket: RefCell::new(TokioSocket::new(NETLINK_ROUTE).expect("open netlink socket")),
            seq: Cell::new(1),
            links: RefCell::new(HashMap::new()),
            addresses: RefCell::new(HashMap::new()),
            routes: RefCell::new(HashMap::new()),
            link_subs: SlotList::new(),
            address_subs: SlotList::new(),
            route_subs: SlotList::new(),
            per_link_subs: RefCell::new(HashMap::new()),
            enumerating_links: Cell::new(false),
            enumerating_addresses: Cell::new(false),
            enumerating_routes: Cell::new(false),
            pending: PendingRequests::new(),
        }
    }

    fn link_message(ifindex: u32) -> LinkMessage {
        let mut header = LinkHeader::default();
        header.index = ifindex;
        LinkMessage { header, attributes: vec![] }
    }

    fn address_message(ifindex: u32, octets: [u8; 4]) -> AddressMessage {
        let mut header = AddressHeader::default();
        header.family = AddressFamily::Inet;
        header.prefix_len = 24;
        header.index = ifindex;
        AddressMessage {
            header,
            attributes: vec![AddressAttribute::Local(std::net::IpAddr::V4(std::net::Ipv4Addr::from(octets)))],
        }
    }

    #[test]
    fn redelivering_the_same_new_link_fires_global_add_only_once() {
        let cache = test_cache();
        let adds = Rc::new(RefCell::new(0u32));
        let adds_inner = adds.clone();
        let _slot = cache.subscribe_links(move |event| {
            if matches!(event, LinkEvent::New(_)) {
                *adds_inner.borrow_mut() += 1;
            }
        });

        cache.apply(RouteNetlinkMessage::NewLink(link_message(3)));
        cache.apply(RouteNetlinkMessage::NewLink(link_message(3)));

        assert_eq!(*adds.borrow(), 1, "global subscribers must see exactly one add, never two");
        assert!(cache.link(3).is_some());
    }

    #[test]
    fn redelivering_the_same_new_link_routes_the_second_delivery_to_per_link_subscribers_only() {
        let cache = test_cache();
        let global_adds = Rc::new(RefCell::new(0u32));
        let per_link_adds = Rc::new(RefCell::new(0u32));
        let global_inner = global_adds.clone();
        let per_link_inner = per_link_adds.clone();

        let _global_slot = cache.subscribe_links(move |_| *global_inner.borrow_mut() += 1);
        let _per_link_slot = cache.subscribe_link(3, move |_| *per_link_inner.borrow_mut() += 1);

        cache.apply(RouteNetlinkMessage::NewLink(link_message(3)));
        assert_eq!(*global_adds.borrow(), 1);
        assert_eq!(*per_link_adds.borrow(), 0, "first delivery is a new key, only global subscribers fire");

        cache.apply(RouteNetlinkMessage::NewLink(link_message(3)));
        assert_eq!(*global_adds.borrow(), 1, "second delivery is an existing key, global must not fire again");
        assert_eq!(*per_link_adds.borrow(), 1, "second delivery is an existing key, per-link subscribers fire");
    }

    #[test]
    fn dump_phase_suppresses_subscriber_notifications_but_still_populates_the_cache() {
        let cache = test_cache();
        let fired = Rc::new(RefCell::new(0u32));
        let fired_inner = fired.clone();
        let _slot = cache.subscribe_links(move |_| *fired_inner.borrow_mut() += 1);

        cache.enumerating_links.set(true);
        cache.apply(RouteNetlinkMessage::NewLink(link_message(5)));
        cache.enumerating_links.set(false);

        assert_eq!(*fired.borrow(), 0, "dump replies must not wake subscribers");
        assert!(cache.link(5).is_some(), "dump replies must still populate the cache");
    }

    #[test]
    fn redelivering_the_same_new_address_notifies_global_subscribers_only_once() {
        let cache = test_cache();
        let adds = Rc::new(RefCell::new(0u32));
        let adds_inner = adds.clone();
        let _slot = cache.subscribe_addresses(move |event| {
            if matches!(event, AddressEvent::New(_)) {
                *adds_inner.borrow_mut() += 1;
            }
        });

        cache.apply(RouteNetlinkMessage::NewAddress(address_message(3, [10, 0, 0, 1])));
        cache.apply(RouteNetlinkMessage::NewAddress(address_message(3, [10, 0, 0, 1])));

        assert_eq!(*adds.borrow(), 1);
        assert_eq!(cache.addresses_for(3).len(), 1);
    }
}
