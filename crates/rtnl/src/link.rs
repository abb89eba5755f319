//! Link object and its carrier/IPv6LL derived state.

use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkMessage, State};

bitflags::bitflags! {
    /// Derived state bits consumed by the address acquisition engine's
    /// `observed_state` transitions (§4.4). Kept separate from the raw
    /// kernel flags so the engine only ever reasons about the two
    /// conditions it cares about.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct ObservedState: u8 {
        const CARRIER = 0b01;
        const IPV6LL  = 0b10;
    }
}

/// One interface, keyed by `ifindex` (§4.3).
#[derive(Debug, Clone)]
pub struct Link {
    pub ifindex: u32,
    pub ifname: String,
    pub kind: Option<String>,
    pub address: Option<Vec<u8>>,
    pub mtu: Option<u32>,
    pub operstate_up: bool,
    pub carrier: bool,
    pub loopback: bool,
}

impl Link {
    pub fn from_message(msg: &LinkMessage) -> Self {
        let ifindex = msg.header.index;
        let flags = msg.header.flags;

        let mut ifname = String::new();
        let mut kind = None;
        let mut address = None;
        let mut mtu = None;
        let mut oper_state = State::Unknown;

        for attr in &msg.attributes {
            match attr {
                LinkAttribute::IfName(name) => ifname = name.clone(),
                LinkAttribute::Address(addr) => address = Some(addr.clone()),
                LinkAttribute::Mtu(value) => mtu = Some(*value),
                LinkAttribute::OperState(state) => oper_state = *state,
                LinkAttribute::LinkInfo(infos) => {
                    for info in infos {
                        if let netlink_packet_route::link::LinkInfo::Kind(k) = info {
                            kind = Some(format!("{k:?}"));
                        }
                    }
                }
                _ => {}
            }
        }

        // §3: CARRIER is true iff operstate is UP, or operstate is
        // UNKNOWN with LOWER_UP and not DORMANT.
        let carrier = match oper_state {
            State::Up => true,
            State::Unknown => flags.contains(LinkFlags::LowerUp) && !flags.contains(LinkFlags::Dormant),
            _ => false,
        };

        Self {
            ifindex,
            ifname,
            kind,
            address,
            mtu,
            operstate_up: flags.contains(LinkFlags::Up),
            carrier,
            loopback: flags.contains(LinkFlags::Loopback),
        }
    }

    /// Whether this link's IPv6 link-local address is known to have
    /// formed. The cache sets this by watching the address table for
    /// a `fe80::/10` entry on this ifindex rather than from anything
    /// present on the link message itself.
    pub fn observed_state(&self, ipv6_ll_formed: bool) -> ObservedState {
        let mut state = ObservedState::empty();
        if self.carrier {
            state |= ObservedState::CARRIER;
        }
        if ipv6_ll_formed {
            state |= ObservedState::IPV6LL;
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observed_state_combines_carrier_and_ipv6ll() {
        let link = Link {
            ifindex: 3,
            ifname: "eth0".into(),
            kind: None,
            address: None,
            mtu: None,
            operstate_up: true,
            carrier: true,
            loopback: false,
        };

        assert_eq!(link.observed_state(false), ObservedState::CARRIER);
        assert_eq!(
            link.observed_state(true),
            ObservedState::CARRIER | ObservedState::IPV6LL
        );
    }

    #[test]
    fn observed_state_empty_without_carrier() {
        let link = Link {
            ifindex: 3,
            ifname: "eth0".into(),
            kind: None,
            address: None,
            mtu: None,
            operstate_up: false,
            carrier: false,
            loopback: false,
        };
        assert_eq!(link.observed_state(true), ObservedState::IPV6LL);
    }

    fn message_with(flags: LinkFlags, attributes: Vec<LinkAttribute>) -> LinkMessage {
        let mut header = netlink_packet_route::link::LinkHeader::default();
        header.index = 3;
        header.flags = flags;
        LinkMessage { header, attributes }
    }

    #[test]
    fn carrier_true_when_operstate_is_up() {
        let msg = message_with(LinkFlags::empty(), vec![LinkAttribute::OperState(State::Up)]);
        assert!(Link::from_message(&msg).carrier);
    }

    #[test]
    fn carrier_true_when_operstate_unknown_with_lower_up_and_not_dormant() {
        let msg = message_with(LinkFlags::LowerUp, vec![LinkAttribute::OperState(State::Unknown)]);
        assert!(Link::from_message(&msg).carrier);
    }

    #[test]
    fn carrier_false_when_operstate_unknown_with_lower_up_and_dormant() {
        let msg = message_with(
            LinkFlags::LowerUp | LinkFlags::Dormant,
            vec![LinkAttribute::OperState(State::Unknown)],
        );
        assert!(!Link::from_message(&msg).carrier);
    }

    #[test]
    fn carrier_false_when_operstate_down() {
        let msg = message_with(LinkFlags::LowerUp, vec![LinkAttribute::OperState(State::Down)]);
        assert!(!Link::from_message(&msg).carrier);
    }
}
