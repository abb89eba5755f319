//! Address object and its cache key.

use netlink_packet_route::address::{AddressAttribute, AddressFlags, AddressMessage};

/// Identity key for an address entry (§4.3): an address is unique per
/// interface, address family, and the prefix it names — two
/// equal-looking addresses with different prefix lengths are distinct
/// entries, matching how the kernel itself treats them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressKey {
    pub ifindex: u32,
    pub family: u8,
    pub prefix_len: u8,
    pub prefix: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Address {
    pub key: AddressKey,
    pub local: Option<Vec<u8>>,
    pub broadcast: Option<Vec<u8>>,
    pub label: Option<String>,
    pub flags: AddressFlags,
}

impl Address {
    pub fn from_message(msg: &AddressMessage) -> Self {
        let ifindex = msg.header.index;
        let family = u8::from(msg.header.family);
        let prefix_len = msg.header.prefix_len;

        let mut address = None;
        let mut local = None;
        let mut broadcast = None;
        let mut label = None;
        // The header's own `flags` byte carries the legacy low-8-bit
        // IFA_F_* flags (tentative/deprecated live here); IFA_FLAGS
        // carries the full 32-bit set and supersedes it when present.
        let mut flags = msg.header.flags;

        for attr in &msg.attributes {
            match attr {
                AddressAttribute::Address(addr) => address = Some(addr_bytes(addr)),
                AddressAttribute::Local(addr) => local = Some(addr_bytes(addr)),
                AddressAttribute::Broadcast(addr) => broadcast = Some(addr_bytes(addr)),
                AddressAttribute::Label(l) => label = Some(l.clone()),
                AddressAttribute::Flags(f) => flags = *f,
                _ => {}
            }
        }

        // The canonical prefix is `address` (the destination/peer
        // form used for point-to-point links) falling back to
        // `local` so plain host addresses still key correctly.
        let prefix = address.or_else(|| local.clone()).unwrap_or_default();

        Self {
            key: AddressKey {
                ifindex,
                family,
                prefix_len,
                prefix,
            },
            local,
            broadcast,
            label,
            flags,
        }
    }

    /// True if this address falls in the IPv6 link-local range
    /// `fe80::/10` and is neither tentative (duplicate-address
    /// detection still in progress) nor deprecated, used to derive the
    /// `IPV6LL` observed-state bit (§3).
    pub fn is_ipv6_link_local(&self) -> bool {
        self.key.family == libc::AF_INET6 as u8
            && self.key.prefix.len() == 16
            && self.key.prefix[0] == 0xfe
            && (self.key.prefix[1] & 0xc0) == 0x80
            && !self.flags.contains(AddressFlags::Tentative)
            && !self.flags.contains(AddressFlags::Deprecated)
    }
}

fn addr_bytes(addr: &std::net::IpAddr) -> Vec<u8> {
    match addr {
        std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
        std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn link_local_key() -> AddressKey {
        AddressKey {
            ifindex: 3,
            family: libc::AF_INET6 as u8,
            prefix_len: 64,
            prefix: vec![0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
        }
    }

    #[test]
    fn detects_ipv6_link_local() {
        let addr = Address {
            key: link_local_key(),
            local: None,
            broadcast: None,
            label: None,
            flags: AddressFlags::empty(),
        };
        assert!(addr.is_ipv6_link_local());
    }

    #[test]
    fn global_ipv6_is_not_link_local() {
        let key = AddressKey {
            ifindex: 3,
            family: libc::AF_INET6 as u8,
            prefix_len: 64,
            prefix: vec![0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1],
        };
        let addr = Address {
            key,
            local: None,
            broadcast: None,
            label: None,
            flags: AddressFlags::empty(),
        };
        assert!(!addr.is_ipv6_link_local());
    }

    #[test]
    fn tentative_link_local_is_not_reported_as_formed() {
        let addr = Address {
            key: link_local_key(),
            local: None,
            broadcast: None,
            label: None,
            flags: AddressFlags::Tentative,
        };
        assert!(!addr.is_ipv6_link_local());
    }

    #[test]
    fn deprecated_link_local_is_not_reported_as_formed() {
        let addr = Address {
            key: link_local_key(),
            local: None,
            broadcast: None,
            label: None,
            flags: AddressFlags::Deprecated,
        };
        assert!(!addr.is_ipv6_link_local());
    }

    #[test]
    fn from_message_prefers_flags_attribute_over_header_flags() {
        let mut header = netlink_packet_route::address::AddressHeader::default();
        header.family = netlink_packet_route::AddressFamily::Inet6;
        header.prefix_len = 64;
        header.flags = AddressFlags::Tentative;

        let msg = netlink_packet_route::address::AddressMessage {
            header,
            attributes: vec![
                AddressAttribute::Address(std::net::IpAddr::V6(std::net::Ipv6Addr::new(
                    0xfe80, 0, 0, 0, 0, 0, 0, 1,
                ))),
                AddressAttribute::Flags(AddressFlags::empty()),
            ],
        };

        let addr = Address::from_message(&msg);
        assert!(addr.is_ipv6_link_local());
    }
}
