//! Route object and its cache key.

use netlink_packet_route::route::{RouteAttribute, RouteMessage};

/// Identity key for a route entry (§4.3). Two routes are the same
/// entry if they agree on family, table, priority (metric),
/// destination prefix length, the tie-break field (`tos` for IPv4,
/// output interface for IPv6 — the kernel itself disambiguates this
/// way), and the normalised destination prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub family: u8,
    pub table: u32,
    pub priority: u32,
    pub dst_prefix_len: u8,
    pub tie_break: u32,
    pub dst: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Route {
    pub key: RouteKey,
    pub gateway: Option<Vec<u8>>,
    pub oif: Option<u32>,
    pub scope: u8,
    pub protocol: u8,
}

impl Route {
    pub fn from_message(msg: &RouteMessage) -> Self {
        let family = u8::from(msg.header.address_family);
        let table = msg.header.table as u32;
        let dst_prefix_len = msg.header.destination_prefix_length;

        let mut priority = 0u32;
        let mut tos_or_oif = 0u32;
        let mut dst = Vec::new();
        let mut gateway = None;
        let mut oif = None;
        let mut table_attr = None;

        for attr in &msg.attributes {
            match attr {
                RouteAttribute::Priority(p) => priority = *p,
                RouteAttribute::Destination(addr) => dst = addr_bytes(addr),
                RouteAttribute::Gateway(addr) => gateway = Some(addr_bytes(addr)),
                RouteAttribute::Oif(idx) => {
                    oif = Some(*idx);
                    tos_or_oif = *idx;
                }
                RouteAttribute::Table(t) => table_attr = Some(*t),
                _ => {}
            }
        }

        let table = table_attr.unwrap_or(table);
        if family == libc::AF_INET as u8 {
            tos_or_oif = msg.header.tos as u32;
        }

        Self {
            key: RouteKey {
                family,
                table,
                priority,
                dst_prefix_len,
                tie_break: tos_or_oif,
                dst,
            },
            gateway,
            oif,
            scope: u8::from(msg.header.scope),
            protocol: u8::from(msg.header.protocol),
        }
    }
}

fn addr_bytes(addr: &std::net::IpAddr) -> Vec<u8> {
    match addr {
        std::net::IpAddr::V4(v4) => v4.octets().to_vec(),
        std::net::IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}
