use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::SystemTime;

use binbuf::prelude::*;
use thiserror::Error;

use crate::constants;
use crate::types::Message;

const TAG_SUBNET_MASK: u8 = 1;
const TAG_ROUTER: u8 = 3;
const TAG_DNS: u8 = 6;
const TAG_HOST_NAME: u8 = 12;
const TAG_DOMAIN_NAME: u8 = 15;
const TAG_ROOT_PATH: u8 = 17;
const TAG_BROADCAST: u8 = 28;
const TAG_STATIC_ROUTES: u8 = 33;
const TAG_NTP: u8 = 42;
const TAG_VENDOR_SPECIFIC: u8 = 43;
const TAG_INTERFACE_MTU: u8 = 26;
const TAG_TZ_DATABASE: u8 = 101;
const TAG_LEASE_TIME: u8 = 51;
const TAG_MESSAGE_TYPE: u8 = 53;
const TAG_SERVER_IDENTIFIER: u8 = 54;
const TAG_RENEWAL_TIME: u8 = 58;
const TAG_REBINDING_TIME: u8 = 59;
const TAG_CLASSLESS_STATIC_ROUTES: u8 = 121;
const TAG_END: u8 = 255;
const TAG_PAD: u8 = 0;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("dhcp reply carries no message (offered address, server identifier, or lifetime is zero)")]
    NoMessage,

    #[error("classless static route option truncated")]
    TruncatedRoute,

    #[error("unrecognised dhcp message type byte {0}")]
    UnrecognisedMessageType(u8),

    #[error("failed to decode dhcp message: {0}")]
    Decode(#[from] BufferError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseType {
    Offer,
    Ack,
    Nak,
}

impl TryFrom<u8> for LeaseType {
    type Error = LeaseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(Self::Offer),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            other => Err(LeaseError::UnrecognisedMessageType(other)),
        }
    }
}

/// A destination/gateway pair from either the classful (tag 33) or
/// classless (RFC 3442, tag 121) static route options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRoute {
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
}

#[derive(Debug)]
struct Inner {
    raw: Vec<u8>,
    received_at: SystemTime,
    lease_type: LeaseType,

    address: Ipv4Addr,
    server_identifier: Ipv4Addr,
    lifetime: u32,
    t1: u32,
    t2: u32,

    subnet_mask: Ipv4Addr,
    have_subnet_mask: bool,
    broadcast: Option<Ipv4Addr>,
    router: Option<Ipv4Addr>,
    dns: Vec<Ipv4Addr>,
    ntp: Vec<Ipv4Addr>,
    static_routes: Vec<StaticRoute>,
    mtu: u16,
    domain_name: Option<String>,
    host_name: Option<String>,
    root_path: Option<String>,
    timezone: Option<String>,
    vendor_specific: Option<Vec<u8>>,
    private_options: Vec<(u8, Vec<u8>)>,
}

/// A decoded DHCPv4 lease, reference-counted and immutable after
/// construction (§4.5). Retains a verbatim copy of the reply bytes
/// alongside the parsed view.
#[derive(Debug, Clone)]
pub struct Lease(Rc<Inner>);

impl Lease {
    /// Decode a raw DHCPv4 reply datagram received at `received_at`.
    pub fn from_raw(received_at: SystemTime, raw: &[u8]) -> Result<Self, LeaseError> {
        let mut buf = ReadBuffer::new(raw);
        let message = Message::read::<BigEndian>(&mut buf)?;

        let mut lease_type = None;
        let mut server_identifier = None;
        let mut lifetime = None;
        let mut t1 = 0u32;
        let mut t2 = 0u32;
        let mut subnet_mask = None;
        let mut broadcast = None;
        let mut router = None;
        let mut dns = Vec::new();
        let mut ntp = Vec::new();
        let mut static_routes = Vec::new();
        let mut mtu = None;
        let mut domain_name = None;
        let mut host_name = None;
        let mut root_path = None;
        let mut timezone = None;
        let mut vendor_specific = None;
        let mut private_options: Vec<(u8, Vec<u8>)> = Vec::new();

        let mut options = message.options();
        while let Some((tag, len)) = next_tlv(options) {
            if tag == TAG_PAD {
                options = &options[1..];
                continue;
            }
            if tag == TAG_END {
                break;
            }

            let value = &options[2..2 + len];
            options = &options[2 + len..];

            match tag {
                TAG_SUBNET_MASK if value.len() == 4 => subnet_mask = Some(ipv4(value)),
                TAG_BROADCAST if value.len() == 4 => broadcast = Some(ipv4(value)),
                TAG_ROUTER if value.len() >= 4 => router = Some(ipv4(&value[..4])),
                TAG_SERVER_IDENTIFIER if value.len() == 4 => server_identifier = Some(ipv4(value)),
                TAG_DNS if value.len() % 4 == 0 => dns = ipv4_list(value),
                TAG_NTP if value.len() % 4 == 0 => ntp = ipv4_list(value),
                TAG_LEASE_TIME if value.len() == 4 => lifetime = Some(u32_be(value).max(1)),
                TAG_RENEWAL_TIME if value.len() == 4 => t1 = u32_be(value).max(1),
                TAG_REBINDING_TIME if value.len() == 4 => t2 = u32_be(value).max(1),
                TAG_INTERFACE_MTU if value.len() == 2 => {
                    let raw_mtu = u16::from_be_bytes([value[0], value[1]]);
                    mtu = Some(raw_mtu.max(constants::MIN_INTERFACE_MTU));
                }
                TAG_MESSAGE_TYPE if value.len() == 1 => {
                    lease_type = Some(LeaseType::try_from(value[0])?);
                }
                TAG_STATIC_ROUTES if value.len() % 8 == 0 => {
                    for pair in value.chunks_exact(8) {
                        let dest = ipv4(&pair[..4]);
                        let gateway = ipv4(&pair[4..]);
                        match classful_prefix_len(dest) {
                            Some(prefix_len) => static_routes.push(StaticRoute {
                                destination: dest,
                                prefix_len,
                                gateway,
                            }),
                            None => {
                                tracing::debug!(
                                    destination = %dest,
                                    "skipping classful static route with indeterminate class"
                                );
                            }
                        }
                    }
                }
                TAG_CLASSLESS_STATIC_ROUTES => {
                    static_routes.extend(parse_classless_routes(value)?);
                }
                TAG_DOMAIN_NAME => {
                    if let Some(name) = sanitize_dns_name(value) {
                        domain_name = Some(name);
                    }
                }
                TAG_HOST_NAME => {
                    host_name = String::from_utf8(value.to_vec()).ok();
                }
                TAG_ROOT_PATH => {
                    root_path = String::from_utf8(value.to_vec()).ok();
                }
                TAG_TZ_DATABASE => {
                    if let Ok(zone) = String::from_utf8(value.to_vec()) {
                        if is_valid_tz_zone(&zone) {
                            timezone = Some(zone);
                        }
                    }
                }
                TAG_VENDOR_SPECIFIC => vendor_specific = Some(value.to_vec()),
                other if other >= constants::PRIVATE_OPTION_RANGE_START => {
                    if !private_options.iter().any(|(t, _)| *t == other) {
                        private_options.push((other, value.to_vec()));
                    }
                }
                _ => {}
            }
        }

        let address = message.addrs().yiaddr;
        let server_identifier = server_identifier.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let lifetime = lifetime.unwrap_or(0);

        if address.is_unspecified() || server_identifier.is_unspecified() || lifetime == 0 {
            return Err(LeaseError::NoMessage);
        }

        let have_subnet_mask = subnet_mask.is_some();
        let subnet_mask = subnet_mask.unwrap_or_else(|| classful_subnet_mask(address));

        let lease_type = lease_type.unwrap_or(LeaseType::Ack);

        Ok(Self(Rc::new(Inner {
            raw: raw.to_vec(),
            received_at,
            lease_type,
            address,
            server_identifier,
            lifetime,
            t1,
            t2,
            subnet_mask,
            have_subnet_mask,
            broadcast,
            router,
            dns,
            ntp,
            static_routes,
            mtu: mtu.unwrap_or(constants::MIN_INTERFACE_MTU),
            domain_name,
            host_name,
            root_path,
            timezone,
            vendor_specific,
            private_options,
        })))
    }

    pub fn lease_type(&self) -> LeaseType {
        self.0.lease_type
    }

    pub fn address(&self) -> Ipv4Addr {
        self.0.address
    }

    pub fn server_identifier(&self) -> Ipv4Addr {
        self.0.server_identifier
    }

    pub fn lifetime(&self) -> u32 {
        self.0.lifetime
    }

    pub fn t1(&self) -> u32 {
        self.0.t1
    }

    pub fn t2(&self) -> u32 {
        self.0.t2
    }

    pub fn subnet_mask(&self) -> Ipv4Addr {
        self.0.subnet_mask
    }

    pub fn has_explicit_subnet_mask(&self) -> bool {
        self.0.have_subnet_mask
    }

    pub fn broadcast(&self) -> Option<Ipv4Addr> {
        self.0.broadcast
    }

    pub fn router(&self) -> Option<Ipv4Addr> {
        self.0.router
    }

    pub fn dns(&self) -> &[Ipv4Addr] {
        &self.0.dns
    }

    pub fn ntp(&self) -> &[Ipv4Addr] {
        &self.0.ntp
    }

    pub fn static_routes(&self) -> &[StaticRoute] {
        &self.0.static_routes
    }

    pub fn mtu(&self) -> u16 {
        self.0.mtu
    }

    pub fn domain_name(&self) -> Option<&str> {
        self.0.domain_name.as_deref()
    }

    pub fn host_name(&self) -> Option<&str> {
        self.0.host_name.as_deref()
    }

    pub fn root_path(&self) -> Option<&str> {
        self.0.root_path.as_deref()
    }

    pub fn timezone(&self) -> Option<&str> {
        self.0.timezone.as_deref()
    }

    pub fn vendor_specific(&self) -> Option<&[u8]> {
        self.0.vendor_specific.as_deref()
    }

    pub fn private_options(&self) -> &[(u8, Vec<u8>)] {
        &self.0.private_options
    }

    pub fn received_at(&self) -> SystemTime {
        self.0.received_at
    }

    pub fn raw(&self) -> &[u8] {
        &self.0.raw
    }
}

fn next_tlv(options: &[u8]) -> Option<(u8, usize)> {
    let tag = *options.first()?;
    if tag == TAG_PAD || tag == TAG_END {
        return Some((tag, 0));
    }
    let len = *options.get(1)? as usize;
    if options.len() < 2 + len {
        return None;
    }
    Some((tag, len))
}

fn ipv4(bytes: &[u8]) -> Ipv4Addr {
    Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])
}

fn ipv4_list(bytes: &[u8]) -> Vec<Ipv4Addr> {
    bytes.chunks_exact(4).map(ipv4).collect()
}

fn u32_be(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Classful default prefix length for a destination address, per the
/// historic A/B/C class boundaries. Returns `None` for class D/E
/// addresses, whose class-based route semantics are undefined.
fn classful_prefix_len(addr: Ipv4Addr) -> Option<u8> {
    let first_octet = addr.octets()[0];
    match first_octet {
        0..=127 => Some(8),
        128..=191 => Some(16),
        192..=223 => Some(24),
        _ => None,
    }
}

fn classful_subnet_mask(addr: Ipv4Addr) -> Ipv4Addr {
    let prefix_len = classful_prefix_len(addr).unwrap_or(24);
    let mask = u32::MAX.checked_shl(32 - prefix_len as u32).unwrap_or(0);
    Ipv4Addr::from(mask)
}

/// Parses the RFC 3442 classless static route option: a sequence of
/// `(prefix-len, significant octets of destination, 4-byte gateway)`
/// entries, where the destination is truncated to `ceil(prefix_len/8)`
/// octets.
fn parse_classless_routes(mut value: &[u8]) -> Result<Vec<StaticRoute>, LeaseError> {
    let mut routes = Vec::new();

    while !value.is_empty() {
        let prefix_len = value[0];
        value = &value[1..];

        let significant_octets = (prefix_len as usize).div_ceil(8);
        if value.len() < significant_octets + 4 {
            return Err(LeaseError::TruncatedRoute);
        }

        let mut octets = [0u8; 4];
        octets[..significant_octets].copy_from_slice(&value[..significant_octets]);
        value = &value[significant_octets..];

        let gateway = ipv4(&value[..4]);
        value = &value[4..];

        routes.push(StaticRoute {
            destination: Ipv4Addr::from(octets),
            prefix_len,
            gateway,
        });
    }

    Ok(routes)
}

/// Rejects domain names that are not present, that are the literal
/// `localhost`, or that are the DNS root.
fn sanitize_dns_name(value: &[u8]) -> Option<String> {
    let name = String::from_utf8(value.to_vec()).ok()?;
    let trimmed = name.trim_end_matches('\0');

    if trimmed.is_empty() || trimmed == "." || trimmed.eq_ignore_ascii_case("localhost") {
        return None;
    }

    Some(trimmed.to_string())
}

/// Approximate tzdata zone name validation: non-empty, ASCII, and built
/// from the character set zone names use (letters, digits, `/_+-`).
fn is_valid_tz_zone(zone: &str) -> bool {
    !zone.is_empty()
        && zone
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'/' | b'_' | b'+' | b'-'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HardwareAddr;

    fn encode(message: &Message) -> Vec<u8> {
        let mut buf = WriteBuffer::new();
        message.write::<BigEndian>(&mut buf).unwrap();
        buf.bytes().to_vec()
    }

    fn well_formed_reply() -> Vec<u8> {
        let mut message = Message::new();
        message.set_yiaddr(Ipv4Addr::new(192, 0, 2, 10));
        message.set_client_hardware_addr(HardwareAddr::default());
        message.push_raw_option(TAG_MESSAGE_TYPE, &[5]);
        message.push_raw_option(TAG_SERVER_IDENTIFIER, &[192, 0, 2, 1]);
        message.push_raw_option(TAG_LEASE_TIME, &3600u32.to_be_bytes());
        message.push_raw_option(TAG_ROUTER, &[192, 0, 2, 254]);
        message.push_raw_option(TAG_CLASSLESS_STATIC_ROUTES, &[0, 192, 0, 2, 254]);
        message.end_options();
        encode(&message)
    }

    #[test]
    fn decodes_well_formed_lease() {
        let lease = Lease::from_raw(SystemTime::UNIX_EPOCH, &well_formed_reply()).unwrap();

        assert_eq!(lease.address(), Ipv4Addr::new(192, 0, 2, 10));
        assert_eq!(lease.subnet_mask(), Ipv4Addr::new(255, 255, 255, 0));
        assert!(!lease.has_explicit_subnet_mask());
        assert_eq!(lease.router(), Some(Ipv4Addr::new(192, 0, 2, 254)));
        assert_eq!(lease.lifetime(), 3600);
        assert_eq!(lease.static_routes().len(), 1);
        assert_eq!(lease.static_routes()[0].destination, Ipv4Addr::UNSPECIFIED);
        assert_eq!(lease.static_routes()[0].prefix_len, 0);
        assert_eq!(lease.static_routes()[0].gateway, Ipv4Addr::new(192, 0, 2, 254));
    }

    #[test]
    fn rejects_zero_lifetime_as_no_message() {
        let mut message = Message::new();
        message.set_yiaddr(Ipv4Addr::new(192, 0, 2, 10));
        message.push_raw_option(TAG_MESSAGE_TYPE, &[5]);
        message.push_raw_option(TAG_SERVER_IDENTIFIER, &[192, 0, 2, 1]);
        message.push_raw_option(TAG_LEASE_TIME, &0u32.to_be_bytes());
        message.end_options();

        let raw = encode(&message);

        assert!(matches!(
            Lease::from_raw(SystemTime::UNIX_EPOCH, &raw),
            Err(LeaseError::NoMessage)
        ));
    }

    #[test]
    fn drops_localhost_domain_name_without_rejecting_lease() {
        let mut message = Message::new();
        message.set_yiaddr(Ipv4Addr::new(192, 0, 2, 10));
        message.push_raw_option(TAG_MESSAGE_TYPE, &[5]);
        message.push_raw_option(TAG_SERVER_IDENTIFIER, &[192, 0, 2, 1]);
        message.push_raw_option(TAG_LEASE_TIME, &3600u32.to_be_bytes());
        message.push_raw_option(TAG_DOMAIN_NAME, b"localhost");
        message.end_options();

        let raw = encode(&message);

        let lease = Lease::from_raw(SystemTime::UNIX_EPOCH, &raw).unwrap();
        assert_eq!(lease.domain_name(), None);
    }

    #[test]
    fn mtu_below_floor_is_clamped() {
        let mut message = Message::new();
        message.set_yiaddr(Ipv4Addr::new(192, 0, 2, 10));
        message.push_raw_option(TAG_MESSAGE_TYPE, &[5]);
        message.push_raw_option(TAG_SERVER_IDENTIFIER, &[192, 0, 2, 1]);
        message.push_raw_option(TAG_LEASE_TIME, &3600u32.to_be_bytes());
        message.push_raw_option(TAG_INTERFACE_MTU, &40u16.to_be_bytes());
        message.end_options();

        let raw = encode(&message);

        let lease = Lease::from_raw(SystemTime::UNIX_EPOCH, &raw).unwrap();
        assert_eq!(lease.mtu(), constants::MIN_INTERFACE_MTU);
    }

    #[test]
    fn classless_route_destination_consumes_ceil_prefix_len_over_8_octets() {
        // prefix_len=24 -> 3 destination octets + 4 gateway octets.
        let routes = parse_classless_routes(&[24, 10, 0, 1, 192, 0, 2, 254]).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].prefix_len, 24);
        assert_eq!(routes[0].destination, Ipv4Addr::new(10, 0, 1, 0));
        assert_eq!(routes[0].gateway, Ipv4Addr::new(192, 0, 2, 254));

        // prefix_len=0 -> 0 destination octets + 4 gateway octets.
        let routes = parse_classless_routes(&[0, 192, 0, 2, 1]).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].destination, Ipv4Addr::UNSPECIFIED);
        assert_eq!(routes[0].gateway, Ipv4Addr::new(192, 0, 2, 1));
    }

    #[test]
    fn classless_route_truncated_before_gateway_octets_is_rejected() {
        // prefix_len=24 demands 3 destination + 4 gateway octets; only 5 given.
        let err = parse_classless_routes(&[24, 10, 0, 1, 192]).unwrap_err();
        assert!(matches!(err, LeaseError::TruncatedRoute));
    }
}
