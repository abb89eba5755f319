use std::fmt::Display;
use std::net::Ipv4Addr;

use binbuf::prelude::*;

use crate::{
    constants,
    types::{Addrs, Header, HardwareAddr},
};

/// [`Message`] describes a complete DHCP message. The same packet field
/// layout is used in both directions.
///
/// ### See
///
/// RFC 2131 - Section 2 - Protocol Summary: https://datatracker.ietf.org/doc/html/rfc2131#section-2
#[derive(Debug)]
pub struct Message {
    /// Header fields like the opcode, transaction id and additional flags.
    header: Header,

    /// Different IP and hardware addresses.
    addrs: Addrs,

    /// Optional server host name, null terminated string (64 octets).
    sname: Vec<u8>,

    /// Boot file name, null terminated string. 'Generic' name or null in
    /// BOOTREQUEST, fully qualified directory-path name in bootreply
    /// (128 octets).
    file: Vec<u8>,

    /// Raw option TLV bytes following the magic cookie, up to (but not
    /// including) the terminating `End` tag. Unlike the fixed-size
    /// header fields, this area has no declared length in the wire
    /// format; it simply runs to the end of the UDP payload. Decoding
    /// it into typed values is [`crate::Lease`]'s job, not this type's.
    options: Vec<u8>,
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "MSG TY: {:02x?}; HW TY: {:02x?}; HW ADDR LEN: {:02x?}; HOPS: {:02x?}; ID: {:02x?}; SECS: {:02x?}; FLAGS: {:02x?}\n\
            ; Client IP: {:08x?}\n\
            ; Your (client) IP: {:08x?}\n\
            ; Next server IP: {:08x?}\n\
            ; Relay agent IP: {:08x?}\n\
            ; Client MAC addr: {}\n\
            ; Server host name: {:02x?}",
            self.header.opcode, self.header.htype, self.header.hlen, self.header.hops, self.header.xid, self.header.secs, self.header.flags,
            self.addrs.ciaddr,
            self.addrs.yiaddr,
            self.addrs.siaddr,
            self.addrs.giaddr,
            self.addrs.chaddr,
            self.sname
        )
    }
}

impl Default for Message {
    fn default() -> Self {
        Self {
            header: Header::default(),
            addrs: Addrs::default(),
            sname: vec![0; 64],
            file: vec![0; 128],
            options: Vec::new(),
        }
    }
}

impl Readable for Message {
    type Error = BufferError;

    fn read<E: Endianness>(buf: &mut ReadBuffer) -> Result<Self, Self::Error> {
        let header = Header::read::<E>(buf)?;
        let addrs = Addrs::read::<E>(buf)?;
        let sname = buf.read_vec(64)?;
        let file = buf.read_vec(128)?;

        let cookie = buf.read_vec(4)?;
        if cookie.as_slice() != constants::DHCP_MAGIC_COOKIE_ARR.as_slice() {
            return Err(BufferError::InvalidData);
        }

        // Options run to the end of the datagram; there is no length
        // prefix. `Lease::decode` walks this buffer as a TLV stream.
        let options = buf.read_vec(buf.len())?;

        Ok(Self {
            header,
            addrs,
            sname,
            file,
            options,
        })
    }
}

impl Writeable for Message {
    type Error = BufferError;

    fn write<E: Endianness>(&self, buf: &mut WriteBuffer) -> Result<usize, Self::Error> {
        self.header.write::<E>(buf)?;
        self.addrs.write::<E>(buf)?;
        self.sname.write::<E>(buf)?;
        self.file.write::<E>(buf)?;

        buf.write_slice(constants::DHCP_MAGIC_COOKIE_ARR.as_slice())?;

        self.options.write::<E>(buf)
    }
}

impl Message {
    /// Create a new DHCP [`Message`]. Internally this creates a default header
    /// with a random transaction ID and then calls [`Self::new_with_header`].
    pub fn new() -> Self {
        let header = Header::new();
        Self::new_with_header(header)
    }

    /// Create a new DHCP [`Message`] with the provided header. All other
    /// fields will use the default values.
    pub fn new_with_header(header: Header) -> Self {
        Self {
            header,
            ..Default::default()
        }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn addrs(&self) -> &Addrs {
        &self.addrs
    }

    pub fn set_ciaddr(&mut self, addr: Ipv4Addr) {
        self.addrs.ciaddr = addr;
    }

    pub fn set_yiaddr(&mut self, addr: Ipv4Addr) {
        self.addrs.yiaddr = addr;
    }

    pub fn set_client_hardware_addr(&mut self, addr: HardwareAddr) {
        self.addrs.chaddr = addr;
    }

    /// Append a raw, already-encoded option TLV (tag, len, value) to
    /// the option area. Used by request construction, which builds
    /// its own small option set directly rather than through the
    /// unfinished generic option codec this crate once carried.
    pub fn push_raw_option(&mut self, tag: u8, value: &[u8]) {
        self.options.push(tag);
        self.options.push(value.len() as u8);
        self.options.extend_from_slice(value);
    }

    /// Terminates the option area with the `End` tag (255). Must be
    /// called after the last `push_raw_option` and before the message
    /// is serialized.
    pub fn end_options(&mut self) {
        self.options.push(255);
    }

    /// The raw option TLV bytes, for [`crate::Lease::decode`].
    pub fn options(&self) -> &[u8] {
        &self.options
    }
}
