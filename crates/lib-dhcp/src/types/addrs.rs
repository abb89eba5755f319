use std::net::Ipv4Addr;

use binbuf::prelude::*;

use crate::types::HardwareAddr;

/// The four IPv4 address fields plus the client hardware address,
/// read as a block immediately after the fixed header (RFC 2131
/// section 2).
#[derive(Debug, Default)]
pub struct Addrs {
    /// Client IP address; filled in by the client in `DHCPREQUEST` if
    /// verifying a previously allocated lease, zero otherwise.
    pub ciaddr: Ipv4Addr,

    /// 'Your' (client) IP address, filled in by the server.
    pub yiaddr: Ipv4Addr,

    /// IP address of next server to use in bootstrap.
    pub siaddr: Ipv4Addr,

    /// Relay agent IP address, used in booting via a relay agent.
    pub giaddr: Ipv4Addr,

    /// Client hardware address.
    pub chaddr: HardwareAddr,
}

impl Readable for Addrs {
    type Error = BufferError;

    fn read<E: Endianness>(buf: &mut ReadBuffer) -> Result<Self, Self::Error> {
        let ciaddr = read_ipv4(buf)?;
        let yiaddr = read_ipv4(buf)?;
        let siaddr = read_ipv4(buf)?;
        let giaddr = read_ipv4(buf)?;
        let chaddr = HardwareAddr::read::<E>(buf, 6)?;

        Ok(Self {
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
        })
    }
}

impl Writeable for Addrs {
    type Error = BufferError;

    fn write<E: Endianness>(&self, buf: &mut WriteBuffer) -> Result<usize, Self::Error> {
        let mut n = 0;
        n += write_ipv4(&self.ciaddr, buf)?;
        n += write_ipv4(&self.yiaddr, buf)?;
        n += write_ipv4(&self.siaddr, buf)?;
        n += write_ipv4(&self.giaddr, buf)?;
        n += self.chaddr.write::<E>(buf)?;
        Ok(n)
    }
}

fn read_ipv4(buf: &mut ReadBuffer) -> Result<Ipv4Addr, BufferError> {
    let octets = buf.read_vec(4)?;
    Ok(Ipv4Addr::new(octets[0], octets[1], octets[2], octets[3]))
}

fn write_ipv4(addr: &Ipv4Addr, buf: &mut WriteBuffer) -> Result<usize, BufferError> {
    buf.write_slice(&addr.octets())?;
    Ok(4)
}
