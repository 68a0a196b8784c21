//! SOCKS5 address encoding
//!
//! ```plain
//! +------+----------+----------+
//! | ATYP | DST.ADDR | DST.PORT |
//! +------+----------+----------+
//! |  1   | Variable |    2     |
//! +------+----------+----------+
//! ```

use std::{
    fmt::{self, Debug, Formatter},
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6},
    str::FromStr,
};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{Socks5Error, consts};

/// SOCKS5 address type
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Address {
    /// Socket address (IP Address)
    SocketAddress(SocketAddr),
    /// Domain name address
    DomainNameAddress(String, u16),
}

impl Address {
    /// Builds an address from a host string, choosing IPv4, IPv6 or domain name by whether `host` parses as an IP
    pub fn from_host(host: &str, port: u16) -> Result<Address, Socks5Error> {
        match host.parse::<IpAddr>() {
            Ok(ip) => Ok(Address::SocketAddress(SocketAddr::new(ip, port))),
            Err(..) => {
                let host = host.trim_start_matches('[').trim_end_matches(']');
                if let Ok(ip) = host.parse::<Ipv6Addr>() {
                    return Ok(Address::SocketAddress(SocketAddr::new(IpAddr::V6(ip), port)));
                }
                if host.len() > u8::MAX as usize {
                    return Err(Socks5Error::DomainNameTooLong(host.len()));
                }
                Ok(Address::DomainNameAddress(host.to_owned(), port))
            }
        }
    }

    /// The unspecified IPv4 address `0.0.0.0:0`
    pub fn unspecified() -> Address {
        Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)))
    }

    /// Address type tag of this address
    pub fn address_type(&self) -> u8 {
        match *self {
            Address::SocketAddress(SocketAddr::V4(..)) => consts::SOCKS5_ADDR_TYPE_IPV4,
            Address::SocketAddress(SocketAddr::V6(..)) => consts::SOCKS5_ADDR_TYPE_IPV6,
            Address::DomainNameAddress(..) => consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME,
        }
    }

    /// Checks that the address can be encoded
    pub fn check(&self) -> Result<(), Socks5Error> {
        match *self {
            Address::DomainNameAddress(ref dname, ..) if dname.len() > u8::MAX as usize => {
                Err(Socks5Error::DomainNameTooLong(dname.len()))
            }
            _ => Ok(()),
        }
    }

    /// Parse from a `AsyncRead`
    pub async fn read_from<R>(stream: &mut R) -> Result<Address, Socks5Error>
    where
        R: AsyncRead + Unpin,
    {
        let addr_type = stream.read_u8().await?;
        match addr_type {
            consts::SOCKS5_ADDR_TYPE_IPV4 => {
                let mut buf = [0u8; 4];
                stream.read_exact(&mut buf).await?;
                let port = stream.read_u16().await?;
                Ok(Address::SocketAddress(SocketAddr::V4(SocketAddrV4::new(
                    Ipv4Addr::from(buf),
                    port,
                ))))
            }
            consts::SOCKS5_ADDR_TYPE_IPV6 => {
                let mut buf = [0u8; 16];
                stream.read_exact(&mut buf).await?;
                let port = stream.read_u16().await?;
                Ok(Address::SocketAddress(SocketAddr::V6(SocketAddrV6::new(
                    Ipv6Addr::from(buf),
                    port,
                    0,
                    0,
                ))))
            }
            consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => {
                let length = stream.read_u8().await? as usize;

                // Len(Domain) + Len(Port)
                let mut raw_addr = vec![0u8; length + 2];
                stream.read_exact(&mut raw_addr).await?;

                let port = u16::from_be_bytes([raw_addr[length], raw_addr[length + 1]]);
                raw_addr.truncate(length);

                match String::from_utf8(raw_addr) {
                    Ok(addr) => Ok(Address::DomainNameAddress(addr, port)),
                    Err(..) => Err(Socks5Error::AddressDomainInvalidEncoding),
                }
            }
            _ => Err(Socks5Error::UnsupportedAddressType(addr_type)),
        }
    }

    /// Writes to writer
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.write_to_buf(&mut buf);
        writer.write_all(&buf).await
    }

    /// Writes ATYP, address and port to buffer
    ///
    /// Domain names longer than 255 bytes must be rejected with [`Address::check`] beforehand.
    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        match *self {
            Address::SocketAddress(SocketAddr::V4(ref addr)) => {
                buf.put_u8(consts::SOCKS5_ADDR_TYPE_IPV4);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::SocketAddress(SocketAddr::V6(ref addr)) => {
                buf.put_u8(consts::SOCKS5_ADDR_TYPE_IPV6);
                buf.put_slice(&addr.ip().octets());
                buf.put_u16(addr.port());
            }
            Address::DomainNameAddress(ref dname, port) => {
                debug_assert!(dname.len() <= u8::MAX as usize, "domain name length must be smaller than 256");
                buf.put_u8(consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME);
                buf.put_u8(dname.len() as u8);
                buf.put_slice(dname.as_bytes());
                buf.put_u16(port);
            }
        }
    }

    /// Get required buffer size for serializing
    #[inline]
    pub fn serialized_len(&self) -> usize {
        match *self {
            Address::SocketAddress(SocketAddr::V4(..)) => 1 + 4 + 2,
            Address::SocketAddress(SocketAddr::V6(..)) => 1 + 16 + 2,
            Address::DomainNameAddress(ref dname, _) => 1 + 1 + dname.len() + 2,
        }
    }

    /// Get maximum required buffer size for serializing
    #[inline]
    pub fn max_serialized_len() -> usize {
        1 // ADDR_TYPE
        + 1 // DOMAIN LENGTH
        + u8::MAX as usize // MAX DOMAIN
        + 2 // PORT
    }

    /// Get associated port number
    pub fn port(&self) -> u16 {
        match *self {
            Address::SocketAddress(addr) => addr.port(),
            Address::DomainNameAddress(.., port) => port,
        }
    }

    /// Get host address string
    pub fn host(&self) -> String {
        match *self {
            Address::SocketAddress(ref addr) => addr.ip().to_string(),
            Address::DomainNameAddress(ref domain, ..) => domain.to_owned(),
        }
    }

    /// Socket address, `None` for domain names
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match *self {
            Address::SocketAddress(addr) => Some(addr),
            Address::DomainNameAddress(..) => None,
        }
    }

    /// Domain name, `None` for IP addresses
    pub fn domain(&self) -> Option<&str> {
        match *self {
            Address::SocketAddress(..) => None,
            Address::DomainNameAddress(ref dname, ..) => Some(dname),
        }
    }
}

impl Debug for Address {
    #[inline]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Address {
    #[inline]
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match *self {
            Address::SocketAddress(ref addr) => write!(f, "{addr}"),
            Address::DomainNameAddress(ref addr, ref port) => write!(f, "{addr}:{port}"),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(s: SocketAddr) -> Address {
        Address::SocketAddress(s)
    }
}

impl From<(String, u16)> for Address {
    fn from((dn, port): (String, u16)) -> Address {
        Address::DomainNameAddress(dn, port)
    }
}

impl From<&Address> for Address {
    fn from(addr: &Address) -> Address {
        addr.clone()
    }
}

impl FromStr for Address {
    type Err = Socks5Error;

    fn from_str(s: &str) -> Result<Address, Socks5Error> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::SocketAddress(addr));
        }

        match s.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => Address::from_host(host, port),
                Err(..) => Err(io::Error::new(io::ErrorKind::InvalidInput, "invalid port in address").into()),
            },
            None => Err(io::Error::new(io::ErrorKind::InvalidInput, "address requires a port").into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_host_picks_address_type() {
        let v4 = Address::from_host("10.0.0.5", 80).unwrap();
        assert_eq!(v4.address_type(), consts::SOCKS5_ADDR_TYPE_IPV4);

        let v6 = Address::from_host("::1", 53).unwrap();
        assert_eq!(v6.address_type(), consts::SOCKS5_ADDR_TYPE_IPV6);

        let bracketed = Address::from_host("[fe80::1]", 53).unwrap();
        assert_eq!(bracketed.address_type(), consts::SOCKS5_ADDR_TYPE_IPV6);

        let dn = Address::from_host("example.com", 443).unwrap();
        assert_eq!(dn, Address::DomainNameAddress("example.com".to_owned(), 443));

        let long = "a".repeat(256);
        assert!(matches!(
            Address::from_host(&long, 1),
            Err(Socks5Error::DomainNameTooLong(256))
        ));
    }

    #[tokio::test]
    async fn ipv6_wire_layout() {
        let addr: Address = "[2001:db8::7]:8443".parse().unwrap();
        let mut buf = BytesMut::new();
        addr.write_to_buf(&mut buf);

        assert_eq!(buf.len(), addr.serialized_len());
        assert_eq!(buf[0], consts::SOCKS5_ADDR_TYPE_IPV6);
        assert_eq!(&buf[buf.len() - 2..], &8443u16.to_be_bytes());

        let mut reader = &buf[..];
        let decoded = Address::read_from(&mut reader).await.unwrap();
        assert_eq!(decoded, addr);
    }

    #[tokio::test]
    async fn rejects_unknown_atyp() {
        let data: &[u8] = &[0x09, 1, 2, 3, 4, 0, 80];
        let mut reader = data;
        let err = Address::read_from(&mut reader).await.unwrap_err();
        assert!(matches!(err, Socks5Error::UnsupportedAddressType(0x09)));
    }
}
