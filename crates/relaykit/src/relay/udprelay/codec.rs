//! UDP relay header codec
//!
//! ```plain
//! +-----+------+------+----------+----------+----------+
//! | RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +-----+------+------+----------+----------+----------+
//! |  2  |  1   |  1   | Variable |    2     | Variable |
//! +-----+------+------+----------+----------+----------+
//! ```

use std::{
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    str,
};

use bytes::{BufMut, BytesMut};

use crate::{
    net::FrameBoundary,
    relay::socks5::{Address, consts},
};

/// RSV + FRAG
const FIXED_HEADER_LEN: usize = 3;

/// Decoding failure of a UDP relay header
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UdpHeaderError {
    #[error("udp relay header needs 3 bytes for RSV and FRAG, got {0}")]
    ReservedTooShort(usize),
    #[error("udp relay header ends before the address type")]
    AddressTypeMissing,
    #[error("udp relay address needs {expected} bytes, got {actual}")]
    AddressTooShort { expected: usize, actual: usize },
    #[error("udp relay address type {0:#x} not supported")]
    UnknownAddressType(u8),
    #[error("udp relay frame declares {declared} payload bytes, {actual} present")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("domain name is {0} bytes, at most 255 allowed")]
    DomainTooLong(usize),
    #[error("domain name must be UTF-8 encoding")]
    DomainInvalidEncoding,
    #[error("payload of {0} bytes does not fit the length field")]
    PayloadTooLarge(usize),
}

impl From<UdpHeaderError> for io::Error {
    fn from(err: UdpHeaderError) -> io::Error {
        io::Error::new(ErrorKind::InvalidData, err)
    }
}

/// UDP relay header
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpRelayHeader {
    /// RSV, the payload length on stream-carried frames
    pub reserved: u16,
    pub frag: u8,
    pub address: Address,
}

impl UdpRelayHeader {
    pub fn new(reserved: u16, frag: u8, address: Address) -> UdpRelayHeader {
        UdpRelayHeader {
            reserved,
            frag,
            address,
        }
    }

    pub fn write_to_buf<B: BufMut>(&self, buf: &mut B) {
        buf.put_u16(self.reserved);
        buf.put_u8(self.frag);
        self.address.write_to_buf(buf);
    }

    #[inline]
    pub fn serialized_len(&self) -> usize {
        FIXED_HEADER_LEN + self.address.serialized_len()
    }

    /// Header followed by `payload` in one buffer
    pub fn encode(&self, payload: &[u8]) -> Result<BytesMut, UdpHeaderError> {
        if let Address::DomainNameAddress(ref dname, ..) = self.address {
            if dname.len() > u8::MAX as usize {
                return Err(UdpHeaderError::DomainTooLong(dname.len()));
            }
        }

        let mut buf = BytesMut::with_capacity(self.serialized_len() + payload.len());
        self.write_to_buf(&mut buf);
        buf.put_slice(payload);
        Ok(buf)
    }
}

/// A decoded datagram, borrowing its payload from the input
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UdpRelayPacket<'a> {
    pub frag: u8,
    pub address: Address,
    pub payload: &'a [u8],
}

impl UdpRelayPacket<'_> {
    /// Destination as an IP endpoint, `None` if a domain name was sent
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.address.socket_addr()
    }

    /// Destination domain name, `None` if an IP address was sent
    pub fn domain(&self) -> Option<&str> {
        self.address.domain()
    }

    /// Bytes taken by the header
    pub fn header_len(&self) -> usize {
        FIXED_HEADER_LEN + self.address.serialized_len()
    }
}

fn host_address(dest_address: &str, dest_port: u16) -> Result<Address, UdpHeaderError> {
    if let Ok(ip) = dest_address.parse::<IpAddr>() {
        return Ok(Address::SocketAddress(SocketAddr::new(ip, dest_port)));
    }
    if dest_address.len() > u8::MAX as usize {
        return Err(UdpHeaderError::DomainTooLong(dest_address.len()));
    }
    Ok(Address::DomainNameAddress(dest_address.to_owned(), dest_port))
}

/// Encodes a datagram for a relay endpoint, RSV and FRAG left zero
///
/// `dest_address` is sent as IPv4 or IPv6 if it parses as one, otherwise as a domain name.
pub fn encode_udp_header(payload: &[u8], dest_address: &str, dest_port: u16) -> Result<BytesMut, UdpHeaderError> {
    let address = host_address(dest_address, dest_port)?;
    UdpRelayHeader::new(0, 0, address).encode(payload)
}

/// Encodes a stream-carried frame, RSV holding the payload length
pub fn encode_udp_frame(payload: &[u8], address: &Address) -> Result<BytesMut, UdpHeaderError> {
    let reserved = u16::try_from(payload.len()).map_err(|_| UdpHeaderError::PayloadTooLarge(payload.len()))?;
    UdpRelayHeader::new(reserved, 0, address.clone()).encode(payload)
}

/// Length of the ATYP + DST.ADDR + DST.PORT block starting at `buf[0]`, `Ok(None)` if `buf` is too short to tell
fn address_len(buf: &[u8]) -> Result<Option<usize>, UdpHeaderError> {
    let Some(&atyp) = buf.first() else {
        return Ok(None);
    };

    let len = match atyp {
        consts::SOCKS5_ADDR_TYPE_IPV4 => 1 + 4 + 2,
        consts::SOCKS5_ADDR_TYPE_IPV6 => 1 + 16 + 2,
        consts::SOCKS5_ADDR_TYPE_DOMAIN_NAME => match buf.get(1) {
            Some(&n) => 1 + 1 + n as usize + 2,
            None => return Ok(None),
        },
        _ => return Err(UdpHeaderError::UnknownAddressType(atyp)),
    };
    Ok(Some(len))
}

fn decode_address(buf: &[u8]) -> Result<(Address, usize), UdpHeaderError> {
    if buf.is_empty() {
        return Err(UdpHeaderError::AddressTypeMissing);
    }

    let len = match address_len(buf)? {
        Some(len) => len,
        // only the domain name length byte can be missing here
        None => {
            return Err(UdpHeaderError::AddressTooShort {
                expected: 2,
                actual: buf.len(),
            });
        }
    };
    if buf.len() < len {
        return Err(UdpHeaderError::AddressTooShort {
            expected: len,
            actual: buf.len(),
        });
    }

    let port = u16::from_be_bytes([buf[len - 2], buf[len - 1]]);
    let address = match buf[0] {
        consts::SOCKS5_ADDR_TYPE_IPV4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[1..5]);
            Address::SocketAddress(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(octets)), port))
        }
        consts::SOCKS5_ADDR_TYPE_IPV6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[1..17]);
            Address::SocketAddress(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => {
            let dname = str::from_utf8(&buf[2..len - 2]).map_err(|_| UdpHeaderError::DomainInvalidEncoding)?;
            Address::DomainNameAddress(dname.to_owned(), port)
        }
    };
    Ok((address, len))
}

/// Decodes one datagram
///
/// With `reserved_as_length` the RSV field must equal the number of bytes after DST.PORT. Without it RSV is ignored.
pub fn decode_udp_packet(bytes: &[u8], reserved_as_length: bool) -> Result<UdpRelayPacket<'_>, UdpHeaderError> {
    if bytes.len() < FIXED_HEADER_LEN {
        return Err(UdpHeaderError::ReservedTooShort(bytes.len()));
    }

    let reserved = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
    let frag = bytes[2];
    let (address, address_len) = decode_address(&bytes[FIXED_HEADER_LEN..])?;
    let payload = &bytes[FIXED_HEADER_LEN + address_len..];

    if reserved_as_length && payload.len() != reserved {
        return Err(UdpHeaderError::LengthMismatch {
            declared: reserved,
            actual: payload.len(),
        });
    }

    Ok(UdpRelayPacket {
        frag,
        address,
        payload,
    })
}

/// Finds the end of the first stream-carried frame in `buf`
pub fn udp_frame_boundary(buf: &[u8]) -> Result<FrameBoundary, UdpHeaderError> {
    if buf.len() < FIXED_HEADER_LEN {
        return Ok(FrameBoundary::Incomplete);
    }

    let declared = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    let address_len = match address_len(&buf[FIXED_HEADER_LEN..])? {
        Some(len) => len,
        None => return Ok(FrameBoundary::Incomplete),
    };

    let total = FIXED_HEADER_LEN + address_len + declared;
    if buf.len() < total {
        Ok(FrameBoundary::Incomplete)
    } else {
        Ok(FrameBoundary::Complete(total))
    }
}
