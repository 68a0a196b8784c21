//! SOCKS5 UDP relay envelope
//!
//! Two call sites share the header layout but not the meaning of RSV:
//!
//! - datagrams exchanged with a proxy's relay endpoint ([`Socks5UdpClient`], the UDP ASSOCIATE relay) leave RSV at
//!   zero and never check it, the datagram boundary delimits the payload
//! - frames carried on a byte stream ([`UdpFrameStream`]) store the payload length in RSV and it must match

use bytes::BytesMut;

pub use self::{
    client::Socks5UdpClient,
    codec::{
        UdpHeaderError, UdpRelayHeader, UdpRelayPacket, decode_udp_packet, encode_udp_frame, encode_udp_header,
        udp_frame_boundary,
    },
    stream::UdpFrameStream,
};

mod client;
mod codec;
mod stream;

/// Envelope for a datagram sent to a relay endpoint
pub fn wrap(payload: &[u8], dest_addr: &str, dest_port: u16) -> Result<BytesMut, UdpHeaderError> {
    encode_udp_header(payload, dest_addr, dest_port)
}

/// Opens an envelope, see [`decode_udp_packet`]
pub fn unwrap(bytes: &[u8], reserved_as_length: bool) -> Result<UdpRelayPacket<'_>, UdpHeaderError> {
    decode_udp_packet(bytes, reserved_as_length)
}
