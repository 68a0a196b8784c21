//! UDP datagrams carried on a byte stream

use std::io;

use byte_string::ByteStr;
use bytes::BytesMut;
use log::trace;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::codec::{decode_udp_packet, encode_udp_frame, udp_frame_boundary};
use crate::{net::read_frame, relay::socks5::Address};

/// Frames datagrams on a stream, RSV carrying each payload's length
///
/// Either half of a split stream can be wrapped on its own: receiving only needs `AsyncRead`, sending only
/// `AsyncWrite`.
pub struct UdpFrameStream<S> {
    stream: S,
    buffer: BytesMut,
}

impl<S> UdpFrameStream<S> {
    pub fn new(stream: S) -> UdpFrameStream<S> {
        UdpFrameStream {
            stream,
            buffer: BytesMut::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S> UdpFrameStream<S>
where
    S: AsyncWrite + Unpin,
{
    /// Sends `payload` addressed to `target` as one frame
    pub async fn send_to(&mut self, payload: &[u8], target: &Address) -> io::Result<()> {
        let frame = encode_udp_frame(payload, target)?;
        trace!("udp frame {} bytes to {} {:?}", payload.len(), target, ByteStr::new(payload));
        self.stream.write_all(&frame).await
    }
}

impl<S> UdpFrameStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Receives the next frame, `Ok(None)` once the stream ends between frames
    ///
    /// A frame that fails to decode is an `InvalidData` error, the stream cannot be resynchronised after it.
    pub async fn recv_from(&mut self) -> io::Result<Option<(Address, BytesMut)>> {
        let frame = read_frame(&mut self.stream, &mut self.buffer, |buf| {
            udp_frame_boundary(buf).map_err(io::Error::from)
        })
        .await?;

        let Some(mut frame) = frame else {
            return Ok(None);
        };

        let (address, header_len) = {
            let packet = decode_udp_packet(&frame, true)?;
            (packet.address.clone(), packet.header_len())
        };
        let payload = frame.split_off(header_len);
        trace!("udp frame {} bytes from {} {:?}", payload.len(), address, ByteStr::new(&payload));
        Ok(Some((address, payload)))
    }
}
