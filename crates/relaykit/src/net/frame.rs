//! Reading delimited frames off a byte stream

use std::io::{self, ErrorKind};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Result of probing an accumulating buffer for a complete frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBoundary {
    /// More bytes are required before the frame can be delimited
    Incomplete,
    /// A complete frame occupies `buffer[..n]`
    Complete(usize),
}

/// Reads from `reader` into `buffer` until `boundary` reports a complete frame, then splits that frame off
///
/// Bytes following the frame stay in `buffer` for the next call. Returns `Ok(None)` if the stream ends cleanly on a
/// frame boundary, and an `UnexpectedEof` error if it ends in the middle of one.
pub async fn read_frame<R, F, E>(reader: &mut R, buffer: &mut BytesMut, mut boundary: F) -> Result<Option<BytesMut>, E>
where
    R: AsyncRead + Unpin,
    F: FnMut(&[u8]) -> Result<FrameBoundary, E>,
    E: From<io::Error>,
{
    loop {
        if !buffer.is_empty() {
            if let FrameBoundary::Complete(n) = boundary(buffer)? {
                return Ok(Some(buffer.split_to(n)));
            }
        }

        if buffer.capacity() - buffer.len() < 1024 {
            buffer.reserve(4096);
        }

        let n = reader.read_buf(buffer).await?;
        if n == 0 {
            if buffer.is_empty() {
                return Ok(None);
            }
            let err = io::Error::new(ErrorKind::UnexpectedEof, "stream closed in the middle of a frame");
            return Err(err.into());
        }
    }
}
