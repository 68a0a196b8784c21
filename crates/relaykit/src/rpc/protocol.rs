//! RPC framing
//!
//! ```plain
//! +-----------+-----------+-------------+----------+
//! |    LEN    |   HLEN    |   HEADER    |   BODY   |
//! +-----------+-----------+-------------+----------+
//! | u32 (BE)  | u16 (BE)  | HLEN bytes  | Variable |
//! +-----------+-----------+-------------+----------+
//! ```
//!
//! `LEN` counts everything after itself. The header is a JSON object, the body is opaque.

use std::io;

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::net::FrameBoundary;

/// Largest accepted value of `LEN`
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const LENGTH_PREFIX_SIZE: usize = 4;
const HEADER_LENGTH_SIZE: usize = 2;

/// Id of notifications, never allocated to a correlated call
pub const NOTIFICATION_ID: u64 = 0;

/// RPC framing errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed rpc header: {0}")]
    MalformedHeader(#[from] serde_json::Error),
    #[error("rpc frame of {0} bytes exceeds the size limit")]
    FrameTooLarge(usize),
    #[error("rpc header of {0} bytes does not fit the frame")]
    HeaderTooLarge(usize),
    #[error("rpc frame declares {declared} bytes, {actual} present")]
    TruncatedFrame { declared: usize, actual: usize },
}

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
}

/// Outcome carried by a response
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    #[default]
    Ok,
    NoHandler,
    HandlerError,
}

impl Status {
    fn is_ok(&self) -> bool {
        matches!(*self, Status::Ok)
    }
}

/// RPC message header
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RpcHeader {
    pub id: u64,
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "Status::is_ok")]
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RpcHeader {
    pub fn request<M: Into<String>>(id: u64, method: M) -> RpcHeader {
        RpcHeader {
            id,
            kind: MessageKind::Request,
            method: method.into(),
            status: Status::Ok,
            error: None,
        }
    }

    pub fn notification<M: Into<String>>(method: M) -> RpcHeader {
        RpcHeader::request(NOTIFICATION_ID, method)
    }

    pub fn response(id: u64) -> RpcHeader {
        RpcHeader {
            id,
            kind: MessageKind::Response,
            method: String::new(),
            status: Status::Ok,
            error: None,
        }
    }

    pub fn error_response<M: Into<String>>(id: u64, method: M, status: Status, error: String) -> RpcHeader {
        RpcHeader {
            id,
            kind: MessageKind::Response,
            method: method.into(),
            status,
            error: Some(error),
        }
    }

    pub fn is_notification(&self) -> bool {
        self.kind == MessageKind::Request && self.id == NOTIFICATION_ID
    }
}

pub fn encode_rpc_header(header: &RpcHeader) -> Result<Vec<u8>, ProtocolError> {
    Ok(serde_json::to_vec(header)?)
}

pub fn decode_rpc_header(buf: &[u8]) -> Result<RpcHeader, ProtocolError> {
    Ok(serde_json::from_slice(buf)?)
}

/// Builds a complete frame, length prefix included
pub fn encode_frame(header: &RpcHeader, body: &[u8]) -> Result<BytesMut, ProtocolError> {
    let header = encode_rpc_header(header)?;
    if header.len() > u16::MAX as usize {
        return Err(ProtocolError::HeaderTooLarge(header.len()));
    }

    let len = HEADER_LENGTH_SIZE + header.len() + body.len();
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + len);
    buf.put_u32(len as u32);
    buf.put_u16(header.len() as u16);
    buf.put_slice(&header);
    buf.put_slice(body);
    Ok(buf)
}

/// Splits a complete frame, length prefix included, into header and body
pub fn decode_frame(frame: &[u8]) -> Result<(RpcHeader, &[u8]), ProtocolError> {
    if frame.len() < LENGTH_PREFIX_SIZE + HEADER_LENGTH_SIZE {
        return Err(ProtocolError::TruncatedFrame {
            declared: LENGTH_PREFIX_SIZE + HEADER_LENGTH_SIZE,
            actual: frame.len(),
        });
    }

    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if declared > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(declared));
    }
    let payload = &frame[LENGTH_PREFIX_SIZE..];
    if payload.len() != declared {
        return Err(ProtocolError::TruncatedFrame {
            declared,
            actual: payload.len(),
        });
    }

    let header_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
    let rest = &payload[HEADER_LENGTH_SIZE..];
    if header_len > rest.len() {
        return Err(ProtocolError::HeaderTooLarge(header_len));
    }

    let header = decode_rpc_header(&rest[..header_len])?;
    Ok((header, &rest[header_len..]))
}

/// Finds the end of the first frame in `buf`
pub fn rpc_frame_boundary(buf: &[u8]) -> Result<FrameBoundary, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(FrameBoundary::Incomplete);
    }

    let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if declared > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(declared));
    }

    let total = LENGTH_PREFIX_SIZE + declared;
    if buf.len() < total {
        Ok(FrameBoundary::Incomplete)
    } else {
        Ok(FrameBoundary::Complete(total))
    }
}
