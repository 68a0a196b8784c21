//! RPC errors

use std::io;

use thiserror::Error;

use super::protocol::ProtocolError;

/// Failure of an outbound call, or of the connection carrying it
#[derive(Error, Debug)]
pub enum RpcError {
    #[error("rpc call timed out")]
    Timeout,
    #[error("malformed rpc message: {0}")]
    Malformed(String),
    #[error("no handler registered for method \"{0}\"")]
    NoHandler(String),
    #[error("remote handler failed: {0}")]
    Remote(String),
    #[error("rpc connection closed")]
    Closed,
    #[error("{0}")]
    IoError(#[from] io::Error),
}

impl From<ProtocolError> for RpcError {
    fn from(e: ProtocolError) -> RpcError {
        RpcError::Malformed(e.to_string())
    }
}

impl From<RpcError> for io::Error {
    fn from(e: RpcError) -> io::Error {
        match e {
            RpcError::IoError(e) => e,
            RpcError::Timeout => io::Error::new(io::ErrorKind::TimedOut, e),
            RpcError::Closed => io::Error::new(io::ErrorKind::ConnectionAborted, e),
            RpcError::Malformed(..) => io::Error::new(io::ErrorKind::InvalidData, e),
            e => io::Error::other(e),
        }
    }
}
