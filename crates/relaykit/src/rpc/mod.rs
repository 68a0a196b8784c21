//! Request/response RPC over a byte stream
//!
//! Frames are length prefixed with a JSON header, see [`protocol`]. An [`RpcPeer`] correlates outbound calls with
//! their responses by id and answers inbound requests from a [`Handlers`] table.

pub use self::{
    error::RpcError,
    handler::{BoxHandler, HandlerResult, Handlers},
    peer::{DispatchOutcome, RpcPeer},
    protocol::{MessageKind, ProtocolError, RpcHeader, Status},
};

mod error;
mod handler;
mod peer;
pub mod protocol;
