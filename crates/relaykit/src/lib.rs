//! relaykit
//!
//! Protocol and coordination layer for proxy-style network services running on tokio:
//!
//! - [`relay::socks5`]: SOCKS5 ([RFC1928](https://www.ietf.org/rfc/rfc1928.txt)) wire codec, client handshake state
//!   machine and server side acceptor
//! - [`relay::udprelay`]: SOCKS5 UDP ASSOCIATE datagram envelope, for both the relay endpoint and the
//!   length-delimited variant carried on a byte stream
//! - [`rpc`]: length-prefixed request/response framing with call correlation and handler dispatch
//! - [`session`]: keyed registry of live sessions and the idle watchdog supervising them

#![crate_type = "lib"]

pub use self::{
    relay::{
        socks5::{
            Address, Command, HandshakeInfo, HandshakeState, Reply, Socks5Error, Socks5Option, Socks5TcpClient,
            negotiate,
        },
        udprelay::{Socks5UdpClient, UdpFrameStream, UdpHeaderError, UdpRelayPacket},
    },
    rpc::{RpcError, RpcPeer},
    session::{Activity, IdleWatchdog, Session, SessionRegistry},
};

pub mod net;
pub mod relay;
pub mod rpc;
pub mod session;
