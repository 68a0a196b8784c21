//! Stream helpers shared by the framed protocols

use std::{io, time::Duration};

use tokio::{net::TcpStream, time};

use crate::relay::Address;

pub use self::frame::{FrameBoundary, read_frame};

mod frame;

/// Connects to `addr`, resolving domain names with the system resolver
pub async fn tcp_connect(addr: &Address) -> io::Result<TcpStream> {
    match *addr {
        Address::SocketAddress(sa) => TcpStream::connect(sa).await,
        Address::DomainNameAddress(ref dname, port) => TcpStream::connect((dname.as_str(), port)).await,
    }
}

/// [`tcp_connect`] bounded by `timeout`
pub async fn tcp_connect_timeout(addr: &Address, timeout: Duration) -> io::Result<TcpStream> {
    match time::timeout(timeout, tcp_connect(addr)).await {
        Ok(r) => r,
        Err(..) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("connect {addr} timed out"))),
    }
}
