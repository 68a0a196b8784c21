//! Servers

use std::{io, sync::Arc};

use futures::future;
use log::info;
use relaykit::rpc::Handlers;

use crate::{config::Config, utils::ServerHandle};

pub use self::{
    rpc::{RpcServer, RpcSession, ServerPeer, broadcast},
    socks5::{Socks5Server, Socks5Session},
    udp_associate::{UdpAssociation, UdpPeer},
    udp_tunnel::{TunnelSession, UdpTunnelServer},
};

pub mod rpc;
pub mod socks5;
pub mod udp_associate;
pub mod udp_tunnel;

/// Starts every configured server, see [`run_with_handlers`]
///
/// The RPC server only answers the built-in `ping` method.
pub async fn run(config: Config) -> io::Result<()> {
    run_with_handlers(config, Arc::new(Handlers::new())).await
}

/// Starts every configured server and waits until one of them fails
///
/// The RPC server dispatches its requests to `handlers`.
pub async fn run_with_handlers(config: Config, handlers: Arc<Handlers>) -> io::Result<()> {
    config.check_integrity()?;

    info!("relaykit {} starting", env!("CARGO_PKG_VERSION"));

    let mut vfut = Vec::new();

    if let Some(ref socks5) = config.socks5 {
        let server = Socks5Server::bind(socks5, config.timeout, config.idle_timeout).await?;
        vfut.push(ServerHandle(tokio::spawn(server.run())));
    }

    if let Some(ref tunnel) = config.udp_tunnel {
        let server = UdpTunnelServer::bind(tunnel, config.idle_timeout).await?;
        vfut.push(ServerHandle(tokio::spawn(server.run())));
    }

    if let Some(ref rpc) = config.rpc {
        let server = RpcServer::bind(rpc, handlers, config.timeout, config.idle_timeout).await?;
        vfut.push(ServerHandle(tokio::spawn(server.run())));
    }

    // Any one of the servers exits, the rest are aborted when their handles drop
    let (res, ..) = future::select_all(vfut).await;
    res
}
