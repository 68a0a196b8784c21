//! UDP tunnel server
//!
//! Clients send SOCKS5 UDP envelopes on a TCP connection, each one length-delimited by its RSV field. The payloads
//! go out from one UDP socket per connection, replies come back framed the same way with their source as address.

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use futures::future::{self, Either};
use log::{debug, error, info, trace, warn};
use relaykit::{
    relay::{socks5::Address, udprelay::UdpFrameStream},
    session::{Activity, ActivityStream, IdleWatchdog, Session, SessionRegistry},
};
use tokio::{
    net::{TcpListener, TcpStream, UdpSocket},
    time,
};

use super::udp_associate::{MAXIMUM_UDP_PAYLOAD_SIZE, outbound_bind_addr, send_to_address};
use crate::config::ListenConfig;

/// A tunnel connection
pub struct TunnelSession {
    peer_addr: SocketAddr,
    outbound_addr: SocketAddr,
    activity: Arc<Activity>,
}

impl TunnelSession {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Local address of the connection's UDP socket
    pub fn outbound_addr(&self) -> SocketAddr {
        self.outbound_addr
    }

    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }
}

impl Session for TunnelSession {
    type Key = SocketAddr;

    fn key(&self) -> SocketAddr {
        self.peer_addr
    }
}

/// UDP-over-TCP tunnel server
pub struct UdpTunnelServer {
    listener: TcpListener,
    idle_timeout: Duration,
    sessions: Arc<SessionRegistry<TunnelSession>>,
}

impl UdpTunnelServer {
    pub async fn bind(config: &ListenConfig, idle_timeout: Duration) -> io::Result<UdpTunnelServer> {
        let listener = TcpListener::bind(config.listen).await?;
        Ok(UdpTunnelServer {
            listener,
            idle_timeout,
            sessions: Arc::new(SessionRegistry::new()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Live tunnel connections
    pub fn sessions(&self) -> Arc<SessionRegistry<TunnelSession>> {
        self.sessions.clone()
    }

    /// Accepts clients until the listener fails
    pub async fn run(self) -> io::Result<()> {
        info!("udp tunnel server listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(s) => s,
                Err(err) => {
                    error!("udp tunnel server accept failed with error: {}", err);
                    time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let sessions = self.sessions.clone();
            let idle_timeout = self.idle_timeout;
            tokio::spawn(async move {
                if let Err(err) = serve_client(stream, peer_addr, sessions, idle_timeout).await {
                    debug!("udp tunnel client {} closed with error: {}", peer_addr, err);
                }
            });
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    sessions: Arc<SessionRegistry<TunnelSession>>,
    idle_timeout: Duration,
) -> io::Result<()> {
    let outbound = UdpSocket::bind(outbound_bind_addr(&stream.local_addr()?)).await?;
    let outbound_addr = outbound.local_addr()?;

    let activity = Arc::new(Activity::new());
    let session = Arc::new(TunnelSession {
        peer_addr,
        outbound_addr,
        activity: activity.clone(),
    });
    let watchdog = IdleWatchdog::new(activity.clone(), idle_timeout);

    let (reader, writer) = stream.into_split();
    let reader = UdpFrameStream::new(ActivityStream::new(reader, activity.clone()));
    let writer = UdpFrameStream::new(ActivityStream::new(writer, activity.clone()));

    debug!("udp tunnel {} established, outbound {}", peer_addr, outbound_addr);

    let tunnel = async {
        let l2r = forward_frames(reader, &outbound, peer_addr);
        let r2l = frame_replies(writer, &outbound, &activity, peer_addr);

        tokio::pin!(l2r);
        tokio::pin!(r2l);

        match future::select(l2r, r2l).await {
            Either::Left((Ok(..), ..)) => {
                trace!("udp tunnel {} -> remote closed", peer_addr);
                Ok(())
            }
            Either::Left((Err(err), ..)) => {
                trace!("udp tunnel {} -> remote closed with error: {}", peer_addr, err);
                Err(err)
            }
            Either::Right((Ok(..), ..)) => {
                trace!("udp tunnel {} <- remote closed", peer_addr);
                Ok(())
            }
            Either::Right((Err(err), ..)) => {
                trace!("udp tunnel {} <- remote closed with error: {}", peer_addr, err);
                Err(err)
            }
        }
    };

    match sessions.run_scoped(session, watchdog.supervise(tunnel)).await {
        Some(Some(result)) => result,
        Some(None) => {
            debug!("udp tunnel {} idle for {:?}, closed", peer_addr, idle_timeout);
            Ok(())
        }
        None => {
            warn!("udp tunnel {} already has a session", peer_addr);
            Ok(())
        }
    }
}

async fn forward_frames<R>(mut reader: UdpFrameStream<R>, outbound: &UdpSocket, peer_addr: SocketAddr) -> io::Result<()>
where
    R: tokio::io::AsyncRead + Unpin,
{
    while let Some((target, payload)) = reader.recv_from().await? {
        trace!("udp tunnel {} -> {} {} bytes", peer_addr, target, payload.len());
        if let Err(err) = send_to_address(outbound, &payload, &target).await {
            debug!("udp tunnel {} -> {} failed with error: {}", peer_addr, target, err);
        }
    }
    Ok(())
}

async fn frame_replies<W>(
    mut writer: UdpFrameStream<W>,
    outbound: &UdpSocket,
    activity: &Activity,
    peer_addr: SocketAddr,
) -> io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE];

    loop {
        let (n, src) = outbound.recv_from(&mut buffer).await?;
        activity.touch();

        trace!("udp tunnel {} <- {} {} bytes", peer_addr, src, n);
        let source = Address::from(src);
        if let Err(err) = writer.send_to(&buffer[..n], &source).await {
            if err.kind() == io::ErrorKind::InvalidData {
                debug!("udp tunnel {} dropped reply from {}, error: {}", peer_addr, src, err);
                continue;
            }
            return Err(err);
        }
    }
}
