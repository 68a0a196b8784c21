//! UDP ASSOCIATE relay
//!
//! Datagrams arriving on the relay socket carry the SOCKS5 UDP envelope with RSV ignored. Every client source
//! endpoint gets its own outbound socket, so replies can be told apart and wrapped with their literal source
//! before going back to that client.

use std::{
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use futures::future::{self, AbortHandle, Abortable, Either};
use log::{debug, error, trace, warn};
use relaykit::{
    relay::{
        socks5::Address,
        udprelay::{decode_udp_packet, encode_udp_header},
    },
    session::{Activity, IdleWatchdog, Session, SessionRegistry},
};
use tokio::{
    io::AsyncReadExt,
    net::{TcpStream, UdpSocket},
    time,
};

/// Largest datagram we ever receive
pub const MAXIMUM_UDP_PAYLOAD_SIZE: usize = 65536;

/// Pause after a failed receive on the relay socket
const RECV_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Errors a relay socket may report and still keep working
fn is_transient_recv_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
    )
}

/// Unspecified address in the same family as `addr`, port 0
pub(crate) fn outbound_bind_addr(addr: &SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(..) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        SocketAddr::V6(..) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
    }
}

/// Sends `payload` to `target`, resolving domain names
pub(crate) async fn send_to_address(socket: &UdpSocket, payload: &[u8], target: &Address) -> io::Result<usize> {
    match *target {
        Address::SocketAddress(ref sa) => socket.send_to(payload, sa).await,
        Address::DomainNameAddress(ref dname, port) => socket.send_to(payload, (dname.as_str(), port)).await,
    }
}

/// A client source endpoint of an association
pub struct UdpPeer {
    client: SocketAddr,
    outbound: Arc<UdpSocket>,
    activity: Arc<Activity>,
    abort: AbortHandle,
}

impl UdpPeer {
    pub fn client(&self) -> SocketAddr {
        self.client
    }

    /// Local address of the socket talking to destinations
    pub fn outbound_addr(&self) -> io::Result<SocketAddr> {
        self.outbound.local_addr()
    }

    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }
}

impl Session for UdpPeer {
    type Key = SocketAddr;

    fn key(&self) -> SocketAddr {
        self.client
    }
}

/// One UDP ASSOCIATE, alive as long as its control connection
pub struct UdpAssociation {
    relay: Arc<UdpSocket>,
    client_ip: IpAddr,
    activity: Arc<Activity>,
    idle_timeout: Duration,
    peers: Arc<SessionRegistry<UdpPeer>>,
}

impl UdpAssociation {
    /// Relays datagrams received on `relay` from `client_ip`
    ///
    /// `activity` is touched by traffic in both directions, each peer is dropped after `idle_timeout` without
    /// traffic of its own.
    pub fn new(relay: UdpSocket, client_ip: IpAddr, activity: Arc<Activity>, idle_timeout: Duration) -> UdpAssociation {
        UdpAssociation {
            relay: Arc::new(relay),
            client_ip,
            activity,
            idle_timeout,
            peers: Arc::new(SessionRegistry::new()),
        }
    }

    pub fn relay_addr(&self) -> io::Result<SocketAddr> {
        self.relay.local_addr()
    }

    pub fn peers(&self) -> &Arc<SessionRegistry<UdpPeer>> {
        &self.peers
    }

    /// Relays until `control` is closed by the client
    pub async fn serve(self, control: TcpStream) -> io::Result<()> {
        let relay_addr = self.relay.local_addr()?;
        debug!("udp associate relay {} serving {}", relay_addr, self.client_ip);

        let relay = self.relay_client_datagrams();
        let control = wait_closed(control);

        tokio::pin!(relay);
        tokio::pin!(control);

        let result = match future::select(relay, control).await {
            Either::Left((result, ..)) => result,
            Either::Right((result, ..)) => {
                trace!("udp associate relay {} control connection closed", relay_addr);
                result
            }
        };

        for peer in self.peers.drain().await {
            peer.abort.abort();
        }
        result
    }

    async fn relay_client_datagrams(&self) -> io::Result<()> {
        let mut buffer = vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE];

        loop {
            let (n, src) = match self.relay.recv_from(&mut buffer).await {
                Ok(r) => r,
                Err(err) if is_transient_recv_error(&err) => {
                    debug!("udp associate relay recv failed with error: {}", err);
                    time::sleep(RECV_ERROR_BACKOFF).await;
                    continue;
                }
                Err(err) => {
                    error!("udp associate relay recv failed with error: {}, association closed", err);
                    return Err(err);
                }
            };

            if src.ip() != self.client_ip {
                warn!("udp associate dropped datagram from {}, expecting {}", src, self.client_ip);
                continue;
            }

            let packet = match decode_udp_packet(&buffer[..n], false) {
                Ok(p) => p,
                Err(err) => {
                    debug!("udp associate dropped datagram from {}, error: {}", src, err);
                    continue;
                }
            };

            if packet.frag != 0 {
                trace!("udp associate dropped fragment {} from {}", packet.frag, src);
                continue;
            }

            self.activity.touch();

            let peer = self.peer(src).await?;
            peer.activity.touch();

            trace!("udp associate {} -> {} {} bytes", src, packet.address, packet.payload.len());
            if let Err(err) = send_to_address(&peer.outbound, packet.payload, &packet.address).await {
                debug!("udp associate {} -> {} failed with error: {}", src, packet.address, err);
            }
        }
    }

    async fn peer(&self, client: SocketAddr) -> io::Result<Arc<UdpPeer>> {
        if let Some(peer) = self.peers.find(&client).await {
            return Ok(peer);
        }

        let relay_addr = self.relay.local_addr()?;
        let outbound = Arc::new(UdpSocket::bind(outbound_bind_addr(&relay_addr)).await?);
        let activity = Arc::new(Activity::new());
        let (abort, registration) = AbortHandle::new_pair();

        let peer = Arc::new(UdpPeer {
            client,
            outbound: outbound.clone(),
            activity: activity.clone(),
            abort,
        });
        self.peers.emplace(peer.clone()).await;

        let watchdog = IdleWatchdog::new(activity.clone(), self.idle_timeout);
        let replies = relay_replies(self.relay.clone(), outbound, client, activity, self.activity.clone());
        let peers = self.peers.clone();
        tokio::spawn(Abortable::new(
            async move {
                match watchdog.supervise(replies).await {
                    Some(Err(err)) => debug!("udp associate peer {} failed with error: {}", client, err),
                    Some(Ok(())) => {}
                    None => debug!("udp associate peer {} idle, removed", client),
                }
                peers.erase(&client).await;
            },
            registration,
        ));

        Ok(peer)
    }
}

async fn relay_replies(
    relay: Arc<UdpSocket>,
    outbound: Arc<UdpSocket>,
    client: SocketAddr,
    activity: Arc<Activity>,
    association: Arc<Activity>,
) -> io::Result<()> {
    let mut buffer = vec![0u8; MAXIMUM_UDP_PAYLOAD_SIZE];

    loop {
        let (n, src) = outbound.recv_from(&mut buffer).await?;
        activity.touch();
        association.touch();

        let datagram = match encode_udp_header(&buffer[..n], &src.ip().to_string(), src.port()) {
            Ok(d) => d,
            Err(err) => {
                debug!("udp associate dropped reply from {}, error: {}", src, err);
                continue;
            }
        };

        trace!("udp associate {} <- {} {} bytes", client, src, n);
        relay.send_to(&datagram, client).await?;
    }
}

async fn wait_closed(mut control: TcpStream) -> io::Result<()> {
    let mut buffer = [0u8; 64];
    loop {
        if control.read(&mut buffer).await? == 0 {
            return Ok(());
        }
    }
}
