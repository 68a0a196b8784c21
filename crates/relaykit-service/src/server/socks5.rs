//! SOCKS5 server, serving CONNECT and UDP ASSOCIATE

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use futures::future::{self, Either};
use log::{debug, error, info, trace, warn};
use relaykit::{
    net::tcp_connect_timeout,
    relay::socks5::{
        Address, Backend, Command, HandshakeInfo, Reply, Socks5Acceptor, Socks5Error, TcpRequestHeader, send_reply,
    },
    session::{Activity, ActivityStream, IdleWatchdog, Session, SessionRegistry},
};
use tokio::{
    io::{copy, split},
    net::{TcpListener, TcpStream, UdpSocket},
    time,
};

use super::udp_associate::UdpAssociation;
use crate::config::Socks5Config;

/// A negotiated client connection
pub struct Socks5Session {
    peer_addr: SocketAddr,
    command: Command,
    target: Address,
    activity: Arc<Activity>,
}

impl Socks5Session {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn command(&self) -> Command {
        self.command
    }

    /// Requested destination, unspecified for most UDP ASSOCIATE requests
    pub fn target(&self) -> &Address {
        &self.target
    }

    pub fn activity(&self) -> &Arc<Activity> {
        &self.activity
    }
}

impl Session for Socks5Session {
    type Key = SocketAddr;

    fn key(&self) -> SocketAddr {
        self.peer_addr
    }
}

struct Socks5Context {
    acceptor: Socks5Acceptor,
    udp_associate: bool,
    timeout: Duration,
    idle_timeout: Duration,
    sessions: Arc<SessionRegistry<Socks5Session>>,
}

/// SOCKS5 server
pub struct Socks5Server {
    listener: TcpListener,
    context: Arc<Socks5Context>,
}

impl Socks5Server {
    /// Binds the listener of `config`
    ///
    /// `timeout` bounds negotiation and the connect to the destination, sessions without traffic for
    /// `idle_timeout` are closed.
    pub async fn bind(config: &Socks5Config, timeout: Duration, idle_timeout: Duration) -> io::Result<Socks5Server> {
        let listener = TcpListener::bind(config.listen).await?;

        let context = Socks5Context {
            acceptor: Socks5Acceptor::new(config.auth.clone()),
            udp_associate: config.udp_associate,
            timeout,
            idle_timeout,
            sessions: Arc::new(SessionRegistry::new()),
        };

        Ok(Socks5Server {
            listener,
            context: Arc::new(context),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Live client sessions
    pub fn sessions(&self) -> Arc<SessionRegistry<Socks5Session>> {
        self.context.sessions.clone()
    }

    /// Accepts clients until the listener fails
    pub async fn run(self) -> io::Result<()> {
        info!("socks5 server listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(s) => s,
                Err(err) => {
                    error!("socks5 server accept failed with error: {}", err);
                    time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let context = self.context.clone();
            tokio::spawn(async move {
                if let Err(err) = context.serve_client(stream, peer_addr).await {
                    debug!("socks5 client {} closed with error: {}", peer_addr, err);
                }
            });
        }
    }
}

impl Socks5Context {
    async fn serve_client(&self, mut stream: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        let _ = stream.set_nodelay(true);

        let header = match self.acceptor.accept(&mut stream, self.timeout).await {
            Ok(h) => h,
            Err(Socks5Error::IoError(ref err)) if err.kind() == ErrorKind::UnexpectedEof => {
                trace!("socks5 client {} closed before negotiation completed", peer_addr);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        debug!("socks5 {} requested {:?} {}", peer_addr, header.command, header.address);

        let info = match self.open_backend(&stream, &header).await {
            Ok(info) => info,
            Err(err) => {
                let reply = err.as_reply();
                debug!("socks5 {} {:?} {} failed, reply {:?}", peer_addr, header.command, header.address, reply);
                let _ = send_reply(&mut stream, reply, &Address::unspecified()).await;
                return Err(err.into());
            }
        };

        send_reply(&mut stream, Reply::Succeeded, &info.bound).await?;

        let activity = Arc::new(Activity::new());
        let session = Arc::new(Socks5Session {
            peer_addr,
            command: info.command,
            target: header.address.clone(),
            activity: activity.clone(),
        });
        let watchdog = IdleWatchdog::new(activity.clone(), self.idle_timeout);

        let relay = async {
            match info.backend {
                Backend::Tcp(remote) => establish_tcp_tunnel(stream, remote, &activity, peer_addr, &header.address).await,
                Backend::Udp(socket) => {
                    UdpAssociation::new(socket, peer_addr.ip(), activity.clone(), self.idle_timeout)
                        .serve(stream)
                        .await
                }
                Backend::None => Ok(()),
            }
        };

        match self.sessions.run_scoped(session, watchdog.supervise(relay)).await {
            Some(Some(result)) => result,
            Some(None) => {
                debug!("socks5 client {} idle for {:?}, closed", peer_addr, self.idle_timeout);
                Ok(())
            }
            None => {
                warn!("socks5 client {} already has a session", peer_addr);
                Ok(())
            }
        }
    }

    async fn open_backend(&self, stream: &TcpStream, header: &TcpRequestHeader) -> Result<HandshakeInfo, Socks5Error> {
        match header.command {
            Command::TcpConnect => {
                let remote = tcp_connect_timeout(&header.address, self.timeout).await?;
                let _ = remote.set_nodelay(true);
                let bound = remote.local_addr()?;
                Ok(HandshakeInfo::new(Command::TcpConnect, bound.into()).with_backend(Backend::Tcp(remote)))
            }
            Command::UdpAssociate if self.udp_associate => {
                // The relay endpoint lives on the interface the client reached us on
                let local_addr = stream.local_addr()?;
                let socket = UdpSocket::bind(SocketAddr::new(local_addr.ip(), 0)).await?;
                let bound = socket.local_addr()?;
                Ok(HandshakeInfo::new(Command::UdpAssociate, bound.into()).with_backend(Backend::Udp(socket)))
            }
            command => {
                warn!("socks5 command {:?} is not enabled", command);
                Err(Socks5Error::CommandNotSupported)
            }
        }
    }
}

async fn establish_tcp_tunnel(
    stream: TcpStream,
    mut remote: TcpStream,
    activity: &Arc<Activity>,
    peer_addr: SocketAddr,
    target_addr: &Address,
) -> io::Result<()> {
    let (mut lr, mut lw) = split(ActivityStream::new(stream, activity.clone()));
    let (mut rr, mut rw) = remote.split();

    let l2r = copy(&mut lr, &mut rw);
    let r2l = copy(&mut rr, &mut lw);

    tokio::pin!(l2r);
    tokio::pin!(r2l);

    debug!("established tcp tunnel {} <-> {}", peer_addr, target_addr);

    match future::select(l2r, r2l).await {
        Either::Left((Ok(..), ..)) => {
            trace!("tcp tunnel {} -> {} closed", peer_addr, target_addr);
        }
        Either::Left((Err(err), ..)) => {
            trace!("tcp tunnel {} -> {} closed with error: {}", peer_addr, target_addr, err);
        }
        Either::Right((Ok(..), ..)) => {
            trace!("tcp tunnel {} <- {} closed", peer_addr, target_addr);
        }
        Either::Right((Err(err), ..)) => {
            trace!("tcp tunnel {} <- {} closed with error: {}", peer_addr, target_addr, err);
        }
    }

    Ok(())
}
