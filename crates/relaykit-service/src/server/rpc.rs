//! RPC server

use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use log::{debug, error, info, trace, warn};
use relaykit::{
    rpc::{Handlers, RpcPeer},
    session::{Activity, ActivityStream, IdleWatchdog, Session, SessionRegistry},
};
use tokio::{
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    time,
};

use crate::config::ListenConfig;

/// Server side peer of one connection
pub type ServerPeer = RpcPeer<ActivityStream<OwnedWriteHalf>>;

/// A connected RPC client
pub struct RpcSession {
    peer_addr: SocketAddr,
    peer: Arc<ServerPeer>,
}

impl RpcSession {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Calls and notifications towards the client go through this peer
    pub fn peer(&self) -> &Arc<ServerPeer> {
        &self.peer
    }
}

impl Session for RpcSession {
    type Key = SocketAddr;

    fn key(&self) -> SocketAddr {
        self.peer_addr
    }
}

struct RpcContext {
    handlers: Arc<Handlers>,
    timeout: Duration,
    idle_timeout: Duration,
    sessions: Arc<SessionRegistry<RpcSession>>,
}

/// RPC server
///
/// All connections dispatch to the same handler table, `ping` answers with its arguments unless the table already
/// has its own.
pub struct RpcServer {
    listener: TcpListener,
    context: Arc<RpcContext>,
}

impl RpcServer {
    pub async fn bind(
        config: &ListenConfig,
        handlers: Arc<Handlers>,
        timeout: Duration,
        idle_timeout: Duration,
    ) -> io::Result<RpcServer> {
        let listener = TcpListener::bind(config.listen).await?;

        if !handlers.contains("ping") {
            handlers.register("ping", |body| async move { Ok(body) });
        }

        let context = RpcContext {
            handlers,
            timeout,
            idle_timeout,
            sessions: Arc::new(SessionRegistry::new()),
        };

        Ok(RpcServer {
            listener,
            context: Arc::new(context),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handlers(&self) -> &Arc<Handlers> {
        &self.context.handlers
    }

    /// Connected clients
    pub fn sessions(&self) -> Arc<SessionRegistry<RpcSession>> {
        self.context.sessions.clone()
    }

    /// Accepts clients until the listener fails
    pub async fn run(self) -> io::Result<()> {
        info!("rpc server listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, peer_addr) = match self.listener.accept().await {
                Ok(s) => s,
                Err(err) => {
                    error!("rpc server accept failed with error: {}", err);
                    time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let context = self.context.clone();
            tokio::spawn(async move {
                if let Err(err) = context.serve_client(stream, peer_addr).await {
                    debug!("rpc client {} closed with error: {}", peer_addr, err);
                }
            });
        }
    }
}

impl RpcContext {
    async fn serve_client(&self, stream: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        let _ = stream.set_nodelay(true);

        let activity = Arc::new(Activity::new());
        let (reader, writer) = stream.into_split();
        let peer = Arc::new(RpcPeer::new(
            ActivityStream::new(writer, activity.clone()),
            self.handlers.clone(),
        ));

        let session = Arc::new(RpcSession {
            peer_addr,
            peer: peer.clone(),
        });
        let watchdog = IdleWatchdog::new(activity.clone(), self.idle_timeout);

        debug!("rpc client {} connected", peer_addr);

        let dispatch = peer.clone().run(ActivityStream::new(reader, activity));
        let result = match self.sessions.run_scoped(session, watchdog.supervise(dispatch)).await {
            Some(Some(result)) => result.map_err(io::Error::from),
            Some(None) => {
                debug!("rpc client {} idle for {:?}, closed", peer_addr, self.idle_timeout);
                Ok(())
            }
            None => {
                warn!("rpc client {} already has a session", peer_addr);
                Ok(())
            }
        };

        if let Err(err) = peer.close(self.timeout).await {
            trace!("rpc client {} shutdown failed with error: {}", peer_addr, err);
        }
        result
    }
}

/// Sends a notification to every connected client, returns how many were reached
pub async fn broadcast(sessions: &SessionRegistry<RpcSession>, method: &str, args: &[u8]) -> usize {
    let mut reached = 0;
    for session in sessions.snapshot().await {
        match session.peer.notify(method, args).await {
            Ok(()) => reached += 1,
            Err(err) => debug!("rpc notify {} to {} failed with error: {}", method, session.peer_addr, err),
        }
    }
    reached
}
