//! RPC call correlation and dispatch

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use byte_string::ByteStr;
use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};
use serde::{Serialize, de::DeserializeOwned};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, tcp::OwnedWriteHalf},
    sync::{Mutex, oneshot},
    time,
};

use super::{
    error::RpcError,
    handler::{HandlerResult, Handlers},
    protocol::{MessageKind, NOTIFICATION_ID, RpcHeader, Status, decode_frame, encode_frame, rpc_frame_boundary},
};
use crate::{
    net::{read_frame, tcp_connect_timeout},
    relay::Address,
};

type CallResult = Result<Bytes, RpcError>;
type PendingTable = spin::Mutex<HashMap<u64, oneshot::Sender<CallResult>>>;

struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.pending.lock().remove(&self.id).is_some() {
            trace!("rpc call id {} abandoned", self.id);
        }
    }
}

/// What [`RpcPeer::dispatch`] did with a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A request was handled and answered
    Replied,
    /// A notification was handled, nothing is sent back
    Notified,
    /// A response completed a pending call
    Delivered,
    /// A response matched no pending call, usually one that already timed out
    Dropped,
}

/// One end of an RPC connection
///
/// Any number of calls may be outstanding at once. Writes go through an async mutex so frames never interleave. The
/// pending table is only touched in short critical sections and sits behind a spin lock. Inbound frames are fed by a
/// single reader, either [`RpcPeer::run`] or the caller through [`RpcPeer::dispatch`].
pub struct RpcPeer<W> {
    writer: Mutex<W>,
    pending: PendingTable,
    next_id: AtomicU64,
    handlers: Arc<Handlers>,
    closed: AtomicBool,
}

impl<W> RpcPeer<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(writer: W, handlers: Arc<Handlers>) -> RpcPeer<W> {
        RpcPeer {
            writer: Mutex::new(writer),
            pending: PendingTable::default(),
            next_id: AtomicU64::new(1),
            handlers,
            closed: AtomicBool::new(false),
        }
    }

    /// Inbound method table, possibly shared with other peers
    pub fn handlers(&self) -> &Arc<Handlers> {
        &self.handlers
    }

    /// Registers a handler in this peer's method table
    pub fn register_handler<M, F, Fut>(&self, method: M, handler: F)
    where
        M: Into<String>,
        F: Fn(Bytes) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handlers.register(method, handler);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != NOTIFICATION_ID {
                return id;
            }
        }
    }

    async fn write_frame(&self, frame: &[u8]) -> Result<(), RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }

        let mut writer = self.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Calls `method` on the remote end and waits up to `timeout` for its response
    ///
    /// The pending entry is gone once this returns or the future is dropped.
    pub async fn call(&self, method: &str, args: &[u8], timeout: Duration) -> Result<Bytes, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed);
        }

        let id = self.next_id();
        let frame = encode_frame(&RpcHeader::request(id, method), args)?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };
        trace!("rpc call {} id {} with {} bytes {:?}", method, id, args.len(), ByteStr::new(args));

        let exchange = async move {
            if let Err(err) = self.write_frame(&frame).await {
                return Err(err);
            }
            rx.await.unwrap_or(Err(RpcError::Closed))
        };

        match time::timeout(timeout, exchange).await {
            Ok(r) => r,
            Err(..) => {
                debug!("rpc call {} id {} timed out after {:?}", method, id, timeout);
                Err(RpcError::Timeout)
            }
        }
    }

    /// [`RpcPeer::call`] with JSON encoded arguments and result
    pub async fn call_json<Req, Rsp>(&self, method: &str, args: &Req, timeout: Duration) -> Result<Rsp, RpcError>
    where
        Req: Serialize + ?Sized,
        Rsp: DeserializeOwned,
    {
        let args = serde_json::to_vec(args).map_err(|err| RpcError::Malformed(err.to_string()))?;
        let rsp = self.call(method, &args, timeout).await?;
        serde_json::from_slice(&rsp).map_err(|err| RpcError::Malformed(err.to_string()))
    }

    /// Sends a request with id 0, the remote end never answers it
    pub async fn notify(&self, method: &str, args: &[u8]) -> Result<(), RpcError> {
        let frame = encode_frame(&RpcHeader::notification(method), args)?;
        trace!("rpc notify {} with {} bytes {:?}", method, args.len(), ByteStr::new(args));
        self.write_frame(&frame).await
    }

    /// Handles one complete inbound frame, length prefix included
    ///
    /// Requests run their handler on the calling task. A frame that does not decode is an error and the connection
    /// should not be read any further.
    pub async fn dispatch(&self, frame: &[u8]) -> Result<DispatchOutcome, RpcError> {
        let (header, body) = decode_frame(frame)?;
        match header.kind {
            MessageKind::Request => self.handle_request(header, Bytes::copy_from_slice(body)).await,
            MessageKind::Response => Ok(self.handle_response(header, body).await),
        }
    }

    async fn handle_request(&self, header: RpcHeader, body: Bytes) -> Result<DispatchOutcome, RpcError> {
        trace!(
            "rpc request {} id {} with {} bytes {:?}",
            header.method,
            header.id,
            body.len(),
            ByteStr::new(&body)
        );

        let (reply, reply_body) = match self.handlers.get(&header.method) {
            Some(handler) => match handler(body).await {
                Ok(rsp) => (RpcHeader::response(header.id), rsp),
                Err(err) => {
                    debug!("rpc handler {} id {} failed: {}", header.method, header.id, err);
                    let reply = RpcHeader::error_response(header.id, header.method.as_str(), Status::HandlerError, err);
                    (reply, Bytes::new())
                }
            },
            None => {
                warn!("rpc request for unregistered method {}", header.method);
                let err = format!("no handler for {}", header.method);
                let reply = RpcHeader::error_response(header.id, header.method.as_str(), Status::NoHandler, err);
                (reply, Bytes::new())
            }
        };

        if header.is_notification() {
            return Ok(DispatchOutcome::Notified);
        }

        let frame = encode_frame(&reply, &reply_body)?;
        self.write_frame(&frame).await?;
        Ok(DispatchOutcome::Replied)
    }

    async fn handle_response(&self, header: RpcHeader, body: &[u8]) -> DispatchOutcome {
        let sender = self.pending.lock().remove(&header.id);
        let Some(sender) = sender else {
            debug!("rpc response id {} matches no pending call, dropped", header.id);
            return DispatchOutcome::Dropped;
        };

        let result = match header.status {
            Status::Ok => Ok(Bytes::copy_from_slice(body)),
            Status::NoHandler => Err(RpcError::NoHandler(header.method)),
            Status::HandlerError => Err(RpcError::Remote(header.error.unwrap_or_default())),
        };

        if sender.send(result).is_err() {
            trace!("rpc call id {} gave up before its response arrived", header.id);
        }
        DispatchOutcome::Delivered
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.lock().contains_key(&id)
    }

    fn fail_pending<F>(&self, make_err: F)
    where
        F: Fn() -> RpcError,
    {
        let pending = std::mem::take(&mut *self.pending.lock());
        for (id, sender) in pending {
            trace!("rpc call id {} failed on connection end", id);
            let _ = sender.send(Err(make_err()));
        }
    }

    /// Fails every outstanding call with `Closed` and shuts the write side down within `timeout`
    pub async fn close(&self, timeout: Duration) -> Result<(), RpcError> {
        self.closed.store(true, Ordering::Release);
        self.fail_pending(|| RpcError::Closed);

        let shutdown = async { self.writer.lock().await.shutdown().await };
        match time::timeout(timeout, shutdown).await {
            Ok(r) => r.map_err(From::from),
            Err(..) => Err(RpcError::Timeout),
        }
    }
}

impl<W> RpcPeer<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Reads frames from `reader` until it ends, answering requests and completing calls
    ///
    /// Each request is handled on its own task so a slow handler never holds up responses. When the stream ends
    /// every outstanding call fails with `Closed`, or with `Malformed` if a frame could not be decoded.
    pub async fn run<R>(self: Arc<Self>, mut reader: R) -> Result<(), RpcError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = BytesMut::new();

        let result = loop {
            let frame = match read_frame(&mut reader, &mut buffer, |buf| {
                rpc_frame_boundary(buf).map_err(RpcError::from)
            })
            .await
            {
                Ok(Some(frame)) => frame.freeze(),
                Ok(None) => break Ok(()),
                Err(err) => break Err(err),
            };

            let (header, body) = match decode_frame(&frame) {
                Ok((header, body)) => (header, frame.slice_ref(body)),
                Err(err) => break Err(RpcError::from(err)),
            };

            match header.kind {
                MessageKind::Request => {
                    let peer = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = peer.handle_request(header, body).await {
                            debug!("rpc failed to answer request, error: {}", err);
                        }
                    });
                }
                MessageKind::Response => {
                    self.handle_response(header, &body).await;
                }
            }
        };

        self.closed.store(true, Ordering::Release);
        match result {
            Err(RpcError::Malformed(ref msg)) => {
                warn!("rpc connection dropped on malformed frame: {}", msg);
                self.fail_pending(|| RpcError::Malformed(msg.clone()));
            }
            _ => self.fail_pending(|| RpcError::Closed),
        }
        result
    }
}

impl RpcPeer<OwnedWriteHalf> {
    /// Wraps a connected stream and spawns its dispatch loop
    pub fn spawn(stream: TcpStream, handlers: Arc<Handlers>) -> Arc<RpcPeer<OwnedWriteHalf>> {
        let (reader, writer) = stream.into_split();
        let peer = Arc::new(RpcPeer::new(writer, handlers));

        let runner = peer.clone();
        tokio::spawn(async move {
            if let Err(err) = runner.run(reader).await {
                debug!("rpc dispatch loop ended with error: {}", err);
            }
        });

        peer
    }

    /// Connects to `addr` within `timeout`, see [`RpcPeer::spawn`]
    pub async fn connect(
        addr: &Address,
        handlers: Arc<Handlers>,
        timeout: Duration,
    ) -> io::Result<Arc<RpcPeer<OwnedWriteHalf>>> {
        let stream = tcp_connect_timeout(addr, timeout).await?;
        Ok(RpcPeer::spawn(stream, handlers))
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use tokio::{
        io::{DuplexStream, WriteHalf, duplex, split},
        sync::mpsc,
    };

    use super::*;

    type DuplexPeer = Arc<RpcPeer<WriteHalf<DuplexStream>>>;

    fn connected_pair(a_handlers: Arc<Handlers>, b_handlers: Arc<Handlers>) -> (DuplexPeer, DuplexPeer) {
        let (a, b) = duplex(64 * 1024);
        let (a_reader, a_writer) = split(a);
        let (b_reader, b_writer) = split(b);

        let a = Arc::new(RpcPeer::new(a_writer, a_handlers));
        let b = Arc::new(RpcPeer::new(b_writer, b_handlers));
        tokio::spawn(a.clone().run(a_reader));
        tokio::spawn(b.clone().run(b_reader));
        (a, b)
    }

    async fn next_frame(stream: &mut DuplexStream, buffer: &mut BytesMut) -> BytesMut {
        read_frame(stream, buffer, |buf| rpc_frame_boundary(buf).map_err(RpcError::from))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn response_resolves_matching_call() {
        let _ = env_logger::try_init();

        let (local, mut remote) = duplex(4096);
        let peer = Arc::new(RpcPeer::new(local, Arc::new(Handlers::new())));

        let caller = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.call("echo", b"ping", Duration::from_secs(5)).await })
        };

        let mut buffer = BytesMut::new();
        let frame = next_frame(&mut remote, &mut buffer).await;
        let (header, body) = decode_frame(&frame).unwrap();
        assert_eq!(header.kind, MessageKind::Request);
        assert_eq!(header.method, "echo");
        assert_eq!(body, b"ping");
        assert_ne!(header.id, NOTIFICATION_ID);
        assert!(peer.is_pending(header.id));

        let stray = encode_frame(&RpcHeader::response(header.id + 100), b"nope").unwrap();
        assert_eq!(peer.dispatch(&stray).await.unwrap(), DispatchOutcome::Dropped);
        assert_eq!(peer.pending_len(), 1);

        let answer = encode_frame(&RpcHeader::response(header.id), b"pong").unwrap();
        assert_eq!(peer.dispatch(&answer).await.unwrap(), DispatchOutcome::Delivered);

        assert_eq!(caller.await.unwrap().unwrap(), Bytes::from_static(b"pong"));
        assert_eq!(peer.pending_len(), 0);
    }

    #[tokio::test]
    async fn expired_call_leaves_no_pending_entry() {
        time::pause();

        let (local, _remote) = duplex(4096);
        let peer = RpcPeer::new(local, Arc::new(Handlers::new()));

        let err = peer.call("slow", b"", Duration::from_millis(500)).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout));
        assert!(!peer.is_pending(1));
        assert_eq!(peer.pending_len(), 0);

        let late = encode_frame(&RpcHeader::response(1), b"late").unwrap();
        assert_eq!(peer.dispatch(&late).await.unwrap(), DispatchOutcome::Dropped);
    }

    #[tokio::test]
    async fn dropped_call_leaves_no_pending_entry() {
        let (local, mut remote) = duplex(4096);
        let peer = Arc::new(RpcPeer::new(local, Arc::new(Handlers::new())));

        let caller = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.call("slow", b"", Duration::from_secs(3600)).await })
        };

        let mut buffer = BytesMut::new();
        let frame = next_frame(&mut remote, &mut buffer).await;
        let (header, _) = decode_frame(&frame).unwrap();
        assert!(peer.is_pending(header.id));

        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        assert_eq!(peer.pending_len(), 0);

        // a call losing a race against a shorter future is dropped the same way
        let raced = time::timeout(Duration::from_millis(50), peer.call("slow", b"", Duration::from_secs(3600))).await;
        assert!(raced.is_err());
        assert_eq!(peer.pending_len(), 0);
    }

    #[tokio::test]
    async fn ids_skip_zero() {
        let (local, _remote) = duplex(64);
        let peer = RpcPeer::new(local, Arc::new(Handlers::new()));

        assert_eq!(peer.next_id(), 1);
        peer.next_id.store(u64::MAX, Ordering::Relaxed);
        assert_eq!(peer.next_id(), u64::MAX);
        assert_eq!(peer.next_id(), 1);
    }

    #[tokio::test]
    async fn request_dispatch_replies() {
        let (local, mut remote) = duplex(4096);
        let handlers = Arc::new(Handlers::new());
        handlers.register("upper", |body: Bytes| async move { Ok(Bytes::from(body.to_ascii_uppercase())) });
        let peer = RpcPeer::new(local, handlers);

        let request = encode_frame(&RpcHeader::request(42, "upper"), b"abc").unwrap();
        assert_eq!(peer.dispatch(&request).await.unwrap(), DispatchOutcome::Replied);

        let unknown = encode_frame(&RpcHeader::request(43, "lower"), b"ABC").unwrap();
        assert_eq!(peer.dispatch(&unknown).await.unwrap(), DispatchOutcome::Replied);

        let notification = encode_frame(&RpcHeader::notification("upper"), b"zzz").unwrap();
        assert_eq!(peer.dispatch(&notification).await.unwrap(), DispatchOutcome::Notified);

        let mut buffer = BytesMut::new();
        let frame = next_frame(&mut remote, &mut buffer).await;
        let (header, body) = decode_frame(&frame).unwrap();
        assert_eq!(header, RpcHeader::response(42));
        assert_eq!(body, b"ABC");

        let frame = next_frame(&mut remote, &mut buffer).await;
        let (header, body) = decode_frame(&frame).unwrap();
        assert_eq!(header.id, 43);
        assert_eq!(header.status, Status::NoHandler);
        assert!(body.is_empty());

        // nothing was written for the notification
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn malformed_frame_is_reported() {
        let (local, _remote) = duplex(64);
        let peer = RpcPeer::new(local, Arc::new(Handlers::new()));

        let mut frame = BytesMut::new();
        frame.extend_from_slice(&5u32.to_be_bytes());
        frame.extend_from_slice(&3u16.to_be_bytes());
        frame.extend_from_slice(b"{x}");
        assert!(matches!(peer.dispatch(&frame).await, Err(RpcError::Malformed(..))));
    }

    #[tokio::test]
    async fn calls_between_peers() {
        let _ = env_logger::try_init();

        let server = Arc::new(Handlers::new());
        server.register("echo", |body: Bytes| async move { Ok(body) });
        server.register("fail", |_body: Bytes| async move { Err("out of cheese".to_owned()) });

        let (client, _server) = connected_pair(Arc::new(Handlers::new()), server);
        let timeout = Duration::from_secs(5);

        let calls = (0..16u8).map(|i| {
            let client = client.clone();
            async move { client.call("echo", &[i; 3], timeout).await }
        });
        let results = futures::future::join_all(calls).await;
        for (i, r) in results.into_iter().enumerate() {
            assert_eq!(&r.unwrap()[..], &[i as u8; 3]);
        }

        match client.call("missing", b"", timeout).await {
            Err(RpcError::NoHandler(method)) => assert_eq!(method, "missing"),
            r => panic!("unexpected result {r:?}"),
        }
        match client.call("fail", b"", timeout).await {
            Err(RpcError::Remote(msg)) => assert_eq!(msg, "out of cheese"),
            r => panic!("unexpected result {r:?}"),
        }

        // connection still usable after the failures
        assert_eq!(&client.call("echo", b"again", timeout).await.unwrap()[..], b"again");
        assert_eq!(client.pending_len(), 0);
    }

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Sum {
        values: Vec<i64>,
    }

    #[tokio::test]
    async fn json_calls() {
        let server = Arc::new(Handlers::new());
        server.register_json("sum", |req: Sum| async move { Ok::<_, String>(req.values.iter().sum::<i64>()) });

        let (client, _server) = connected_pair(Arc::new(Handlers::new()), server);
        let timeout = Duration::from_secs(5);

        let total: i64 = client
            .call_json("sum", &Sum { values: vec![1, 2, 39] }, timeout)
            .await
            .unwrap();
        assert_eq!(total, 42);

        let err = client.call_json::<_, String>("sum", &Sum { values: vec![] }, timeout).await;
        assert!(matches!(err, Err(RpcError::Malformed(..))));

        let err = client.call_json::<_, i64>("sum", "not a sum", timeout).await;
        assert!(matches!(err, Err(RpcError::Remote(..))));
    }

    #[tokio::test]
    async fn notifications_are_not_answered() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let server = Arc::new(Handlers::new());
        server.register("log", move |body: Bytes| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(body);
                Ok(Bytes::new())
            }
        });

        let (client, server) = connected_pair(Arc::new(Handlers::new()), server);
        client.notify("log", b"hello").await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(client.pending_len(), 0);
        assert_eq!(server.pending_len(), 0);
    }

    #[tokio::test]
    async fn pending_calls_fail_when_stream_ends() {
        let (local, mut remote) = duplex(4096);
        let (reader, writer) = split(local);
        let peer = Arc::new(RpcPeer::new(writer, Arc::new(Handlers::new())));
        let runner = tokio::spawn(peer.clone().run(reader));

        let caller = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.call("never", b"", Duration::from_secs(60)).await })
        };

        let mut buffer = BytesMut::new();
        let _ = next_frame(&mut remote, &mut buffer).await;
        drop(remote);

        assert!(matches!(caller.await.unwrap(), Err(RpcError::Closed)));
        assert!(runner.await.unwrap().is_ok());
        assert!(peer.is_closed());
        assert!(matches!(
            peer.call("again", b"", Duration::from_secs(1)).await,
            Err(RpcError::Closed)
        ));
    }

    #[tokio::test]
    async fn close_fails_outstanding_calls() {
        let (local, mut remote) = duplex(4096);
        let peer = Arc::new(RpcPeer::new(local, Arc::new(Handlers::new())));

        let caller = {
            let peer = peer.clone();
            tokio::spawn(async move { peer.call("never", b"", Duration::from_secs(60)).await })
        };
        let mut buffer = BytesMut::new();
        let _ = next_frame(&mut remote, &mut buffer).await;

        peer.close(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(caller.await.unwrap(), Err(RpcError::Closed)));
        assert!(peer.notify("late", b"").await.is_err());
    }
}
