//! SOCKS5 client side negotiation

use std::{
    io,
    pin::Pin,
    task::{self, Poll},
    time::Duration,
};

use log::trace;
use pin_project::pin_project;
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpStream, UdpSocket},
    time,
};

use super::{
    Address, AuthMethod, Command, FailReason, HandshakeRequest, HandshakeResponse, PasswdAuthRequest,
    PasswdAuthResponse, Reply, Socks5Error, TcpRequestHeader, TcpResponseHeader, consts,
};
use crate::net::tcp_connect;

/// Parameters of one negotiation attempt
///
/// `destination` may be left empty for UDP ASSOCIATE, it is then filled with `0.0.0.0:0`. `bound` is filled from the
/// proxy's reply once negotiation succeeds.
#[derive(Clone, Debug)]
pub struct Socks5Option {
    /// Proxy endpoint
    pub proxy: Address,
    /// Authentication methods offered in the greeting
    pub methods: Vec<AuthMethod>,
    /// Username and password for RFC1929 authentication
    pub credentials: Option<(String, String)>,
    pub destination: Option<Address>,
    pub command: Command,
    pub bound: Option<Address>,
}

impl Socks5Option {
    /// Anonymous `command` through `proxy`
    pub fn new(proxy: Address, command: Command) -> Socks5Option {
        Socks5Option {
            proxy,
            methods: vec![AuthMethod::Anonymous],
            credentials: None,
            destination: None,
            command,
            bound: None,
        }
    }

    pub fn with_destination<A: Into<Address>>(mut self, destination: A) -> Socks5Option {
        self.destination = Some(destination.into());
        self
    }

    /// Sets credentials and offers username/password authentication ahead of the other methods
    pub fn with_credentials<U, P>(mut self, uname: U, passwd: P) -> Socks5Option
    where
        U: Into<String>,
        P: Into<String>,
    {
        self.credentials = Some((uname.into(), passwd.into()));
        if !self.methods.contains(&AuthMethod::Password) {
            self.methods.insert(0, AuthMethod::Password);
        }
        self
    }
}

/// Resource opened for a negotiated command
#[derive(Debug, Default)]
pub enum Backend {
    /// Nothing opened yet, or the command needs no backend
    #[default]
    None,
    /// Outbound connection for CONNECT
    Tcp(TcpStream),
    /// Relay socket for UDP ASSOCIATE
    Udp(UdpSocket),
}

impl Backend {
    pub fn is_none(&self) -> bool {
        matches!(*self, Backend::None)
    }

    pub fn into_tcp(self) -> Option<TcpStream> {
        match self {
            Backend::Tcp(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_udp(self) -> Option<UdpSocket> {
        match self {
            Backend::Udp(s) => Some(s),
            _ => None,
        }
    }
}

/// Outcome of a successful negotiation
#[derive(Debug)]
pub struct HandshakeInfo {
    pub command: Command,
    /// Endpoint reported in the reply's BND.ADDR / BND.PORT
    pub bound: Address,
    pub backend: Backend,
}

impl HandshakeInfo {
    pub fn new(command: Command, bound: Address) -> HandshakeInfo {
        HandshakeInfo {
            command,
            bound,
            backend: Backend::None,
        }
    }

    pub fn with_backend(mut self, backend: Backend) -> HandshakeInfo {
        self.backend = backend;
        self
    }
}

/// Progress of a client negotiation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    MethodsSent,
    MethodChosen(u8),
    AuthSent,
    AuthResult,
    RequestSent,
    ReplyReceived(Reply),
    Established,
    Failed(FailReason),
}

/// Drives one client negotiation over a connected stream
///
/// The state is kept after [`Socks5Handshake::run`] returns, so callers can tell where a failure happened. Nothing is
/// retried.
pub struct Socks5Handshake<'a, S> {
    stream: &'a mut S,
    option: &'a mut Socks5Option,
    state: HandshakeState,
}

impl<'a, S> Socks5Handshake<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: &'a mut S, option: &'a mut Socks5Option) -> Socks5Handshake<'a, S> {
        Socks5Handshake {
            stream,
            option,
            state: HandshakeState::Init,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Runs the negotiation to `Established` or `Failed`, the whole exchange bounded by `timeout`
    pub async fn run(&mut self, timeout: Duration) -> Result<HandshakeInfo, Socks5Error> {
        let result = match time::timeout(timeout, self.drive()).await {
            Ok(r) => r,
            Err(..) => Err(Socks5Error::Timeout),
        };

        match result {
            Ok(info) => {
                self.state = HandshakeState::Established;
                Ok(info)
            }
            Err(err) => {
                trace!(
                    "socks5 negotiation with {} failed in state {:?}, error: {}",
                    self.option.proxy, self.state, err
                );
                self.state = HandshakeState::Failed(err.reason());
                Err(err)
            }
        }
    }

    async fn drive(&mut self) -> Result<HandshakeInfo, Socks5Error> {
        if self.option.methods.is_empty() {
            return Err(Socks5Error::NoMethodsOffered);
        }
        if self.option.methods.len() > u8::MAX as usize {
            return Err(Socks5Error::TooManyMethods(self.option.methods.len()));
        }
        if self.option.methods.contains(&AuthMethod::Password) && self.option.credentials.is_none() {
            return Err(Socks5Error::MissingCredentials);
        }

        let command = self.option.command;
        let destination = match self.option.destination {
            Some(ref addr) => addr.clone(),
            None if command == Command::UdpAssociate => {
                let addr = Address::unspecified();
                self.option.destination = Some(addr.clone());
                addr
            }
            None => return Err(Socks5Error::MissingDestination(command)),
        };
        destination.check()?;

        let stream = &mut *self.stream;

        // 1. Greeting
        let greeting = HandshakeRequest::new(self.option.methods.iter().map(|m| m.as_u8()).collect());
        trace!("socks5 greeting to {}: {:?}", self.option.proxy, greeting);
        greeting.write_to(stream).await?;
        self.state = HandshakeState::MethodsSent;

        let chosen = HandshakeResponse::read_from(stream).await?.chosen_method;
        self.state = HandshakeState::MethodChosen(chosen);
        trace!("socks5 proxy {} chose method {:#x}", self.option.proxy, chosen);

        if chosen == consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE {
            return Err(Socks5Error::AuthRejected);
        }
        if !greeting.methods.contains(&chosen) {
            return Err(Socks5Error::UnexpectedAuthMethod(chosen));
        }

        // 2. Optional username/password sub-negotiation
        if chosen == consts::SOCKS5_AUTH_METHOD_PASSWORD {
            let (uname, passwd) = self.option.credentials.as_ref().ok_or(Socks5Error::MissingCredentials)?;
            let auth = PasswdAuthRequest::new(uname.as_bytes(), passwd.as_bytes())?;
            auth.write_to(stream).await?;
            self.state = HandshakeState::AuthSent;

            let status = PasswdAuthResponse::read_from(stream).await?.status;
            self.state = HandshakeState::AuthResult;
            if status != consts::SOCKS5_PASSWD_AUTH_SUCCEEDED {
                return Err(Socks5Error::PasswdAuthRejected(status));
            }
        }

        // 3. Command
        let request = TcpRequestHeader::new(command, destination);
        trace!("socks5 request to {}: {:?}", self.option.proxy, request);
        request.write_to(stream).await?;
        self.state = HandshakeState::RequestSent;

        let response = TcpResponseHeader::read_from(stream).await?;
        self.state = HandshakeState::ReplyReceived(response.reply);
        trace!("socks5 reply from {}: {:?}", self.option.proxy, response);

        if let Some(err) = Socks5Error::from_reply(response.reply) {
            return Err(err);
        }

        self.option.bound = Some(response.address.clone());
        Ok(HandshakeInfo::new(command, response.address))
    }
}

/// Negotiates `option.command` over `stream`
///
/// On success `option.bound` holds the endpoint from the proxy's reply, which is also returned in the
/// [`HandshakeInfo`]. The returned info never carries a backend, the stream stays with the caller.
pub async fn negotiate<S>(
    stream: &mut S,
    option: &mut Socks5Option,
    timeout: Duration,
) -> Result<HandshakeInfo, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    Socks5Handshake::new(stream, option).run(timeout).await
}

/// TCP tunnel through a SOCKS5 proxy
#[pin_project]
#[derive(Debug)]
pub struct Socks5TcpClient {
    #[pin]
    stream: TcpStream,
    bound: Address,
}

impl Socks5TcpClient {
    /// Connects to `addr` via `proxy` without authentication
    pub async fn connect<A>(addr: A, proxy: Address, timeout: Duration) -> Result<Socks5TcpClient, Socks5Error>
    where
        A: Into<Address>,
    {
        let mut option = Socks5Option::new(proxy, Command::TcpConnect).with_destination(addr);
        Socks5TcpClient::connect_with_option(&mut option, timeout).await
    }

    /// UDP Associate via `proxy`
    ///
    /// According to RFC, `addr` is the address that your UDP socket binds to. Returns the control connection, which
    /// has to be kept open for as long as the association is used, and the relay endpoint.
    pub async fn udp_associate<A>(
        addr: A,
        proxy: Address,
        timeout: Duration,
    ) -> Result<(Socks5TcpClient, Address), Socks5Error>
    where
        A: Into<Address>,
    {
        let mut option = Socks5Option::new(proxy, Command::UdpAssociate).with_destination(addr);
        let client = Socks5TcpClient::connect_with_option(&mut option, timeout).await?;
        let relay = client.bound.clone();
        Ok((client, relay))
    }

    /// Connects to `option.proxy` and negotiates `option.command`
    pub async fn connect_with_option(
        option: &mut Socks5Option,
        timeout: Duration,
    ) -> Result<Socks5TcpClient, Socks5Error> {
        let mut stream = match time::timeout(timeout, tcp_connect(&option.proxy)).await {
            Ok(r) => r?,
            Err(..) => return Err(Socks5Error::Timeout),
        };
        trace!("connected to socks5 proxy {}", option.proxy);

        let info = negotiate(&mut stream, option, timeout).await?;
        Ok(Socks5TcpClient {
            stream,
            bound: info.bound,
        })
    }

    /// Endpoint the proxy reported in its reply
    pub fn bound_addr(&self) -> &Address {
        &self.bound
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

impl AsyncRead for Socks5TcpClient {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), io::Error>> {
        self.project().stream.poll_read(cx, buf)
    }
}

impl AsyncWrite for Socks5TcpClient {
    fn poll_write(self: Pin<&mut Self>, cx: &mut task::Context<'_>, buf: &[u8]) -> Poll<Result<usize, io::Error>> {
        self.project().stream.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Result<(), io::Error>> {
        self.project().stream.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Result<(), io::Error>> {
        self.project().stream.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use tokio::io::{AsyncReadExt, DuplexStream, duplex};

    use super::*;

    fn proxy_addr() -> Address {
        "127.0.0.1:1080".parse().unwrap()
    }

    /// Proxy double answering the greeting with `chosen` and the request with `reply`
    ///
    /// Returns the greeting and request it read, and whatever else arrived until the client hung up.
    async fn proxy_double(
        mut stream: DuplexStream,
        chosen: u8,
        reply: u8,
        bound: Address,
    ) -> (HandshakeRequest, Option<TcpRequestHeader>, Vec<u8>) {
        let greeting = HandshakeRequest::read_from(&mut stream).await.unwrap();
        HandshakeResponse::new(chosen).write_to(&mut stream).await.unwrap();
        if chosen == consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE {
            let mut rest = Vec::new();
            stream.read_to_end(&mut rest).await.unwrap();
            return (greeting, None, rest);
        }

        let request = TcpRequestHeader::read_from(&mut stream).await.unwrap();
        TcpResponseHeader::new(Reply::from_u8(reply), bound)
            .write_to(&mut stream)
            .await
            .unwrap();

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        (greeting, Some(request), rest)
    }

    #[tokio::test]
    async fn connect_through_proxy() {
        let _ = env_logger::try_init();

        let (mut client, server) = duplex(1024);
        let bound: Address = "192.0.2.10:40000".parse().unwrap();
        let double = tokio::spawn(proxy_double(server, 0x00, 0x00, bound.clone()));

        let mut option = Socks5Option::new(proxy_addr(), Command::TcpConnect)
            .with_destination(Address::from_host("10.0.0.5", 80).unwrap());
        let mut handshake = Socks5Handshake::new(&mut client, &mut option);
        let info = handshake.run(Duration::from_secs(5)).await.unwrap();

        assert_eq!(handshake.state(), HandshakeState::Established);
        assert_eq!(info.command, Command::TcpConnect);
        assert_eq!(info.bound, bound);
        assert!(info.backend.is_none());
        assert_eq!(option.bound.as_ref(), Some(&bound));

        drop(client);
        let (greeting, request, rest) = double.await.unwrap();
        assert_eq!(greeting.methods, vec![consts::SOCKS5_AUTH_METHOD_NONE]);
        let request = request.unwrap();
        assert_eq!(request.command, Command::TcpConnect);
        assert_eq!(request.address, "10.0.0.5:80".parse::<Address>().unwrap());
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn reply_codes_become_errors() {
        let cases = [
            (0x02, "RuleDenied"),
            (0x05, "ConnectionRefused"),
            (0x08, "AddressTypeNotSupported"),
            (0x7f, "Unknown(127)"),
        ];

        for (code, name) in cases {
            let (mut client, server) = duplex(1024);
            let double = tokio::spawn(proxy_double(server, 0x00, code, Address::unspecified()));

            let mut option = Socks5Option::new(proxy_addr(), Command::TcpConnect)
                .with_destination(Address::from_host("example.com", 443).unwrap());
            let mut handshake = Socks5Handshake::new(&mut client, &mut option);
            let err = handshake.run(Duration::from_secs(5)).await.unwrap_err();

            assert_eq!(format!("{err:?}"), name);
            assert_eq!(
                handshake.state(),
                HandshakeState::Failed(FailReason::Reply(Reply::from_u8(code)))
            );
            assert!(option.bound.is_none());

            drop(client);
            double.await.unwrap();
        }
    }

    #[tokio::test]
    async fn no_acceptable_method() {
        let (mut client, server) = duplex(1024);
        let double = tokio::spawn(proxy_double(
            server,
            consts::SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE,
            0x00,
            Address::unspecified(),
        ));

        let mut option = Socks5Option::new(proxy_addr(), Command::UdpAssociate);
        let mut handshake = Socks5Handshake::new(&mut client, &mut option);
        let err = handshake.run(Duration::from_secs(5)).await.unwrap_err();

        assert!(matches!(err, Socks5Error::AuthRejected));
        assert_eq!(handshake.state(), HandshakeState::Failed(FailReason::AuthRejected));

        drop(client);
        let (_, request, rest) = double.await.unwrap();
        assert!(request.is_none());
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn zero_methods_is_caller_error() {
        let (mut client, mut server) = duplex(1024);

        let mut option = Socks5Option::new(proxy_addr(), Command::TcpConnect).with_destination(proxy_addr());
        option.methods.clear();
        let mut handshake = Socks5Handshake::new(&mut client, &mut option);
        let err = handshake.run(Duration::from_secs(5)).await.unwrap_err();

        assert!(matches!(err, Socks5Error::NoMethodsOffered));
        assert_eq!(handshake.state(), HandshakeState::Failed(FailReason::InvalidOption));

        drop(client);
        let mut written = Vec::new();
        server.read_to_end(&mut written).await.unwrap();
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn oversized_greeting_is_caller_error() {
        let (mut client, mut server) = duplex(1024);

        let mut option = Socks5Option::new(proxy_addr(), Command::TcpConnect).with_destination(proxy_addr());
        option.methods = vec![AuthMethod::Anonymous; 256];
        let mut handshake = Socks5Handshake::new(&mut client, &mut option);
        let err = handshake.run(Duration::from_secs(5)).await.unwrap_err();

        assert!(matches!(err, Socks5Error::TooManyMethods(256)));
        assert_eq!(handshake.state(), HandshakeState::Failed(FailReason::InvalidOption));

        drop(client);
        let mut written = Vec::new();
        server.read_to_end(&mut written).await.unwrap();
        assert!(written.is_empty());
    }

    #[tokio::test]
    async fn connect_requires_destination() {
        let (mut client, _server) = duplex(64);
        let mut option = Socks5Option::new(proxy_addr(), Command::TcpConnect);
        let err = negotiate(&mut client, &mut option, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Socks5Error::MissingDestination(Command::TcpConnect)));
    }

    #[tokio::test]
    async fn udp_associate_defaults_destination() {
        let (mut client, server) = duplex(1024);
        let relay: Address = "127.0.0.1:5353".parse().unwrap();
        let double = tokio::spawn(proxy_double(server, 0x00, 0x00, relay.clone()));

        let mut option = Socks5Option::new(proxy_addr(), Command::UdpAssociate);
        let info = negotiate(&mut client, &mut option, Duration::from_secs(5)).await.unwrap();
        assert_eq!(info.command, Command::UdpAssociate);
        assert_eq!(info.bound, relay);
        assert_eq!(option.destination, Some(Address::unspecified()));

        drop(client);
        let (_, request, _) = double.await.unwrap();
        assert_eq!(request.unwrap().address, Address::unspecified());
    }

    #[tokio::test]
    async fn password_authentication() {
        let (mut client, mut server) = duplex(1024);

        let double = tokio::spawn(async move {
            let greeting = HandshakeRequest::read_from(&mut server).await.unwrap();
            assert_eq!(
                greeting.methods,
                vec![consts::SOCKS5_AUTH_METHOD_PASSWORD, consts::SOCKS5_AUTH_METHOD_NONE]
            );
            HandshakeResponse::new(consts::SOCKS5_AUTH_METHOD_PASSWORD)
                .write_to(&mut server)
                .await
                .unwrap();

            let auth = PasswdAuthRequest::read_from(&mut server).await.unwrap();
            let ok = auth.uname == b"alice" && auth.passwd == b"s3cret";
            let status = if ok {
                consts::SOCKS5_PASSWD_AUTH_SUCCEEDED
            } else {
                consts::SOCKS5_PASSWD_AUTH_FAILED
            };
            PasswdAuthResponse::new(status).write_to(&mut server).await.unwrap();

            let _ = TcpRequestHeader::read_from(&mut server).await.unwrap();
            TcpResponseHeader::new(Reply::Succeeded, Address::unspecified())
                .write_to(&mut server)
                .await
                .unwrap();
        });

        let mut option = Socks5Option::new(proxy_addr(), Command::TcpConnect)
            .with_destination(Address::from_host("example.com", 80).unwrap())
            .with_credentials("alice", "s3cret");
        negotiate(&mut client, &mut option, Duration::from_secs(5)).await.unwrap();
        double.await.unwrap();
    }

    #[tokio::test]
    async fn password_rejected() {
        let (mut client, mut server) = duplex(1024);

        let double = tokio::spawn(async move {
            let _ = HandshakeRequest::read_from(&mut server).await.unwrap();
            HandshakeResponse::new(consts::SOCKS5_AUTH_METHOD_PASSWORD)
                .write_to(&mut server)
                .await
                .unwrap();
            let _ = PasswdAuthRequest::read_from(&mut server).await.unwrap();
            PasswdAuthResponse::new(consts::SOCKS5_PASSWD_AUTH_FAILED)
                .write_to(&mut server)
                .await
                .unwrap();
        });

        let mut option = Socks5Option::new(proxy_addr(), Command::TcpConnect)
            .with_destination(proxy_addr())
            .with_credentials("alice", "wrong");
        let mut handshake = Socks5Handshake::new(&mut client, &mut option);
        let err = handshake.run(Duration::from_secs(5)).await.unwrap_err();

        assert!(matches!(err, Socks5Error::PasswdAuthRejected(0xff)));
        assert_eq!(handshake.state(), HandshakeState::Failed(FailReason::AuthRejected));
        double.await.unwrap();
    }

    #[tokio::test]
    async fn short_read_fails() {
        let (mut client, mut server) = duplex(1024);

        let double = tokio::spawn(async move {
            let _ = HandshakeRequest::read_from(&mut server).await.unwrap();
            // version byte only, then hang up
            tokio::io::AsyncWriteExt::write_all(&mut server, &[consts::SOCKS5_VERSION])
                .await
                .unwrap();
        });

        let mut option = Socks5Option::new(proxy_addr(), Command::UdpAssociate);
        let mut handshake = Socks5Handshake::new(&mut client, &mut option);
        let err = handshake.run(Duration::from_secs(5)).await.unwrap_err();

        match err {
            Socks5Error::IoError(ref e) => assert_eq!(e.kind(), ErrorKind::UnexpectedEof),
            e => panic!("unexpected error {e:?}"),
        }
        assert_eq!(handshake.state(), HandshakeState::Failed(FailReason::ShortRead));
        double.await.unwrap();
    }

    #[tokio::test]
    async fn silent_proxy_times_out() {
        time::pause();

        let (mut client, mut server) = duplex(1024);
        let double = tokio::spawn(async move {
            let greeting = HandshakeRequest::read_from(&mut server).await.unwrap();
            time::sleep(Duration::from_secs(60)).await;
            greeting
        });

        let mut option = Socks5Option::new(proxy_addr(), Command::UdpAssociate);
        let mut handshake = Socks5Handshake::new(&mut client, &mut option);
        let err = handshake.run(Duration::from_secs(3)).await.unwrap_err();

        assert!(matches!(err, Socks5Error::Timeout));
        assert_eq!(handshake.state(), HandshakeState::Failed(FailReason::Timeout));
        double.abort();
    }
}
