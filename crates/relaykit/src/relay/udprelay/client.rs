//! UDP relay client

use std::{
    io::{self, ErrorKind},
    net::SocketAddr,
    time::Duration,
};

use log::trace;
use tokio::net::{ToSocketAddrs, UdpSocket};

use super::codec::{UdpRelayHeader, decode_udp_packet};
use crate::relay::socks5::{Address, Socks5Error, Socks5TcpClient};

/// Socks5 UDP ASSOCIATE client
pub struct Socks5UdpClient {
    socket: UdpSocket,
    // The association lives as long as this control connection
    assoc_client: Option<Socks5TcpClient>,
}

impl Socks5UdpClient {
    /// Create a new UDP associate client binds to a specific address
    pub async fn bind<A>(addrs: A) -> io::Result<Socks5UdpClient>
    where
        A: ToSocketAddrs,
    {
        Ok(Socks5UdpClient {
            socket: UdpSocket::bind(addrs).await?,
            assoc_client: None,
        })
    }

    /// Create a new UDP associate to `proxy`
    ///
    /// A relay reported as `0.0.0.0` or `::` is taken to live on the proxy's host.
    pub async fn associate(&mut self, proxy: Address, timeout: Duration) -> Result<(), Socks5Error> {
        if self.assoc_client.is_some() {
            let err = io::Error::other("udp is associated");
            return Err(err.into());
        }

        // The actual bind address, tell the proxy that I am going to send packets from this address
        let local_addr = self.socket.local_addr()?;

        let (assoc_client, relay_addr) = Socks5TcpClient::udp_associate(local_addr, proxy.clone(), timeout).await?;
        let relay_addr = relay_endpoint(relay_addr, &proxy);
        trace!("udp associated with relay {} via {}", relay_addr, proxy);

        match relay_addr {
            Address::SocketAddress(sa) => self.socket.connect(sa).await?,
            Address::DomainNameAddress(ref dname, port) => self.socket.connect((dname.as_str(), port)).await?,
        }

        self.assoc_client = Some(assoc_client);
        Ok(())
    }

    /// Sends `buf` to `target` through the relay, returns the number of payload bytes sent
    pub async fn send_to<A>(&self, buf: &[u8], target: A) -> io::Result<usize>
    where
        A: Into<Address>,
    {
        self.check_associated()?;

        let header = UdpRelayHeader::new(0, 0, target.into());
        let header_len = header.serialized_len();
        let send_buf = header.encode(buf)?;

        let n = self.socket.send(&send_buf).await?;
        Ok(n.saturating_sub(header_len))
    }

    /// Receives one datagram from the relay, the payload is moved to the front of `recv_buf`
    ///
    /// Returns the payload length and the address it came from. If a message is too long to fit in the supplied
    /// buffer, excess bytes may be discarded.
    pub async fn recv_from(&self, recv_buf: &mut [u8]) -> io::Result<(usize, Address)> {
        self.check_associated()?;

        let n = self.socket.recv(recv_buf).await?;

        let (pos, address) = {
            let packet = decode_udp_packet(&recv_buf[..n], false)?;
            (packet.header_len(), packet.address)
        };
        recv_buf.copy_within(pos..n, 0);

        Ok((n - pos, address))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn check_associated(&self) -> io::Result<()> {
        if self.assoc_client.is_none() {
            return Err(io::Error::new(ErrorKind::NotConnected, "udp not associated"));
        }
        Ok(())
    }
}

/// Replaces an unspecified relay host with the host of `proxy`
fn relay_endpoint(relay_addr: Address, proxy: &Address) -> Address {
    match relay_addr {
        Address::SocketAddress(sa) if sa.ip().is_unspecified() => match *proxy {
            Address::SocketAddress(ref p) => Address::SocketAddress(SocketAddr::new(p.ip(), sa.port())),
            Address::DomainNameAddress(ref dname, ..) => Address::DomainNameAddress(dname.clone(), sa.port()),
        },
        addr => addr,
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::relay::{
        socks5::{Command, Reply, Socks5Acceptor, send_reply},
        udprelay::encode_udp_header,
    };

    #[test]
    fn unspecified_relay_takes_proxy_host() {
        let relay: Address = "0.0.0.0:4000".parse().unwrap();

        let proxy = Address::DomainNameAddress("proxy.example".to_owned(), 1080);
        assert_eq!(
            relay_endpoint(relay.clone(), &proxy),
            Address::DomainNameAddress("proxy.example".to_owned(), 4000)
        );
        // the proxy address is still usable afterwards
        assert_eq!(proxy.to_string(), "proxy.example:1080");

        let proxy: Address = "10.0.0.1:1080".parse().unwrap();
        assert_eq!(relay_endpoint(relay, &proxy), "10.0.0.1:4000".parse::<Address>().unwrap());

        let concrete: Address = "10.0.0.2:5000".parse().unwrap();
        assert_eq!(relay_endpoint(concrete.clone(), &proxy), concrete);
    }

    #[tokio::test]
    async fn relays_through_associate() {
        let _ = env_logger::try_init();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        // reported as unspecified, the client substitutes the proxy host
        let relay_port = relay.local_addr().unwrap().port();

        let proxy = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let header = Socks5Acceptor::default()
                .accept(&mut stream, Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(header.command, Command::UdpAssociate);
            let bound: Address = SocketAddr::new("0.0.0.0".parse().unwrap(), relay_port).into();
            send_reply(&mut stream, Reply::Succeeded, &bound).await.unwrap();

            let mut buf = [0u8; 1024];
            let (n, client_addr) = relay.recv_from(&mut buf).await.unwrap();
            let packet = decode_udp_packet(&buf[..n], false).unwrap();
            assert_eq!(packet.payload, b"ping");
            assert_eq!(packet.domain(), Some("echo.example"));

            let reply = encode_udp_header(b"pong", "192.0.2.33", 7).unwrap();
            relay.send_to(&reply, client_addr).await.unwrap();

            // keep the control connection open until the client is done
            let mut rest = Vec::new();
            let _ = tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut rest).await;
        });

        let mut client = Socks5UdpClient::bind("127.0.0.1:0").await.unwrap();
        assert!(client.send_to(b"early", proxy_addr).await.is_err());

        client
            .associate(Address::SocketAddress(proxy_addr), Duration::from_secs(5))
            .await
            .unwrap();

        let n = client
            .send_to(b"ping", ("echo.example".to_owned(), 7))
            .await
            .unwrap();
        assert_eq!(n, 4);

        let mut buf = [0u8; 1024];
        let (n, from) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
        assert_eq!(from, "192.0.2.33:7".parse::<Address>().unwrap());

        drop(client);
        proxy.await.unwrap();
    }
}
