use std::{net::SocketAddr, time::Duration};

use byte_string::ByteStr;
use log::debug;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

use relaykit::{
    Address, Command, Reply, Socks5TcpClient,
    relay::socks5::{PasswdAuth, Socks5Acceptor, send_reply},
};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    let n = stream.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    debug!("echo {:?}", ByteStr::new(&buf[..n]));
                    stream.write_all(&buf[..n]).await.unwrap();
                }
            });
        }
    });
    addr
}

/// Proxy answering CONNECT by dialing the destination, and UDP ASSOCIATE with a fixed relay address
async fn minimal_proxy(auth: PasswdAuth, relay: Address) -> Address {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = Socks5Acceptor::new(auth);

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            let acceptor = acceptor.clone();
            let relay = relay.clone();
            tokio::spawn(async move {
                let header = match acceptor.accept(&mut stream, TIMEOUT).await {
                    Ok(h) => h,
                    Err(..) => return,
                };

                match header.command {
                    Command::TcpConnect => {
                        let target = header.address.socket_addr().unwrap();
                        let mut remote = TcpStream::connect(target).await.unwrap();
                        let bound = Address::from(remote.local_addr().unwrap());
                        send_reply(&mut stream, Reply::Succeeded, &bound).await.unwrap();
                        let _ = tokio::io::copy_bidirectional(&mut stream, &mut remote).await;
                    }
                    Command::UdpAssociate => {
                        send_reply(&mut stream, Reply::Succeeded, &relay).await.unwrap();
                        let mut buf = [0u8; 16];
                        let _ = stream.read(&mut buf).await;
                    }
                    Command::TcpBind => {
                        let _ = send_reply(&mut stream, Reply::CommandNotSupported, &Address::unspecified()).await;
                    }
                }
            });
        }
    });

    Address::from(addr)
}

#[tokio::test]
async fn connect_tunnel_echo() {
    let _ = env_logger::try_init();

    let echo_addr = echo_server().await;
    let proxy = minimal_proxy(PasswdAuth::new(), Address::unspecified()).await;

    let mut client = Socks5TcpClient::connect(echo_addr, proxy, TIMEOUT).await.unwrap();
    assert_ne!(client.bound_addr().port(), 0);

    let payload = b"GET / HTTP/1.0\r\n\r\n";
    client.write_all(payload).await.unwrap();

    let mut buf = vec![0u8; payload.len()];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(ByteStr::new(&buf), ByteStr::new(payload));
}

#[tokio::test]
async fn udp_associate_reports_relay() {
    let _ = env_logger::try_init();

    let relay: Address = "127.0.0.1:5353".parse().unwrap();
    let proxy = minimal_proxy(PasswdAuth::new(), relay.clone()).await;

    let (client, bound) = Socks5TcpClient::udp_associate(Address::unspecified(), proxy, TIMEOUT)
        .await
        .unwrap();
    assert_eq!(bound, relay);
    assert_eq!(client.bound_addr(), &relay);
}
