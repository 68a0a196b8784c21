use std::{net::SocketAddr, time::Duration};

use relaykit::{Address, UdpFrameStream, relay::udprelay::encode_udp_frame};
use relaykit_service::{config::ListenConfig, server::UdpTunnelServer};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, UdpSocket},
    time,
};

const TIMEOUT: Duration = Duration::from_secs(5);

async fn udp_echo_server() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let (n, src) = socket.recv_from(&mut buf).await.unwrap();
            socket.send_to(&buf[..n], src).await.unwrap();
        }
    });
    addr
}

async fn start_server(idle_timeout: Duration) -> UdpTunnelServer {
    UdpTunnelServer::bind(&ListenConfig::new("127.0.0.1:0".parse().unwrap()), idle_timeout)
        .await
        .unwrap()
}

#[tokio::test]
async fn udp_tunnel_round_trip() {
    let _ = env_logger::try_init();

    let echo_addr = udp_echo_server().await;
    let server = start_server(Duration::from_secs(60)).await;
    let server_addr = server.local_addr().unwrap();
    let sessions = server.sessions();
    tokio::spawn(server.run());

    let mut stream = TcpStream::connect(server_addr).await.unwrap();
    let target = Address::from(echo_addr);

    // two frames in one write
    let mut batch = encode_udp_frame(b"one", &target).unwrap();
    batch.extend_from_slice(&encode_udp_frame(b"two", &target).unwrap());
    stream.write_all(&batch).await.unwrap();

    let mut frames = UdpFrameStream::new(stream);
    let mut received = Vec::new();
    for _ in 0..2 {
        let (from, payload) = time::timeout(TIMEOUT, frames.recv_from()).await.unwrap().unwrap().unwrap();
        assert_eq!(from, target);
        received.push(payload.to_vec());
    }
    received.sort();
    assert_eq!(received, vec![b"one".to_vec(), b"two".to_vec()]);

    assert_eq!(sessions.len().await, 1);
    let session = sessions.snapshot().await.remove(0);
    assert_ne!(session.outbound_addr().port(), 0);

    frames.send_to(b"three", &target).await.unwrap();
    let (_, payload) = time::timeout(TIMEOUT, frames.recv_from()).await.unwrap().unwrap().unwrap();
    assert_eq!(&payload[..], b"three");
}

#[tokio::test]
async fn udp_tunnel_drops_corrupt_stream() {
    let _ = env_logger::try_init();

    let server = start_server(Duration::from_secs(60)).await;
    let server_addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let mut stream = TcpStream::connect(server_addr).await.unwrap();
    // RSV claims 2 payload bytes, ATYP 0x09 is not an address type
    stream.write_all(&[0x00, 0x02, 0x00, 0x09, 1, 2]).await.unwrap();

    let mut frames = UdpFrameStream::new(stream);
    let end = time::timeout(TIMEOUT, frames.recv_from()).await.unwrap();
    assert!(matches!(end, Ok(None) | Err(..)));
}

#[tokio::test]
async fn udp_tunnel_idle_closed() {
    let _ = env_logger::try_init();

    let server = start_server(Duration::from_millis(200)).await;
    let server_addr = server.local_addr().unwrap();
    let sessions = server.sessions();
    tokio::spawn(server.run());

    let stream = TcpStream::connect(server_addr).await.unwrap();
    let mut frames = UdpFrameStream::new(stream);
    let end = time::timeout(TIMEOUT, frames.recv_from()).await.unwrap().unwrap();
    assert!(end.is_none());

    for _ in 0..50 {
        if sessions.is_empty().await {
            return;
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    panic!("idle tunnel still registered");
}
