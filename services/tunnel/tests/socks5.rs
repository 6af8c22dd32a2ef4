
use std::net::SocketAddr;
use std::time::Duration;

use harness::{
    read_until_closed, socks5_connect_v4, socks5_greet, socks5_reply_v4, TcpEchoBackend,
    TunnelHandle,
};
use plfm_tunnel::{Config, Protocol, RoutingPolicy, Target};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const CLOSE_WAIT: Duration = Duration::from_secs(3);

fn config() -> Config {
    TunnelHandle::config(Protocol::Socks5)
}

fn bound_addr(reply: &[u8; 10]) -> SocketAddr {
    let ip = std::net::Ipv4Addr::new(reply[4], reply[5], reply[6], reply[7]);
    SocketAddr::from((ip, u16::from_be_bytes([reply[8], reply[9]])))
}

#[tokio::test]
async fn test_rejects_client_without_no_auth_method() {
    let tunnel = TunnelHandle::spawn(config()).await.unwrap();

    let mut client = tunnel.connect().await.unwrap();
    // Only username/password offered.
    let choice = socks5_greet(&mut client, &[0x02]).await.unwrap();
    assert_eq!(choice, [0x05, 0xFF]);

    let rest = read_until_closed(&mut client, CLOSE_WAIT).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_wrong_version_closes_without_reply() {
    let tunnel = TunnelHandle::spawn(config()).await.unwrap();

    let mut client = tunnel.connect().await.unwrap();
    client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();

    let rest = read_until_closed(&mut client, CLOSE_WAIT).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_connect_ipv4_round_trip() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let tunnel = TunnelHandle::spawn(config()).await.unwrap();

    let mut client = tunnel.connect().await.unwrap();
    let choice = socks5_greet(&mut client, &[0x00]).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    client
        .write_all(&socks5_connect_v4(backend.addr))
        .await
        .unwrap();
    let reply = socks5_reply_v4(&mut client).await.unwrap();
    assert_eq!(&reply[..4], &[0x05, 0x00, 0x00, 0x01]);

    // The reply carries the upstream socket's local address.
    let bound = bound_addr(&reply);
    assert!(bound.ip().is_loopback());
    assert_ne!(bound.port(), 0);

    client.write_all(b"socks payload").await.unwrap();
    let mut echo = [0u8; 13];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"socks payload");
    assert_eq!(backend.connection_count(), 1);

    drop(client);
    tunnel.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_connect_domain_name() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let tunnel = TunnelHandle::spawn(config()).await.unwrap();

    let mut client = tunnel.connect().await.unwrap();
    socks5_greet(&mut client, &[0x00]).await.unwrap();

    let name = b"localhost";
    let mut request = vec![0x05, 0x01, 0x00, 0x03, name.len() as u8];
    request.extend_from_slice(name);
    request.extend_from_slice(&backend.addr.port().to_be_bytes());
    client.write_all(&request).await.unwrap();

    // Success reply; the bound address family depends on what localhost
    // resolved to, so read the fixed header and the rest by type.
    let mut head = [0u8; 4];
    client.read_exact(&mut head).await.unwrap();
    assert_eq!(&head[..2], &[0x05, 0x00]);
    let rest = if head[3] == 0x01 { 6 } else { 18 };
    let mut tail = vec![0u8; rest];
    client.read_exact(&mut tail).await.unwrap();

    client.write_all(b"dns").await.unwrap();
    let mut echo = [0u8; 3];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"dns");
}

#[tokio::test]
async fn test_routing_override_pins_upstream() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let tunnel = TunnelHandle::spawn(Config {
        routing: RoutingPolicy::Fixed(Target::from(backend.addr)),
        ..config()
    })
    .await
    .unwrap();

    let mut client = tunnel.connect().await.unwrap();
    socks5_greet(&mut client, &[0x00]).await.unwrap();

    // Requested target is unreachable; the override wins.
    let requested: SocketAddr = "198.51.100.1:22".parse().unwrap();
    client
        .write_all(&socks5_connect_v4(requested))
        .await
        .unwrap();
    let reply = socks5_reply_v4(&mut client).await.unwrap();
    assert_eq!(reply[1], 0x00);

    client.write_all(b"pinned").await.unwrap();
    let mut echo = [0u8; 6];
    client.read_exact(&mut echo).await.unwrap();
    assert_eq!(&echo, b"pinned");
    assert_eq!(backend.connection_count(), 1);
}

#[tokio::test]
async fn test_unsupported_command_replies_07() {
    let tunnel = TunnelHandle::spawn(config()).await.unwrap();

    let mut client = tunnel.connect().await.unwrap();
    socks5_greet(&mut client, &[0x00]).await.unwrap();

    // BIND.
    let mut request = socks5_connect_v4("127.0.0.1:22".parse().unwrap());
    request[1] = 0x02;
    client.write_all(&request).await.unwrap();

    let reply = socks5_reply_v4(&mut client).await.unwrap();
    assert_eq!(reply, [0x05, 0x07, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
}

#[tokio::test]
async fn test_unsupported_address_type_replies_08() {
    let tunnel = TunnelHandle::spawn(config()).await.unwrap();

    let mut client = tunnel.connect().await.unwrap();
    socks5_greet(&mut client, &[0x00]).await.unwrap();
    client.write_all(&[0x05, 0x01, 0x00, 0x02]).await.unwrap();

    let reply = socks5_reply_v4(&mut client).await.unwrap();
    assert_eq!(reply, [0x05, 0x08, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
}

#[tokio::test]
async fn test_unreachable_upstream_replies_01() {
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = closed.local_addr().unwrap();
    drop(closed);

    let tunnel = TunnelHandle::spawn(config()).await.unwrap();

    let mut client = tunnel.connect().await.unwrap();
    socks5_greet(&mut client, &[0x00]).await.unwrap();
    client.write_all(&socks5_connect_v4(dead)).await.unwrap();

    let reply = socks5_reply_v4(&mut client).await.unwrap();
    assert_eq!(reply, [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0]);
}
