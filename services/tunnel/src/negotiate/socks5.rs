//! SOCKS5 negotiation (RFC 1928), no-auth and CONNECT only.
//!
//! Every multi-byte read is exact-length. A short read or I/O error aborts
//! the handshake without a reply.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::{NegotiationResult, Negotiator, Protocol};
use crate::error::NegotiationError;
use crate::target::{RoutingPolicy, Target};

/// SOCKS protocol version.
pub const SOCKS_VERSION: u8 = 0x05;

/// "No authentication required" method.
pub const METHOD_NO_AUTH: u8 = 0x00;

/// "No acceptable methods".
pub const METHOD_NO_ACCEPTABLE: u8 = 0xFF;

/// CONNECT command.
pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Reply codes sent after the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    /// Encode a reply carrying `bound`.
    pub fn encode(self, bound: SocketAddr) -> Vec<u8> {
        let mut buf = Vec::with_capacity(22);
        buf.extend_from_slice(&[SOCKS_VERSION, self as u8, 0x00]);
        match bound.ip() {
            IpAddr::V4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
        }
        buf.extend_from_slice(&bound.port().to_be_bytes());
        buf
    }
}

/// Address used in replies that carry no real binding.
fn unspecified() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
}

/// SOCKS5 negotiator.
#[derive(Debug, Clone, Default)]
pub struct Socks5Handshake {
    routing: RoutingPolicy,
}

impl Socks5Handshake {
    pub fn new(routing: RoutingPolicy) -> Self {
        Self { routing }
    }

    /// Version/method negotiation. Accepts only if no-auth is offered.
    async fn negotiate_method(&self, client: &mut TcpStream) -> Result<(), NegotiationError> {
        let mut head = [0u8; 2];
        client.read_exact(&mut head).await?;
        if head[0] != SOCKS_VERSION {
            return Err(NegotiationError::UnsupportedVersion(head[0]));
        }

        let mut methods = vec![0u8; head[1] as usize];
        client.read_exact(&mut methods).await?;

        if !methods.contains(&METHOD_NO_AUTH) {
            client
                .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
                .await?;
            return Err(NegotiationError::NoAcceptableMethod);
        }

        client.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
        Ok(())
    }

    /// Parse the CONNECT request into the requested target.
    async fn read_request(&self, client: &mut TcpStream) -> NegotiationResult {
        let mut head = [0u8; 4];
        client.read_exact(&mut head).await?;
        let [version, command, _reserved, atyp] = head;

        if version != SOCKS_VERSION || command != CMD_CONNECT {
            send_reply(client, Reply::CommandNotSupported, unspecified()).await?;
            return Err(NegotiationError::UnsupportedCommand(command));
        }

        let host = match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                client.read_exact(&mut octets).await?;
                Ipv4Addr::from(octets).to_string()
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                client.read_exact(&mut len).await?;
                let mut name = vec![0u8; len[0] as usize];
                client.read_exact(&mut name).await?;
                String::from_utf8_lossy(&name).into_owned()
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                client.read_exact(&mut octets).await?;
                Ipv6Addr::from(octets).to_string()
            }
            other => {
                send_reply(client, Reply::AddressTypeNotSupported, unspecified()).await?;
                return Err(NegotiationError::UnsupportedAddressType(other));
            }
        };

        let mut port = [0u8; 2];
        client.read_exact(&mut port).await?;

        Ok(Target::new(host, u16::from_be_bytes(port)))
    }
}

async fn send_reply(client: &mut TcpStream, reply: Reply, bound: SocketAddr) -> io::Result<()> {
    client.write_all(&reply.encode(bound)).await
}

#[async_trait]
impl Negotiator for Socks5Handshake {
    fn protocol(&self) -> Protocol {
        Protocol::Socks5
    }

    async fn negotiate(&self, client: &mut TcpStream) -> NegotiationResult {
        self.negotiate_method(client).await?;
        let requested = self.read_request(client).await?;
        let target = self.routing.route(requested.clone());
        if target != requested {
            debug!(requested = %requested, routed = %target, "Routing policy override");
        }
        Ok(target)
    }

    async fn reply_connected(&self, client: &mut TcpStream, bound: SocketAddr) -> io::Result<()> {
        send_reply(client, Reply::Succeeded, bound).await
    }

    async fn reply_connect_failed(&self, client: &mut TcpStream) -> io::Result<()> {
        send_reply(client, Reply::GeneralFailure, unspecified()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[test]
    fn test_reply_encode_ipv4() {
        let encoded = Reply::Succeeded.encode("10.1.2.3:4660".parse().unwrap());
        assert_eq!(encoded, vec![5, 0, 0, 1, 10, 1, 2, 3, 0x12, 0x34]);
    }

    #[test]
    fn test_reply_encode_ipv6() {
        let encoded = Reply::GeneralFailure.encode("[::1]:80".parse().unwrap());
        assert_eq!(encoded.len(), 4 + 16 + 2);
        assert_eq!(&encoded[..4], &[5, 1, 0, 4]);
        assert_eq!(encoded[19], 1);
        assert_eq!(&encoded[20..], &[0, 80]);
    }

    #[test]
    fn test_reply_encode_unspecified() {
        let encoded = Reply::CommandNotSupported.encode(unspecified());
        assert_eq!(encoded, vec![5, 7, 0, 1, 0, 0, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_ipv4_connect_request() {
        let (mut client, mut server) = pair().await;
        let negotiator = Socks5Handshake::default();

        client.write_all(&[5, 1, 0]).await.unwrap();
        client
            .write_all(&[5, 1, 0, 1, 127, 0, 0, 1, 0x00, 0x16])
            .await
            .unwrap();

        let target = negotiator.negotiate(&mut server).await.unwrap();
        assert_eq!(target.to_string(), "127.0.0.1:22");

        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [5, 0]);
    }

    #[tokio::test]
    async fn test_domain_connect_request() {
        let (mut client, mut server) = pair().await;
        let negotiator = Socks5Handshake::default();

        let name = b"example.com";
        let mut request = vec![5, 1, 0, 5, 1, 0, ATYP_DOMAIN, name.len() as u8];
        request.extend_from_slice(name);
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let target = negotiator.negotiate(&mut server).await.unwrap();
        assert_eq!(target, Target::new("example.com", 443));
    }

    #[tokio::test]
    async fn test_ipv6_connect_request() {
        let (mut client, mut server) = pair().await;
        let negotiator = Socks5Handshake::default();

        let mut request = vec![5, 1, 0, 5, 1, 0, ATYP_IPV6];
        request.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        request.extend_from_slice(&8080u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let target = negotiator.negotiate(&mut server).await.unwrap();
        assert_eq!(target.to_string(), "[::1]:8080");
    }

    #[tokio::test]
    async fn test_method_rejected_without_no_auth() {
        let (mut client, mut server) = pair().await;
        let negotiator = Socks5Handshake::default();

        client.write_all(&[5, 2, 0x01, 0x02]).await.unwrap();

        let err = negotiator.negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, NegotiationError::NoAcceptableMethod));
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, vec![5, 0xFF]);
    }

    #[tokio::test]
    async fn test_bad_version_closes_without_reply() {
        let (mut client, mut server) = pair().await;
        let negotiator = Socks5Handshake::default();

        // Exactly the two bytes the server reads, so closing sends FIN.
        client.write_all(&[4, 1]).await.unwrap();

        let err = negotiator.negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, NegotiationError::UnsupportedVersion(4)));
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_command() {
        let (mut client, mut server) = pair().await;
        let negotiator = Socks5Handshake::default();

        // BIND; the address is never read once the command is refused.
        client.write_all(&[5, 1, 0, 5, 2, 0, 1]).await.unwrap();

        let err = negotiator.negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, NegotiationError::UnsupportedCommand(2)));
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(&reply[..2], &[5, 0]);
        assert_eq!(reply[3], Reply::CommandNotSupported as u8);
    }

    #[tokio::test]
    async fn test_unsupported_address_type() {
        let (mut client, mut server) = pair().await;
        let negotiator = Socks5Handshake::default();

        client.write_all(&[5, 1, 0, 5, 1, 0, 0x09]).await.unwrap();

        let err = negotiator.negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, NegotiationError::UnsupportedAddressType(9)));
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply[3], Reply::AddressTypeNotSupported as u8);
    }

    #[tokio::test]
    async fn test_short_read_aborts() {
        let (mut client, mut server) = pair().await;
        let negotiator = Socks5Handshake::default();

        client.write_all(&[5, 1, 0, 5, 1, 0, 1, 127, 0]).await.unwrap();
        client.shutdown().await.unwrap();

        let err = negotiator.negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Io(_)));
    }

    #[tokio::test]
    async fn test_fixed_routing_overrides_request() {
        let (mut client, mut server) = pair().await;
        let negotiator =
            Socks5Handshake::new(RoutingPolicy::Fixed(Target::new("127.0.0.1", 1194)));

        client
            .write_all(&[5, 1, 0, 5, 1, 0, 1, 8, 8, 8, 8, 0, 53])
            .await
            .unwrap();

        let target = negotiator.negotiate(&mut server).await.unwrap();
        assert_eq!(target, Target::new("127.0.0.1", 1194));
    }
}
