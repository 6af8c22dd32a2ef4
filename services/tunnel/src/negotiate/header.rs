//! HeaderBootstrap negotiation.
//!
//! The client opens with an HTTP-like header block in a single segment:
//!
//! ```text
//! GET / HTTP/1.1\r\n
//! X-Real-Host: 127.0.0.1:22\r\n
//! X-Pass: secret\r\n
//! X-Split: 1\r\n
//! \r\n
//! ```
//!
//! The block is read once (no reassembly across reads). Access is granted
//! when the credential matches a configured passphrase, or when the target
//! starts with the bind address literal (self-referential targets are
//! trusted).

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::{NegotiationResult, Negotiator, Protocol};
use crate::config::Config;
use crate::error::NegotiationError;

/// Target used when the request carries no `X-Real-Host`.
pub const DEFAULT_HOST: &str = "0.0.0.0:22";

pub const HEADER_REAL_HOST: &str = "X-Real-Host";
pub const HEADER_SPLIT: &str = "X-Split";
pub const HEADER_PASS: &str = "X-Pass";

pub const REPLY_WRONG_PASS: &[u8] = b"HTTP/1.1 400 WrongPass!\r\n\r\n";
pub const REPLY_FORBIDDEN: &[u8] = b"HTTP/1.1 403 Forbidden!\r\n\r\n";
pub const REPLY_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway!\r\n\r\n";

/// Return the value of `name` in a CRLF-delimited header block.
///
/// Locates `"<name>: "` and scans to the next CRLF. A header whose line is
/// not CRLF-terminated is treated as absent.
pub fn find_header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    let needle = format!("{}: ", name);
    let start = head.find(&needle)? + needle.len();
    let rest = &head[start..];
    let end = rest.find("\r\n")?;
    Some(&rest[..end])
}

/// The fields a bootstrap request carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapRequest<'a> {
    /// Raw `X-Real-Host` value, or [`DEFAULT_HOST`].
    pub host: &'a str,
    /// `X-Split` was present.
    pub split: bool,
    /// `X-Pass` value, if any.
    pub pass: Option<&'a str>,
}

impl<'a> BootstrapRequest<'a> {
    pub fn parse(head: &'a str) -> Self {
        let host = find_header(head, HEADER_REAL_HOST)
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_HOST);
        let split = find_header(head, HEADER_SPLIT).is_some_and(|v| !v.is_empty());
        let pass = find_header(head, HEADER_PASS).filter(|p| !p.is_empty());
        Self { host, split, pass }
    }
}

/// Decide whether a request may proceed.
///
/// Allowed when a non-empty `passphrase` equals `supplied`, or when
/// `target` starts with `bind_literal`. A supplied credential that does not
/// match yields [`NegotiationError::WrongPass`]; anything else not allowed is
/// [`NegotiationError::Forbidden`].
pub fn authorize(
    passphrase: &str,
    supplied: Option<&str>,
    target: &str,
    bind_literal: &str,
) -> Result<(), NegotiationError> {
    if !passphrase.is_empty() && supplied == Some(passphrase) {
        return Ok(());
    }
    if target.starts_with(bind_literal) {
        return Ok(());
    }
    if !passphrase.is_empty() && supplied.is_some() {
        return Err(NegotiationError::WrongPass);
    }
    Err(NegotiationError::Forbidden(target.to_string()))
}

/// HeaderBootstrap negotiator.
#[derive(Debug, Clone)]
pub struct HeaderBootstrap {
    passphrase: String,
    bind_literal: String,
    read_cap: usize,
    success_reply: Vec<u8>,
}

impl HeaderBootstrap {
    pub fn new(passphrase: String, bind_literal: String, read_cap: usize, marker: &str) -> Self {
        Self {
            passphrase,
            bind_literal,
            read_cap,
            success_reply: success_reply(marker),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.passphrase.clone(),
            config.bind_address.to_string(),
            config.buffer_size,
            &config.status_marker,
        )
    }

    async fn reject(
        &self,
        client: &mut TcpStream,
        err: NegotiationError,
    ) -> NegotiationResult {
        let reply = match err {
            NegotiationError::WrongPass => REPLY_WRONG_PASS,
            _ => REPLY_FORBIDDEN,
        };
        // Best effort; the connection closes either way.
        let _ = client.write_all(reply).await;
        Err(err)
    }
}

/// Canned success line carrying `marker`.
pub fn success_reply(marker: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 <font color=\"null\">{}</font>\r\n\r\n",
        marker
    )
    .into_bytes()
}

#[async_trait]
impl Negotiator for HeaderBootstrap {
    fn protocol(&self) -> Protocol {
        Protocol::Header
    }

    async fn negotiate(&self, client: &mut TcpStream) -> NegotiationResult {
        let mut buf = vec![0u8; self.read_cap];
        let n = client.read(&mut buf).await?;
        if n == 0 {
            return Err(NegotiationError::EmptyRequest);
        }

        let head = String::from_utf8_lossy(&buf[..n]).into_owned();
        let request = BootstrapRequest::parse(&head);

        if request.split {
            // One opportunistic extra segment, discarded.
            match client.try_read(&mut buf) {
                Ok(extra) => debug!(bytes = extra, "Discarded split segment"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e.into()),
            }
        }

        if let Err(e) = authorize(
            &self.passphrase,
            request.pass,
            request.host,
            &self.bind_literal,
        ) {
            info!(upstream = %request.host, reason = e.reason(), "Access denied");
            return self.reject(client, e).await;
        }

        let target = match request.host.parse() {
            Ok(target) => target,
            Err(_) => {
                let err = NegotiationError::InvalidTarget(request.host.to_string());
                // The client is authorized but named nothing reachable.
                let _ = client.write_all(REPLY_BAD_GATEWAY).await;
                return Err(err);
            }
        };

        Ok(target)
    }

    async fn reply_connected(&self, client: &mut TcpStream, _bound: SocketAddr) -> io::Result<()> {
        client.set_nodelay(true)?;
        client.write_all(&self.success_reply).await
    }

    async fn reply_connect_failed(&self, client: &mut TcpStream) -> io::Result<()> {
        client.write_all(REPLY_BAD_GATEWAY).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    const BIND: &str = "0.0.0.0";

    #[test]
    fn test_find_header() {
        let head = "GET / HTTP/1.1\r\nX-Real-Host: 10.0.0.1:22\r\nX-Pass: s3cret\r\n\r\n";
        assert_eq!(find_header(head, HEADER_REAL_HOST), Some("10.0.0.1:22"));
        assert_eq!(find_header(head, HEADER_PASS), Some("s3cret"));
        assert_eq!(find_header(head, HEADER_SPLIT), None);
    }

    #[test]
    fn test_find_header_requires_crlf() {
        assert_eq!(find_header("X-Real-Host: 10.0.0.1:22", HEADER_REAL_HOST), None);
        assert_eq!(find_header("X-Real-Host:10.0.0.1:22\r\n", HEADER_REAL_HOST), None);
    }

    #[test]
    fn test_request_defaults() {
        let req = BootstrapRequest::parse("CONNECT / HTTP/1.1\r\n\r\n");
        assert_eq!(req.host, DEFAULT_HOST);
        assert!(!req.split);
        assert_eq!(req.pass, None);
    }

    #[test]
    fn test_request_split_flag() {
        let req = BootstrapRequest::parse("GET / HTTP/1.1\r\nX-Split: 1\r\n\r\n");
        assert!(req.split);
    }

    #[test]
    fn test_matching_passphrase_allows_any_target() {
        assert!(authorize("secret", Some("secret"), "203.0.113.9:22", BIND).is_ok());
        assert!(authorize("secret", Some("secret"), "example.com:443", BIND).is_ok());
    }

    #[test]
    fn test_self_target_allowed_without_passphrase() {
        assert!(authorize("", None, "0.0.0.0:22", BIND).is_ok());
        assert!(authorize("", None, "0.0.0.0:1194", BIND).is_ok());
        assert!(authorize("secret", None, "0.0.0.0:22", BIND).is_ok());
        assert!(authorize("secret", Some("wrong"), "0.0.0.0:22", BIND).is_ok());
    }

    #[test]
    fn test_foreign_target_forbidden() {
        let err = authorize("", None, "203.0.113.9:22", BIND).unwrap_err();
        assert!(matches!(err, NegotiationError::Forbidden(_)));

        // Empty passphrase makes any supplied credential irrelevant.
        let err = authorize("", Some("anything"), "203.0.113.9:22", BIND).unwrap_err();
        assert!(matches!(err, NegotiationError::Forbidden(_)));

        let err = authorize("secret", None, "203.0.113.9:22", BIND).unwrap_err();
        assert!(matches!(err, NegotiationError::Forbidden(_)));
    }

    #[test]
    fn test_wrong_pass() {
        let err = authorize("secret", Some("guess"), "203.0.113.9:22", BIND).unwrap_err();
        assert!(matches!(err, NegotiationError::WrongPass));
    }

    #[test]
    fn test_success_reply_embeds_marker() {
        let reply = success_reply("@MARK");
        let text = String::from_utf8(reply).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 "));
        assert!(text.contains("@MARK"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_negotiate_accepts_self_target() {
        let (mut client, mut server) = pair().await;
        let negotiator = HeaderBootstrap::new(String::new(), BIND.into(), 4096, "@M");

        client
            .write_all(b"GET / HTTP/1.1\r\nX-Real-Host: 0.0.0.0:2222\r\n\r\n")
            .await
            .unwrap();

        let target = negotiator.negotiate(&mut server).await.unwrap();
        assert_eq!(target.to_string(), "0.0.0.0:2222");
    }

    #[tokio::test]
    async fn test_negotiate_forbidden_reply() {
        let (mut client, mut server) = pair().await;
        let negotiator = HeaderBootstrap::new(String::new(), BIND.into(), 4096, "@M");

        client
            .write_all(b"GET / HTTP/1.1\r\nX-Real-Host: 198.51.100.1:22\r\n\r\n")
            .await
            .unwrap();

        let err = negotiator.negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Forbidden(_)));
        drop(server);

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, REPLY_FORBIDDEN);
    }

    #[tokio::test]
    async fn test_negotiate_empty_request() {
        let (client, mut server) = pair().await;
        let negotiator = HeaderBootstrap::new(String::new(), BIND.into(), 4096, "@M");
        drop(client);

        let err = negotiator.negotiate(&mut server).await.unwrap_err();
        assert!(matches!(err, NegotiationError::EmptyRequest));
    }
}
