//! Protocol negotiation.
//!
//! A negotiator consumes the opening bytes of a freshly accepted client
//! connection and produces the upstream [`Target`] or a rejection. It writes
//! protocol-specific rejection replies itself; once the supervisor has tried
//! the upstream it reports the outcome back through [`Negotiator::reply_connected`]
//! or [`Negotiator::reply_connect_failed`].
//!
//! ## Variants
//!
//! - [`HeaderBootstrap`]: HTTP-like header block naming the target
//! - [`Socks5Handshake`]: RFC 1928, no-auth, CONNECT only

mod header;
mod socks5;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use clap::ValueEnum;
use tokio::net::TcpStream;

use crate::config::Config;
use crate::error::NegotiationError;
use crate::target::Target;

pub use header::{
    authorize, find_header, success_reply, BootstrapRequest, HeaderBootstrap, DEFAULT_HOST,
    REPLY_BAD_GATEWAY, REPLY_FORBIDDEN, REPLY_WRONG_PASS,
};
pub use socks5::{Reply, Socks5Handshake};

/// Outcome of a negotiation: the target to connect to, or why not.
pub type NegotiationResult = Result<Target, NegotiationError>;

/// Which negotiation a listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum Protocol {
    /// HTTP-like header bootstrap (`X-Real-Host`, `X-Pass`, `X-Split`).
    Header,
    /// SOCKS version 5.
    Socks5,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Header => f.write_str("header"),
            Protocol::Socks5 => f.write_str("socks5"),
        }
    }
}

/// A protocol-specific handshake run at connection start.
#[async_trait]
pub trait Negotiator: Send + Sync {
    /// Protocol tag for logs and connection state.
    fn protocol(&self) -> Protocol;

    /// Read the client's request and decide on a target.
    ///
    /// Must not read beyond the handshake. On rejection the matching reply
    /// has already been written when this returns.
    async fn negotiate(&self, client: &mut TcpStream) -> NegotiationResult;

    /// Tell the client the upstream is ready. `bound` is the upstream
    /// socket's local address.
    async fn reply_connected(&self, client: &mut TcpStream, bound: SocketAddr) -> io::Result<()>;

    /// Tell the client the upstream could not be reached.
    async fn reply_connect_failed(&self, client: &mut TcpStream) -> io::Result<()>;
}

/// Build the negotiator selected by `config.protocol`.
pub fn from_config(config: &Config) -> Arc<dyn Negotiator> {
    match config.protocol {
        Protocol::Header => Arc::new(HeaderBootstrap::from_config(config)),
        Protocol::Socks5 => Arc::new(Socks5Handshake::new(config.routing.clone())),
    }
}
