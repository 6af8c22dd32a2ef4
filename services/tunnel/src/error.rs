//! Error types for the tunnel.
//!
//! Each layer of a connection's lifecycle has its own error enum. None of
//! them are retried: a failure is terminal for the affected connection only.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::target::Target;

/// Malformed or unsupported protocol input, or an authorization failure.
///
/// By the time one of these is returned the negotiator has already written
/// whatever rejection reply the protocol calls for.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// Client closed before sending a request.
    #[error("client sent no request")]
    EmptyRequest,

    /// A credential was supplied and did not match the passphrase.
    #[error("wrong passphrase")]
    WrongPass,

    /// No credential matched and the target is not self-referential.
    #[error("target {0} not allowed")]
    Forbidden(String),

    /// `X-Real-Host` could not be parsed as host:port.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// First byte of a SOCKS exchange was not version 5.
    #[error("unsupported socks version {0:#04x}")]
    UnsupportedVersion(u8),

    /// Client did not offer the no-authentication method.
    #[error("no acceptable authentication method")]
    NoAcceptableMethod,

    /// Only CONNECT is supported.
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    /// Address type was not IPv4, domain name or IPv6.
    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Short read or socket failure mid-handshake.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl NegotiationError {
    /// Short reason code for structured logs.
    pub fn reason(&self) -> &'static str {
        match self {
            NegotiationError::EmptyRequest => "empty_request",
            NegotiationError::WrongPass => "wrong_pass",
            NegotiationError::Forbidden(_) => "forbidden",
            NegotiationError::InvalidTarget(_) => "invalid_target",
            NegotiationError::UnsupportedVersion(_) => "unsupported_version",
            NegotiationError::NoAcceptableMethod => "no_acceptable_method",
            NegotiationError::UnsupportedCommand(_) => "unsupported_command",
            NegotiationError::UnsupportedAddressType(_) => "unsupported_address_type",
            NegotiationError::Io(_) => "io_error",
        }
    }
}

/// Failure to open the upstream connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Name resolution failed.
    #[error("resolve {target}: {source}")]
    Resolve {
        target: Target,
        #[source]
        source: io::Error,
    },

    /// Resolution succeeded but produced no addresses.
    #[error("no addresses for {0}")]
    NoAddress(Target),

    /// Socket creation or option application failed.
    #[error("socket setup for {addr}: {source}")]
    Socket {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The kernel reported the connect as failed.
    #[error("connect {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Connect did not complete within the connect timeout.
    #[error("connect {0} timed out")]
    Timeout(SocketAddr),
}

impl ConnectError {
    /// Short reason code for structured logs.
    pub fn reason(&self) -> &'static str {
        match self {
            ConnectError::Resolve { .. } => "resolve_failed",
            ConnectError::NoAddress(_) => "no_address",
            ConnectError::Socket { .. } => "socket_failed",
            ConnectError::Connect { .. } => "connect_failed",
            ConnectError::Timeout(_) => "connect_timeout",
        }
    }
}

/// Hard I/O failure while relaying.
///
/// EOF and idle timeout are normal relay ends, not errors.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("client to upstream: {0}")]
    ClientToUpstream(#[source] io::Error),

    #[error("upstream to client: {0}")]
    UpstreamToClient(#[source] io::Error),
}

/// Listener startup failure.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("listener io error: {0}")]
    Io(#[from] io::Error),
}

/// Why a supervised step ended without producing its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StepError {
    #[error("step timed out")]
    TimedOut,

    #[error("shutdown requested")]
    Shutdown,
}
