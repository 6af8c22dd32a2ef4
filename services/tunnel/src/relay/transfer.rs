//! One-shot byte movers between two sockets.

use std::io;

use async_trait::async_trait;
use tokio::net::TcpStream;

/// Moves whatever `from` has ready to `to`, up to an implementation quota.
///
/// Contract:
/// - `Ok(0)`: `from` reached EOF.
/// - `Ok(n)`: `n` bytes read from `from` and fully written to `to`.
/// - `Err(WouldBlock)`: nothing was ready; readiness on `from` is cleared.
/// - `Err(Unsupported)`: this mover cannot work on these sockets; nothing
///   was consumed.
#[async_trait]
pub trait Transfer: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    async fn transfer(&mut self, from: &TcpStream, to: &TcpStream) -> io::Result<usize>;
}

/// Buffered receive-then-send through a user-space buffer.
pub struct CopyTransfer {
    buf: Vec<u8>,
}

impl CopyTransfer {
    pub fn new(quota: usize) -> Self {
        Self {
            buf: vec![0u8; quota],
        }
    }
}

#[async_trait]
impl Transfer for CopyTransfer {
    fn name(&self) -> &'static str {
        "copy"
    }

    async fn transfer(&mut self, from: &TcpStream, to: &TcpStream) -> io::Result<usize> {
        let n = from.try_read(&mut self.buf)?;
        if n == 0 {
            return Ok(0);
        }
        write_all_ready(to, &self.buf[..n]).await?;
        Ok(n)
    }
}

/// Write all of `data`, waiting for writability as needed.
pub(crate) async fn write_all_ready(to: &TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        to.writable().await?;
        match to.try_write(data) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
