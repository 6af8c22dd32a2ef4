//! Zero-copy transfer with splice(2).
//!
//! Bytes move socket -> pipe -> socket without entering user space. The
//! pipe is drained completely before the next read, so it never holds data
//! between calls.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use async_trait::async_trait;
use tokio::io::Interest;
use tokio::net::TcpStream;

use super::transfer::Transfer;

const SPLICE_FLAGS: libc::c_uint = libc::SPLICE_F_MOVE | libc::SPLICE_F_NONBLOCK;

/// splice(2) through a private non-blocking pipe.
pub struct SpliceTransfer {
    pipe_read: OwnedFd,
    pipe_write: OwnedFd,
    quota: usize,
}

impl SpliceTransfer {
    pub fn new(quota: usize) -> io::Result<Self> {
        let mut fds: [libc::c_int; 2] = [-1, -1];
        // SAFETY: fds has room for the two descriptors pipe2 writes.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: pipe2 succeeded, both descriptors are open and owned by us.
        let (pipe_read, pipe_write) =
            unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        // Grow the pipe toward the quota; the kernel may cap it lower.
        let size = libc::c_int::try_from(quota).unwrap_or(libc::c_int::MAX);
        // SAFETY: plain fcntl on a descriptor we own.
        let granted = unsafe { libc::fcntl(pipe_write.as_raw_fd(), libc::F_SETPIPE_SZ, size) };
        let quota = if granted > 0 {
            quota.min(granted as usize)
        } else {
            quota
        };

        Ok(Self {
            pipe_read,
            pipe_write,
            quota,
        })
    }
}

fn splice(fd_in: RawFd, fd_out: RawFd, len: usize) -> io::Result<usize> {
    // SAFETY: both descriptors are open for the duration of the call and
    // null offsets are valid for sockets and pipes.
    let rc = unsafe {
        libc::splice(
            fd_in,
            ptr::null_mut(),
            fd_out,
            ptr::null_mut(),
            len,
            SPLICE_FLAGS,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}

#[async_trait]
impl Transfer for SpliceTransfer {
    fn name(&self) -> &'static str {
        "splice"
    }

    async fn transfer(&mut self, from: &TcpStream, to: &TcpStream) -> io::Result<usize> {
        let pipe_write = self.pipe_write.as_raw_fd();
        let pipe_read = self.pipe_read.as_raw_fd();

        let n = from
            .try_io(Interest::READABLE, || {
                splice(from.as_raw_fd(), pipe_write, self.quota)
            })
            .map_err(|e| match e.raw_os_error() {
                Some(libc::EINVAL) | Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP) => {
                    io::Error::new(io::ErrorKind::Unsupported, e)
                }
                _ => e,
            })?;
        if n == 0 {
            return Ok(0);
        }

        let mut pending = n;
        while pending > 0 {
            to.writable().await?;
            match to.try_io(Interest::WRITABLE, || {
                splice(pipe_read, to.as_raw_fd(), pending)
            }) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(m) => pending -= m,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_splice_moves_bytes() {
        let (mut src_peer, src) = pair().await;
        let (dst, mut dst_peer) = pair().await;
        let mut splice = SpliceTransfer::new(64 * 1024).unwrap();

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        src_peer.write_all(&payload).await.unwrap();

        let mut moved = 0;
        while moved < payload.len() {
            src.readable().await.unwrap();
            match splice.transfer(&src, &dst).await {
                Ok(n) => moved += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("splice failed: {}", e),
            }
        }

        let mut received = vec![0u8; payload.len()];
        dst_peer.read_exact(&mut received).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_splice_reports_eof() {
        let (src_peer, src) = pair().await;
        let (dst, _dst_peer) = pair().await;
        let mut splice = SpliceTransfer::new(4096).unwrap();
        drop(src_peer);

        let n = loop {
            src.readable().await.unwrap();
            match splice.transfer(&src, &dst).await {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => panic!("splice failed: {}", e),
            }
        };
        assert_eq!(n, 0);
    }
}
