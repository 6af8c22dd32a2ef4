//! Outbound reverse port forward.
//!
//! Asks a remote SSH server to open `remote_port` and forward it back to the
//! local listener, so clients can reach the tunnel through that server. The
//! forward runs as a child `ssh` process driven by `sshpass`; the password
//! travels in the child's environment, never on its command line.

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{info, warn};

/// Where and how to open a reverse forward.
#[derive(Clone, PartialEq, Eq)]
pub struct ReverseTunnelSpec {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub username: String,
    pub password: String,
    /// Local listener port the forward points at.
    pub local_port: u16,
    /// Port opened on the SSH server.
    pub remote_port: u16,
}

impl fmt::Debug for ReverseTunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReverseTunnelSpec")
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("local_port", &self.local_port)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}

/// A running reverse forward.
pub struct ReverseTunnelHandle {
    child: Child,
    remote: String,
}

impl ReverseTunnelHandle {
    /// OS process id, if the child is still running.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// `host:port` opened on the remote side.
    pub fn remote(&self) -> &str {
        &self.remote
    }
}

/// Starts and stops reverse forwards.
#[async_trait]
pub trait ReverseForwarder: Send + Sync {
    async fn start(&self, spec: &ReverseTunnelSpec) -> io::Result<ReverseTunnelHandle>;

    /// Terminate the forward and reap it.
    async fn stop(&self, handle: ReverseTunnelHandle) -> io::Result<Option<ExitStatus>>;
}

/// Reverse forward through `sshpass -e ssh -R`.
#[derive(Debug, Clone)]
pub struct SshReverseForwarder {
    program: String,
}

impl SshReverseForwarder {
    pub fn new() -> Self {
        Self::with_program("sshpass")
    }

    /// Use a different launcher binary in place of `sshpass`.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Arguments passed to the launcher.
    pub fn command_args(spec: &ReverseTunnelSpec) -> Vec<String> {
        vec![
            "-e".to_string(),
            "ssh".to_string(),
            "-N".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-p".to_string(),
            spec.ssh_port.to_string(),
            "-R".to_string(),
            format!("{}:localhost:{}", spec.remote_port, spec.local_port),
            format!("{}@{}", spec.username, spec.ssh_host),
        ]
    }
}

impl Default for SshReverseForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReverseForwarder for SshReverseForwarder {
    async fn start(&self, spec: &ReverseTunnelSpec) -> io::Result<ReverseTunnelHandle> {
        let args = Self::command_args(spec);
        let remote = format!("{}:{}", spec.ssh_host, spec.remote_port);

        info!(
            program = %self.program,
            args = ?args,
            remote = %remote,
            local_port = spec.local_port,
            "Starting reverse tunnel"
        );

        let child = Command::new(&self.program)
            .args(&args)
            .env("SSHPASS", &spec.password)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        info!(pid = ?child.id(), remote = %remote, "Reverse tunnel started");
        Ok(ReverseTunnelHandle { child, remote })
    }

    async fn stop(&self, mut handle: ReverseTunnelHandle) -> io::Result<Option<ExitStatus>> {
        if let Some(status) = handle.child.try_wait()? {
            warn!(remote = %handle.remote, status = %status, "Reverse tunnel had already exited");
            return Ok(Some(status));
        }

        handle.child.kill().await?;
        info!(remote = %handle.remote, "Reverse tunnel stopped");
        Ok(None)
    }
}
