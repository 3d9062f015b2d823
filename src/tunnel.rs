//! Local port tunnel to the build pod's SFTP endpoint.
//!
//! The tunnel wraps a `kubectl port-forward` subprocess. Readiness is
//! detected by scanning the child's stdout for the forwarding marker;
//! output can arrive in arbitrary chunk boundaries, so the scan
//! accumulates bytes rather than assuming line-buffered input. The child
//! is killed when the handle drops, so every exit path of a sync releases
//! the forwarded port.

use std::net::TcpListener;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::buildpod::{BUILD_POD_NAME, SFTP_PORT};
use crate::cluster::ClusterSettings;

/// Substring emitted on stdout once forwarding is live.
const READY_MARKER: &str = "Forwarding from";

/// Errors raised while establishing the tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Raised when the port-forward subprocess cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Binary that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the readiness marker does not appear within the bound.
    #[error("port-forward did not report readiness within {secs}s", secs = timeout.as_secs())]
    NotReady {
        /// Bound that was exceeded.
        timeout: Duration,
    },
    /// Raised when the subprocess exits before reporting readiness.
    #[error("port-forward process exited before becoming ready")]
    ProcessExited,
    /// Raised when no free local port could be reserved.
    #[error("failed to pick a local port: {message}")]
    LocalPort {
        /// Operating system error string.
        message: String,
    },
}

/// Running port-forward; the subprocess is killed when this drops.
#[derive(Debug)]
pub struct Tunnel {
    local_port: u16,
    child: Child,
}

impl Tunnel {
    /// Forwards `local_port` to the build pod's SFTP port and waits until
    /// the subprocess reports readiness.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::NotReady`] when the marker does not appear
    /// within `ready_timeout`, [`TunnelError::ProcessExited`] when the
    /// subprocess ends first, and [`TunnelError::Spawn`] when it cannot be
    /// started at all.
    pub async fn open(
        settings: &ClusterSettings,
        local_port: u16,
        ready_timeout: Duration,
    ) -> Result<Self, TunnelError> {
        let mut args = settings.base_args();
        args.push(String::from("port-forward"));
        args.push(format!("pod/{BUILD_POD_NAME}"));
        args.push(format!("{local_port}:{SFTP_PORT}"));

        let mut child = Command::new(&settings.kubectl_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| TunnelError::Spawn {
                program: settings.kubectl_bin.clone(),
                message: err.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or(TunnelError::ProcessExited)?;
        match timeout(ready_timeout, await_marker(stdout)).await {
            Ok(Ok(())) => Ok(Self { local_port, child }),
            Ok(Err(err)) => {
                child.start_kill().ok();
                Err(err)
            }
            Err(_elapsed) => {
                child.start_kill().ok();
                Err(TunnelError::NotReady {
                    timeout: ready_timeout,
                })
            }
        }
    }

    /// Local port the forward listens on.
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Terminates the forwarding subprocess.
    ///
    /// Dropping the handle has the same effect; this method makes the
    /// teardown point explicit at call sites.
    pub fn close(mut self) {
        self.child.start_kill().ok();
    }
}

/// Reads `stdout` until the readiness marker appears.
///
/// The marker can straddle read boundaries and the stream may carry
/// partial or non-UTF-8 bytes, so chunks are accumulated and decoded
/// lossily before searching.
async fn await_marker<R: AsyncRead + Unpin>(mut stdout: R) -> Result<(), TunnelError> {
    let mut seen = String::new();
    let mut buf = [0_u8; 4096];
    loop {
        let read = stdout
            .read(&mut buf)
            .await
            .map_err(|_| TunnelError::ProcessExited)?;
        if read == 0 {
            return Err(TunnelError::ProcessExited);
        }
        let chunk = buf.get(..read).unwrap_or_default();
        seen.push_str(&String::from_utf8_lossy(chunk));
        if seen.contains(READY_MARKER) {
            return Ok(());
        }
    }
}

/// Binds port 0 to let the operating system pick a free local port.
///
/// # Errors
///
/// Returns [`TunnelError::LocalPort`] when no port can be reserved.
pub fn free_local_port() -> Result<u16, TunnelError> {
    let listener =
        TcpListener::bind(("127.0.0.1", 0)).map_err(|err| TunnelError::LocalPort {
            message: err.to_string(),
        })?;
    let addr = listener.local_addr().map_err(|err| TunnelError::LocalPort {
        message: err.to_string(),
    })?;
    Ok(addr.port())
}
