use crate::cli::Action;
use crate::error::{NetjailError, Result};
use crate::manager::NetworkManager;
use crate::netns::NetnsSource;
use crate::types::UpInputs;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags, UnixAddr};
use serde::{Deserialize, Serialize};
use std::io::{IoSliceMut, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Envelope read from a daemon socket connection, after the ancillary
/// namespace descriptor. `data` stays opaque until the command dispatch
/// decodes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcMessage {
    pub command: String,
    pub handle: String,

    #[serde(default)]
    pub data: serde_json::Value,
}

/// Dispatches decoded transport requests into the orchestrator. Both the
/// one-shot stdin/stdout path and the socket path end up here.
#[derive(Clone)]
pub struct Mux {
    manager: Arc<NetworkManager>,
}

impl Mux {
    pub fn new(manager: Arc<NetworkManager>) -> Self {
        Self { manager }
    }

    /// One-shot entry point: request bytes from stdin, result JSON on
    /// stdout. The namespace source is the pid named in the request.
    pub async fn handle(
        &self,
        action: Action,
        handle: &str,
        input: &[u8],
        output: &mut dyn Write,
    ) -> Result<()> {
        if handle.is_empty() {
            return Err(NetjailError::Ipc("Missing handle".to_string()));
        }

        match action {
            Action::Up => {
                let inputs: UpInputs = serde_json::from_slice(input)
                    .map_err(|e| NetjailError::Ipc(format!("Malformed up inputs: {e}")))?;
                let pid = inputs.pid.ok_or_else(|| {
                    NetjailError::Ipc("Up request is missing a pid".to_string())
                })?;
                let outputs = self
                    .manager
                    .up(handle, inputs, NetnsSource::Pid(pid))
                    .await?;
                serde_json::to_writer(&mut *output, &outputs)?;
            }
            Action::Down => {
                self.manager.down(handle).await?;
                output.write_all(b"{}")?;
            }
        }
        Ok(())
    }

    /// Socket dispatch: the namespace source is the descriptor received
    /// out-of-band on the connection.
    async fn dispatch(&self, msg: IpcMessage, netns_fd: OwnedFd) -> Result<Vec<u8>> {
        if msg.handle.is_empty() {
            return Err(NetjailError::Ipc("Missing handle".to_string()));
        }

        match msg.command.as_str() {
            "up" => {
                let inputs: UpInputs = if msg.data.is_null() {
                    UpInputs::default()
                } else {
                    serde_json::from_value(msg.data)
                        .map_err(|e| NetjailError::Ipc(format!("Malformed up inputs: {e}")))?
                };
                let outputs = self
                    .manager
                    .up(&msg.handle, inputs, NetnsSource::Fd(netns_fd))
                    .await?;
                Ok(serde_json::to_vec(&outputs)?)
            }
            "down" => {
                self.manager.down(&msg.handle).await?;
                Ok(b"{}".to_vec())
            }
            other => Err(NetjailError::Ipc(format!(
                "Unrecognized command: {other}"
            ))),
        }
    }
}

/// Unix-domain-socket daemon. Each accepted connection carries exactly one
/// operation: one ancillary frame with the namespace descriptor, one JSON
/// message, one JSON reply.
pub struct SocketServer {
    mux: Mux,
    socket_path: PathBuf,
}

impl SocketServer {
    pub fn new(manager: Arc<NetworkManager>, socket_path: impl Into<PathBuf>) -> Self {
        Self {
            mux: Mux::new(manager),
            socket_path: socket_path.into(),
        }
    }

    /// Accept loop. Runs until `shutdown` fires, then stops accepting and
    /// removes the socket file; connections already spawned finish on
    /// their own. Per-connection failures are logged and never stop the
    /// loop.
    pub async fn serve(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(|e| {
                NetjailError::Ipc(format!(
                    "Failed to remove stale socket {}: {}",
                    self.socket_path.display(),
                    e
                ))
            })?;
        }
        let listener = UnixListener::bind(&self.socket_path).map_err(|e| {
            NetjailError::Ipc(format!(
                "Failed to bind socket {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        info!("Listening on {}", self.socket_path.display());

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let mux = self.mux.clone();
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(mux, stream).await {
                                warn!("Connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
            }
        }

        drop(listener);
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(NetjailError::Ipc(format!(
                    "Failed to remove socket {}: {}",
                    self.socket_path.display(),
                    e
                )))
            }
        }
        info!("Socket server stopped");
        Ok(())
    }
}

async fn serve_connection(mux: Mux, stream: tokio::net::UnixStream) -> Result<()> {
    // descriptor receipt and message decode are synchronous socket reads
    let std_stream = stream
        .into_std()
        .map_err(|e| NetjailError::Ipc(format!("Failed to detach stream: {e}")))?;
    std_stream
        .set_nonblocking(false)
        .map_err(|e| NetjailError::Ipc(format!("Failed to set blocking mode: {e}")))?;

    let (netns_fd, msg, std_stream) = tokio::task::spawn_blocking(
        move || -> Result<(OwnedFd, IpcMessage, StdUnixStream)> {
            let netns_fd = recv_netns_fd(&std_stream)?;
            let msg = read_message(&std_stream)?;
            Ok((netns_fd, msg, std_stream))
        },
    )
    .await
    .map_err(|e| NetjailError::Ipc(format!("Connection task failed: {e}")))??;

    debug!("Received {} for handle {}", msg.command, msg.handle);
    let reply = mux.dispatch(msg, netns_fd).await?;

    tokio::task::spawn_blocking(move || -> Result<()> {
        let mut writer = &std_stream;
        writer.write_all(&reply)?;
        Ok(())
    })
    .await
    .map_err(|e| NetjailError::Ipc(format!("Connection task failed: {e}")))??;

    Ok(())
}

/// Reads the single ancillary frame that must open every connection and
/// extracts exactly one namespace descriptor from it. Extra descriptors
/// are closed and the connection is rejected.
fn recv_netns_fd(stream: &StdUnixStream) -> Result<OwnedFd> {
    let mut cmsg_buf = nix::cmsg_space!([RawFd; 2]);
    let mut data = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut data)];

    let msg = recvmsg::<UnixAddr>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .map_err(|errno| NetjailError::Ipc(format!("Failed to read ancillary data: {errno}")))?;

    let mut fds: Vec<OwnedFd> = Vec::new();
    let cmsgs = msg
        .cmsgs()
        .map_err(|errno| NetjailError::Ipc(format!("Malformed control message: {errno}")))?;
    for cmsg in cmsgs {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            // wrap immediately so surplus descriptors are closed on drop
            fds.extend(
                received
                    .into_iter()
                    .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }),
            );
        }
    }

    if fds.len() != 1 {
        return Err(NetjailError::Ipc(format!(
            "Expected exactly one namespace descriptor, got {}",
            fds.len()
        )));
    }
    Ok(fds.remove(0))
}

/// Reads one JSON message from the connection, leaving any trailing bytes
/// untouched.
fn read_message(stream: &StdUnixStream) -> Result<IpcMessage> {
    let mut messages = serde_json::Deserializer::from_reader(stream).into_iter::<IpcMessage>();
    match messages.next() {
        Some(Ok(msg)) => Ok(msg),
        Some(Err(e)) => Err(NetjailError::Ipc(format!("Malformed message: {e}"))),
        None => Err(NetjailError::Ipc(
            "Connection closed before a message arrived".to_string(),
        )),
    }
}
