use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};

use crate::error::{ControlError, IpcError};
use crate::profile::{Position, Transform};
use crate::state::Reply;
use crate::topology::Head;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpcCommand {
    Reload,
    Switch { profile: String },
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IpcResponse {
    Success { message: String },
    Error { kind: Option<ControlError>, message: String },
    Status(StatusReport),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub current_profile: Option<String>,
    pub pending_profile: Option<String>,
    pub heads: Vec<HeadStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadStatus {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    pub mode: Option<String>,
    pub position: Position,
    pub scale: f64,
    pub transform: Transform,
}

impl From<&Head> for HeadStatus {
    fn from(head: &Head) -> Self {
        Self {
            name: head.name.clone(),
            description: head.description.clone(),
            enabled: head.enabled,
            mode: head.current_mode().map(|mode| {
                format!("{}x{}@{}Hz", mode.width, mode.height, mode.refresh as f64 / 1000.0)
            }),
            position: head.position,
            scale: head.scale,
            transform: head.transform,
        }
    }
}

impl From<std::result::Result<String, ControlError>> for IpcResponse {
    fn from(result: std::result::Result<String, ControlError>) -> Self {
        match result {
            Ok(profile) => IpcResponse::Success {
                message: format!("Profile '{}' applied", profile),
            },
            Err(err) => IpcResponse::Error {
                message: err.user_friendly_message(),
                kind: Some(err),
            },
        }
    }
}

/// A control command handed to the daemon loop, answered through `reply`
#[derive(Debug)]
pub enum ControlRequest {
    Reload { reply: Reply },
    Switch { profile: String, reply: Reply },
    Status { reply: oneshot::Sender<StatusReport> },
}

/// `$XDG_RUNTIME_DIR/outlay.$WAYLAND_DISPLAY.sock`, one socket per display
pub fn socket_path() -> std::result::Result<PathBuf, IpcError> {
    let display = std::env::var("WAYLAND_DISPLAY")
        .ok()
        .filter(|display| !display.is_empty())
        .ok_or(IpcError::NoDisplay)?;
    let runtime_dir = dirs::runtime_dir()
        .unwrap_or_else(|| PathBuf::from(format!("/run/user/{}", rustix::process::getuid().as_raw())));
    Ok(socket_path_in(&runtime_dir, &display))
}

fn socket_path_in(runtime_dir: &Path, display: &str) -> PathBuf {
    // WAYLAND_DISPLAY may be an absolute socket path
    let display = Path::new(display)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| display.to_string());
    runtime_dir.join(format!("outlay.{}.sock", display))
}

pub struct IpcClient {
    socket_path: PathBuf,
}

impl IpcClient {
    pub fn new() -> Result<Self> {
        let socket_path = socket_path().context("Failed to locate the outlay socket")?;
        Ok(Self::with_socket(socket_path))
    }

    pub fn with_socket(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    pub fn send_command(&self, command: &IpcCommand) -> Result<IpcResponse> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .with_context(|| format!("Failed to connect to outlay daemon at {:?}", self.socket_path))?;

        let command_json = serde_json::to_string(command)
            .with_context(|| "Failed to serialize command")?;

        stream.write_all(command_json.as_bytes())
            .with_context(|| "Failed to send command to daemon")?;
        stream.shutdown(std::net::Shutdown::Write)
            .with_context(|| "Failed to shutdown write stream")?;

        let mut response = String::new();
        stream.read_to_string(&mut response)
            .with_context(|| "Failed to read response from daemon")?;

        let ipc_response: IpcResponse = serde_json::from_str(&response)
            .with_context(|| "Failed to deserialize response")?;

        Ok(ipc_response)
    }
}

pub struct IpcServer {
    socket_path: PathBuf,
}

impl IpcServer {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Binds the socket, replacing a stale one. Must be called from within a
    /// tokio runtime.
    pub fn bind(&self) -> Result<UnixListener> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .with_context(|| "Failed to remove existing socket")?;
        }

        let creation_error = |source| IpcError::SocketCreation {
            path: self.socket_path.clone(),
            source,
        };
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(creation_error)?;
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(creation_error)?;

        log::info!("IPC server listening on {:?}", self.socket_path);
        Ok(listener)
    }

    /// Accepts connections until the daemon loop goes away
    pub async fn serve(listener: UnixListener, requests: mpsc::Sender<ControlRequest>) {
        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    log::error!("Error accepting IPC connection: {}", e);
                    continue;
                }
            };

            if requests.is_closed() {
                break;
            }

            let requests = requests.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, requests).await {
                    log::error!("Error handling IPC connection: {:#}", e);
                }
            });
        }
    }

    pub fn remove_socket(&self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            log::debug!("Failed to remove socket {:?}: {}", self.socket_path, e);
        }
    }

    async fn handle_connection(
        mut stream: tokio::net::UnixStream,
        requests: mpsc::Sender<ControlRequest>,
    ) -> Result<()> {
        let mut command_json = String::new();
        stream.read_to_string(&mut command_json).await
            .with_context(|| "Failed to read command from client")?;

        let response = match serde_json::from_str::<IpcCommand>(&command_json) {
            Ok(command) => {
                log::debug!("Received IPC command {:?}", command);
                Self::dispatch(command, &requests).await
            }
            Err(e) => IpcResponse::Error {
                kind: None,
                message: format!("{}: {}", IpcError::InvalidMessage, e),
            },
        };

        let response_json = serde_json::to_string(&response)
            .with_context(|| "Failed to serialize response")?;

        stream.write_all(response_json.as_bytes()).await
            .with_context(|| "Failed to send response to client")?;
        stream.shutdown().await
            .with_context(|| "Failed to shutdown write stream")?;

        Ok(())
    }

    async fn dispatch(command: IpcCommand, requests: &mpsc::Sender<ControlRequest>) -> IpcResponse {
        match command {
            IpcCommand::Status => {
                let (reply, answer) = oneshot::channel();
                if requests.send(ControlRequest::Status { reply }).await.is_err() {
                    return unresponsive();
                }
                match answer.await {
                    Ok(report) => IpcResponse::Status(report),
                    Err(_) => unresponsive(),
                }
            }
            IpcCommand::Reload => {
                let (reply, answer) = oneshot::channel();
                if requests.send(ControlRequest::Reload { reply }).await.is_err() {
                    return unresponsive();
                }
                answer.await.map(IpcResponse::from).unwrap_or_else(|_| unresponsive())
            }
            IpcCommand::Switch { profile } => {
                let (reply, answer) = oneshot::channel();
                if requests.send(ControlRequest::Switch { profile, reply }).await.is_err() {
                    return unresponsive();
                }
                answer.await.map(IpcResponse::from).unwrap_or_else(|_| unresponsive())
            }
        }
    }
}

fn unresponsive() -> IpcResponse {
    IpcResponse::Error {
        kind: None,
        message: IpcError::DaemonUnresponsive.to_string(),
    }
}
