//! Local IPC API
//!
//! A UNIX domain socket server carrying newline-delimited JSON requests
//! from the CLI client and the vpnc-script. Requests are forwarded to the
//! daemon control loop; a bad message closes only that connection.

use crate::config::SocketServerConfig;
use crate::daemon::Status;
use crate::error::{Error, Result};
use crate::vpnconfig::VpnConfig;
use serde::{Deserialize, Serialize};
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Requests of the IPC API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum Request {
    /// Query the current daemon status.
    Query,
    /// Deliver a VPN config from the setup script and connect.
    Connect { config: Box<VpnConfig> },
    /// Disconnect the active tunnel.
    Disconnect,
    /// Dump the daemon state.
    DumpState,
}

/// Responses of the IPC API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum Response {
    Ok,
    Status { status: Status },
    State { state: String },
    Error { message: String },
}

/// A request forwarded to the daemon control loop together with its
/// response channel.
pub(crate) struct ApiRequest {
    pub(crate) request: Request,
    pub(crate) respond: oneshot::Sender<Response>,
}

/// IPC API server.
pub(crate) struct ApiServer {
    config: SocketServerConfig,
    stop: CancellationToken,
    started: bool,
}

impl ApiServer {
    /// Creates a new server for the configured socket.
    pub(crate) fn new(config: SocketServerConfig, stop: CancellationToken) -> Self {
        Self {
            config,
            stop,
            started: false,
        }
    }

    /// Binds the socket and starts accepting connections. Returns the
    /// channel of forwarded requests.
    pub(crate) fn start(&mut self) -> Result<mpsc::Receiver<ApiRequest>> {
        if self.started {
            return Err(Error::Ipc("API server already started".into()));
        }
        let path = &self.config.socket_file;
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        // remove a stale socket from a previous run
        let _ = std::fs::remove_file(path);

        let listener = UnixListener::bind(path)
            .map_err(|e| Error::Ipc(format!("could not bind {}: {}", path.display(), e)))?;
        if let Ok(mode) = u32::from_str_radix(&self.config.socket_permissions, 8) {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
        }
        info!("API server listening on {}", path.display());

        let (requests_tx, requests_rx) = mpsc::channel(8);
        let request_timeout = Duration::from_secs(self.config.request_timeout);
        let stop = self.stop.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let requests_tx = requests_tx.clone();
                                tokio::spawn(handle_connection(
                                    stream,
                                    requests_tx,
                                    request_timeout,
                                ));
                            }
                            Err(e) => error!("API server accept error: {}", e),
                        }
                    }
                    _ = stop.cancelled() => break,
                }
            }
        });
        self.started = true;
        Ok(requests_rx)
    }

    /// Stops accepting connections.
    pub(crate) fn stop(&self) {
        self.stop.cancel();
        let _ = std::fs::remove_file(&self.config.socket_file);
    }
}

/// Handles one client connection until it closes, misbehaves or times
/// out.
async fn handle_connection(
    stream: UnixStream,
    requests_tx: mpsc::Sender<ApiRequest>,
    request_timeout: Duration,
) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = match timeout(request_timeout, lines.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => return, // client closed
            Ok(Err(e)) => {
                debug!("API server read error: {}", e);
                return;
            }
            Err(_) => {
                debug!("API server request timeout");
                return;
            }
        };

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                debug!("API server received invalid request: {}", e);
                let _ = write_response(
                    &mut write,
                    &Response::Error {
                        message: format!("invalid request: {}", e),
                    },
                )
                .await;
                return;
            }
        };

        let (respond, response_rx) = oneshot::channel();
        if requests_tx
            .send(ApiRequest { request, respond })
            .await
            .is_err()
        {
            return; // daemon is shutting down
        }
        let response = match response_rx.await {
            Ok(response) => response,
            Err(_) => return,
        };
        if write_response(&mut write, &response).await.is_err() {
            return;
        }
    }
}

async fn write_response(
    write: &mut (impl AsyncWriteExt + Unpin),
    response: &Response,
) -> Result<()> {
    let mut data = serde_json::to_vec(response)
        .map_err(|e| Error::Ipc(format!("could not encode response: {}", e)))?;
    data.push(b'\n');
    write.write_all(&data).await?;
    Ok(())
}
