//! Unix socket server for the agent tool protocol.
//!
//! Listens on a Unix domain socket and answers line-delimited JSON
//! [`BrokerRequest`]s with [`BrokerResponse`]s, one response per request,
//! in order.

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tollgate_common::{BrokerRequest, BrokerResponse};
use tracing::{debug, error, info, instrument, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{BrokerError, Result};
use crate::tools::ToolRegistry;

/// Maximum size of a single request line (1 MB).
const MAX_REQUEST_SIZE: usize = 1024 * 1024;

/// Tool server state.
pub struct Server {
    tools: Arc<ToolRegistry>,
    dispatcher: Arc<Dispatcher>,
    socket_path: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    #[must_use]
    pub const fn new(
        tools: Arc<ToolRegistry>,
        dispatcher: Arc<Dispatcher>,
        socket_path: PathBuf,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            tools,
            dispatcher,
            socket_path,
            shutdown_tx,
        }
    }

    /// Binds the socket, replacing a stale one, and restricts it to the owner.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or its mode set.
    pub fn bind(&self) -> Result<UnixListener> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        info!(socket_path = %self.socket_path.display(), "Tool server listening");
        Ok(listener)
    }

    /// Binds the socket and serves until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if socket binding fails.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = self.bind()?;
        self.serve(listener).await;
        Ok(())
    }

    /// Accepts connections on `listener` until shutdown, then removes the socket.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let server = Arc::clone(&self);
                            debug!("Client connected");
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_connection(stream).await {
                                    error!(error = %e, "Connection handling error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Accept error");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping accept loop");
                    break;
                }
            }
        }

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!("Failed to remove socket file: {e}");
            } else {
                info!("Cleaned up socket file");
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            match read_line_limited(&mut reader, &mut line).await {
                Ok(0) => {
                    debug!("Client disconnected");
                    break;
                }
                Ok(_) if line.trim().is_empty() => {}
                Ok(_) => {
                    let response = match serde_json::from_str::<BrokerRequest>(&line) {
                        Ok(request) => self.handle_request(request).await,
                        Err(e) => {
                            warn!(error = %e, "Invalid request JSON");
                            BrokerResponse::Error {
                                id: None,
                                kind: "invalid_request".to_string(),
                                message: format!("Invalid JSON: {e}"),
                            }
                        }
                    };
                    write_response(&mut writer, &response).await?;
                }
                Err(e) => {
                    warn!(error = %e, "Read error");
                    let response = BrokerResponse::from(e);
                    let _ = write_response(&mut writer, &response).await;
                    break;
                }
            }
        }

        Ok(())
    }

    #[instrument(skip_all)]
    async fn handle_request(&self, request: BrokerRequest) -> BrokerResponse {
        match request {
            BrokerRequest::ListTools => BrokerResponse::Tools {
                tools: self.tools.definitions(),
            },
            BrokerRequest::CallTool {
                id,
                name,
                arguments,
            } => {
                debug!(tool = %name, "Tool call");
                match self.tools.call(&name, &arguments).await {
                    Ok(result) => BrokerResponse::ToolResult { id, result },
                    Err(e) => BrokerResponse::Error {
                        id: Some(id),
                        kind: e.kind().to_string(),
                        message: e.sanitized_message(),
                    },
                }
            }
            BrokerRequest::Health => match self.dispatcher.health().await {
                Ok(report) => BrokerResponse::Health {
                    status: report.status.to_string(),
                    providers: report.providers,
                    active_sessions: report.active_sessions,
                },
                Err(e) => BrokerResponse::from(e),
            },
        }
    }
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &BrokerResponse) -> Result<()> {
    let json = serde_json::to_string(response)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a newline-delimited line with a size limit.
///
/// Returns the number of bytes read (0 = EOF). Errors if the
/// line exceeds `MAX_REQUEST_SIZE` before a newline is found.
async fn read_line_limited<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut String) -> Result<usize> {
    buf.clear();
    let mut bytes = Vec::new();

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            break;
        }

        let newline_pos = available.iter().position(|&b| b == b'\n');
        let n = newline_pos.map_or(available.len(), |p| p + 1);

        if bytes.len() + n > MAX_REQUEST_SIZE {
            reader.consume(n);
            return Err(BrokerError::InvalidRequest(format!(
                "request exceeds {MAX_REQUEST_SIZE} byte limit"
            )));
        }

        bytes.extend_from_slice(&available[..n]);
        reader.consume(n);

        if newline_pos.is_some() {
            break;
        }
    }

    let total = bytes.len();
    *buf = String::from_utf8(bytes)
        .map_err(|_| BrokerError::InvalidRequest("invalid UTF-8 in request".to_string()))?;
    Ok(total)
}
