//! Client for communicating with the proxy daemon.
//!
//! A notebook window connects once with a window handshake and keeps the
//! connection open: requests and responses are correlated by `request_id`,
//! and socket events arrive on a separate receiver. Dropping every
//! `ProxyHandle` clone disconnects the window, which makes the daemon sweep
//! the sockets it owned.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::ipc::{self, Handshake};
use crate::protocol::{ClientMessage, ErrorCode, ProxyEvent, Request, Response, ServerMessage};
use crate::proxy::OpenRequest;
use crate::{default_socket_path, ConnectionId, ProxyStats};

/// Error type for client operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed to connect to proxy: {0}")]
    ConnectionFailed(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Runtime {0} has been terminated")]
    RuntimeTerminated(String),

    #[error("Proxy returned error: {0}")]
    ProxyError(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Disconnected from proxy")]
    Disconnected,
}

/// Client for the proxy daemon.
pub struct ProxyClient {
    socket_path: PathBuf,
    connect_timeout: Duration,
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new(default_socket_path())
    }
}

impl ProxyClient {
    /// Create a new client with a custom socket/pipe path.
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            connect_timeout: Duration::from_secs(2),
        }
    }

    /// Set the connection timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Connect as a notebook window.
    pub async fn connect_window(
        &self,
        label: Option<&str>,
    ) -> Result<(ProxyHandle, ProxyEventReceiver), ClientError> {
        self.connect(Handshake::Window {
            label: label.map(String::from),
        })
        .await
    }

    /// Connect as a control client. Control clients never receive events.
    pub async fn connect_control(&self) -> Result<ProxyHandle, ClientError> {
        let (handle, _events) = self.connect(Handshake::Control).await?;
        Ok(handle)
    }

    /// Check if the daemon is running.
    pub async fn is_daemon_running(&self) -> bool {
        self.ping().await.is_ok()
    }

    /// Ping the daemon to check if it's alive.
    pub async fn ping(&self) -> Result<(), ClientError> {
        self.connect_control().await?.ping().await
    }

    /// Get proxy statistics.
    pub async fn status(&self) -> Result<ProxyStats, ClientError> {
        self.connect_control().await?.status().await
    }

    /// Request daemon shutdown.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        self.connect_control().await?.shutdown().await
    }

    /// Mirror a runtime termination into the daemon's registry.
    pub async fn notify_runtime_terminated(&self, runtime_id: &str) -> Result<(), ClientError> {
        self.connect_control()
            .await?
            .notify_runtime_terminated(runtime_id)
            .await
    }

    async fn connect(
        &self,
        handshake: Handshake,
    ) -> Result<(ProxyHandle, ProxyEventReceiver), ClientError> {
        #[cfg(unix)]
        let stream = {
            let connect_result =
                tokio::time::timeout(self.connect_timeout, UnixStream::connect(&self.socket_path))
                    .await;

            match connect_result {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => return Err(ClientError::ConnectionFailed(e)),
                Err(_) => return Err(ClientError::Timeout),
            }
        };

        #[cfg(windows)]
        let stream = {
            let pipe_name = self.socket_path.to_string_lossy().to_string();
            let connect_result = tokio::time::timeout(self.connect_timeout, async {
                // Named pipes may need retry if server is between connections
                let mut attempts = 0;
                loop {
                    match ClientOptions::new().open(&pipe_name) {
                        Ok(client) => return Ok(client),
                        Err(_) if attempts < 5 => {
                            attempts += 1;
                            tokio::time::sleep(Duration::from_millis(50)).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
            })
            .await;

            match connect_result {
                Ok(Ok(s)) => s,
                Ok(Err(e)) => return Err(ClientError::ConnectionFailed(e)),
                Err(_) => return Err(ClientError::Timeout),
            }
        };

        start_session(stream, handshake).await
    }
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

/// Send the handshake, then split the stream into a writer task and a
/// reader task that routes responses and events.
async fn start_session<S>(
    mut stream: S,
    handshake: Handshake,
) -> Result<(ProxyHandle, ProxyEventReceiver), ClientError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    ipc::write_frame(&mut stream, &handshake)
        .await
        .map_err(|e| ClientError::ProtocolError(format!("handshake: {}", e)))?;

    let (mut reader, mut writer) = tokio::io::split(stream);
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

    tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            if let Err(e) = ipc::write_frame(&mut writer, &message).await {
                warn!("[proxy-client] Write failed: {}", e);
                break;
            }
        }
        // Every handle is gone: half-close so the daemon sees EOF.
        let _ = writer.shutdown().await;
    });

    let reader_pending = pending.clone();
    tokio::spawn(async move {
        loop {
            match ipc::read_frame::<_, ServerMessage>(&mut reader).await {
                Ok(Some(ServerMessage::Response {
                    request_id,
                    response,
                })) => {
                    let waiter = lock_pending(&reader_pending).remove(&request_id);
                    match waiter {
                        Some(waiter) => {
                            let _ = waiter.send(response);
                        }
                        None => debug!("[proxy-client] Response for unknown request {}", request_id),
                    }
                }
                Ok(Some(ServerMessage::Event { event })) => {
                    let _ = events_tx.send(event);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("[proxy-client] Read failed: {}", e);
                    break;
                }
            }
        }
        // Dropping the waiters fails their requests with `Disconnected`.
        lock_pending(&reader_pending).clear();
    });

    Ok((
        ProxyHandle {
            outgoing: outgoing_tx,
            pending,
            next_request_id: Arc::new(AtomicU64::new(1)),
        },
        ProxyEventReceiver { events: events_rx },
    ))
}

fn lock_pending(
    pending: &Mutex<HashMap<u64, oneshot::Sender<Response>>>,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Response>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// Socket events for a window connection.
///
/// A socket's `open` event always arrives after the `open` call that
/// created it has returned its id.
pub struct ProxyEventReceiver {
    events: mpsc::UnboundedReceiver<ProxyEvent>,
}

impl ProxyEventReceiver {
    /// Wait for the next event. Returns `None` once the daemon connection is gone.
    pub async fn recv(&mut self) -> Option<ProxyEvent> {
        self.events.recv().await
    }
}

/// Handle to a live daemon connection. Cheap to clone.
#[derive(Clone)]
pub struct ProxyHandle {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    pending: PendingMap,
    next_request_id: Arc<AtomicU64>,
}

impl ProxyHandle {
    async fn request(&self, request: Request) -> Result<Response, ClientError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(request_id, tx);

        if self
            .outgoing
            .send(ClientMessage {
                request_id,
                request,
            })
            .is_err()
        {
            lock_pending(&self.pending).remove(&request_id);
            return Err(ClientError::Disconnected);
        }

        rx.await.map_err(|_| ClientError::Disconnected)
    }

    /// Open a proxied socket owned by this window.
    pub async fn open(&self, request: OpenRequest) -> Result<ConnectionId, ClientError> {
        match self.request(Request::Open { request }).await? {
            Response::Opened { id } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    /// Send data on a socket.
    pub async fn send(&self, id: ConnectionId, data: Value) -> Result<(), ClientError> {
        expect_ack(self.request(Request::Send { id, data }).await?)
    }

    /// Close a socket.
    pub async fn close(
        &self,
        id: ConnectionId,
        code: Option<u16>,
        reason: Option<String>,
    ) -> Result<(), ClientError> {
        expect_ack(self.request(Request::Close { id, code, reason }).await?)
    }

    /// Close every socket bound to a runtime. Returns how many were closed.
    pub async fn close_connections_for_runtime(
        &self,
        runtime_id: &str,
    ) -> Result<usize, ClientError> {
        let request = Request::CloseForRuntime {
            runtime_id: runtime_id.to_string(),
        };
        match self.request(request).await? {
            Response::Closed { count } => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    /// Close every socket in the daemon.
    pub async fn close_all(&self) -> Result<usize, ClientError> {
        match self.request(Request::CloseAll).await? {
            Response::Closed { count } => Ok(count),
            other => Err(unexpected(other)),
        }
    }

    pub async fn notify_runtime_terminated(&self, runtime_id: &str) -> Result<(), ClientError> {
        expect_ack(
            self.request(Request::NotifyRuntimeTerminated {
                runtime_id: runtime_id.to_string(),
            })
            .await?,
        )
    }

    pub async fn is_runtime_terminated(&self, runtime_id: &str) -> Result<bool, ClientError> {
        let request = Request::IsRuntimeTerminated {
            runtime_id: runtime_id.to_string(),
        };
        match self.request(request).await? {
            Response::Terminated { terminated } => Ok(terminated),
            other => Err(unexpected(other)),
        }
    }

    pub async fn status(&self) -> Result<ProxyStats, ClientError> {
        match self.request(Request::Status).await? {
            Response::Stats { stats } => Ok(stats),
            other => Err(unexpected(other)),
        }
    }

    pub async fn ping(&self) -> Result<(), ClientError> {
        match self.request(Request::Ping).await? {
            Response::Pong => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn shutdown(&self) -> Result<(), ClientError> {
        match self.request(Request::Shutdown).await? {
            Response::ShuttingDown => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn expect_ack(response: Response) -> Result<(), ClientError> {
    match response {
        Response::Ack => Ok(()),
        other => Err(unexpected(other)),
    }
}

/// Map an error (or an out-of-place) response to a client error.
fn unexpected(response: Response) -> ClientError {
    match response {
        Response::Error {
            code: ErrorCode::RuntimeTerminated,
            runtime_id,
            message,
        } => ClientError::RuntimeTerminated(runtime_id.unwrap_or(message)),
        Response::Error { message, .. } => ClientError::ProxyError(message),
        _ => ClientError::ProtocolError("Unexpected response".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminated_error_maps_to_typed_error() {
        let err = unexpected(Response::Error {
            code: ErrorCode::RuntimeTerminated,
            message: "Runtime rt-1 has been terminated".into(),
            runtime_id: Some("rt-1".into()),
        });
        assert!(matches!(err, ClientError::RuntimeTerminated(id) if id == "rt-1"));
    }

    #[test]
    fn test_other_errors_map_to_proxy_error() {
        let err = unexpected(Response::error(ErrorCode::ConnectFailed, "refused"));
        assert!(matches!(err, ClientError::ProxyError(m) if m == "refused"));

        let err = unexpected(Response::Pong);
        assert!(matches!(err, ClientError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn test_connect_to_missing_socket_fails() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let client = ProxyClient::new(temp_dir.path().join("missing.sock"))
            .with_timeout(Duration::from_millis(200));
        assert!(!client.is_daemon_running().await);
    }
}
