//! Proxy daemon server implementation.
//!
//! The daemon owns the `WebSocketProxy` and serves notebook windows via IPC
//! (Unix domain sockets on Unix, named pipes on Windows). Every window
//! connection is registered with the proxy as a window; when the connection
//! drops, the proxy sweeps the sockets that window owned.

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex, Notify};

#[cfg(unix)]
use tokio::net::UnixListener;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ServerOptions;

use crate::ipc::{self, FrameLimit, Handshake};
use crate::protocol::{ClientMessage, ErrorCode, Request, Response, ServerMessage};
use crate::proxy::WebSocketProxy;
use crate::singleton::{ProxyInfo, ProxyLock};
use crate::termination::TerminationRegistry;
use crate::{default_socket_path, WindowId};

/// Configuration for the proxy daemon.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Socket path for IPC.
    pub socket_path: PathBuf,
    /// Optional custom directory for lock and info files (used in tests).
    pub lock_dir: Option<PathBuf>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            lock_dir: None,
        }
    }
}

/// Error returned when another proxy daemon is already running.
#[derive(Debug, thiserror::Error)]
#[error("Another proxy daemon is already running: {info:?}")]
pub struct ProxyAlreadyRunning {
    pub info: ProxyInfo,
}

/// The proxy daemon state.
pub struct ProxyDaemon {
    config: ProxyConfig,
    proxy: Arc<WebSocketProxy>,
    shutdown: Arc<Mutex<bool>>,
    /// Notifier to wake up the accept loop on shutdown.
    shutdown_notify: Arc<Notify>,
    /// Singleton lock - kept alive while the daemon is running.
    _lock: ProxyLock,
}

type Outgoing = mpsc::UnboundedSender<ServerMessage>;

impl ProxyDaemon {
    /// Create a new daemon with the given configuration.
    ///
    /// Returns an error if another daemon is already running.
    pub fn new(config: ProxyConfig) -> Result<Arc<Self>, ProxyAlreadyRunning> {
        let lock = ProxyLock::try_acquire(config.lock_dir.as_ref())
            .map_err(|info| ProxyAlreadyRunning { info })?;

        Ok(Arc::new(Self {
            config,
            proxy: Arc::new(WebSocketProxy::new(TerminationRegistry::new())),
            shutdown: Arc::new(Mutex::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            _lock: lock,
        }))
    }

    /// The proxy served by this daemon.
    pub fn proxy(&self) -> &Arc<WebSocketProxy> {
        &self.proxy
    }

    /// Run the daemon server until a shutdown request arrives.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        #[cfg(unix)]
        {
            if let Some(parent) = self.config.socket_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }

            // Remove stale socket file
            if self.config.socket_path.exists() {
                tokio::fs::remove_file(&self.config.socket_path).await?;
            }
        }

        #[cfg(unix)]
        let listener = UnixListener::bind(&self.config.socket_path)?;

        // Write info only once the endpoint exists, so clients that find it can connect.
        if let Err(e) = self
            ._lock
            .write_info(&self.config.socket_path.to_string_lossy())
        {
            error!("[proxy-daemon] Failed to write daemon info: {}", e);
        }

        #[cfg(unix)]
        {
            self.run_unix_server(listener).await?;
        }

        #[cfg(windows)]
        {
            self.run_windows_server().await?;
        }

        let closed = self.proxy.close_all();
        info!("[proxy-daemon] Closed {} socket(s) on shutdown", closed);

        #[cfg(unix)]
        tokio::fs::remove_file(&self.config.socket_path).await.ok();

        Ok(())
    }

    /// Unix-specific server loop using Unix domain sockets.
    #[cfg(unix)]
    async fn run_unix_server(self: &Arc<Self>, listener: UnixListener) -> anyhow::Result<()> {
        info!("[proxy-daemon] Listening on {:?}", self.config.socket_path);

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let daemon = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = daemon.handle_connection(stream).await {
                                    error!("[proxy-daemon] Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("[proxy-daemon] Accept error: {}", e);
                        }
                    }
                }
                _ = self.shutdown_notify.notified() => {
                    if *self.shutdown.lock().await {
                        info!("[proxy-daemon] Shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Windows-specific server loop using named pipes.
    #[cfg(windows)]
    async fn run_windows_server(self: &Arc<Self>) -> anyhow::Result<()> {
        let pipe_name = self.config.socket_path.to_string_lossy().to_string();
        info!("[proxy-daemon] Listening on {}", pipe_name);

        let mut server = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&pipe_name)?;

        loop {
            tokio::select! {
                connect_result = server.connect() => {
                    if let Err(e) = connect_result {
                        error!("[proxy-daemon] Pipe connect error: {}", e);
                        continue;
                    }

                    let connected = server;

                    // Create the next instance before handling this one so
                    // new clients can connect meanwhile.
                    server = match ServerOptions::new().create(&pipe_name) {
                        Ok(s) => s,
                        Err(e) => {
                            error!("[proxy-daemon] Fatal: cannot create pipe server: {}", e);
                            break;
                        }
                    };

                    let daemon = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = daemon.handle_connection(connected).await {
                            error!("[proxy-daemon] Connection error: {}", e);
                        }
                    });
                }
                _ = self.shutdown_notify.notified() => {
                    if *self.shutdown.lock().await {
                        info!("[proxy-daemon] Shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single client connection.
    ///
    /// Generic over any stream that implements `AsyncRead + AsyncWrite`, so
    /// it serves both Unix sockets and Windows named pipes.
    async fn handle_connection<S>(self: Arc<Self>, stream: S) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);

        let handshake = match ipc::read_handshake(&mut reader).await? {
            Some(handshake) => handshake,
            None => return Ok(()),
        };

        // Responses and events share one writer task so frames never interleave.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = ipc::write_frame(&mut writer, &message).await {
                    debug!("[proxy-daemon] Client write failed: {}", e);
                    break;
                }
            }
        });

        let window = match handshake {
            Handshake::Window { label } => {
                let (event_tx, mut event_rx) = mpsc::unbounded_channel();
                let window = self.proxy.register_window(event_tx);
                info!(
                    "[proxy-daemon] {} connected{}",
                    window,
                    label.map(|l| format!(" ({})", l)).unwrap_or_default()
                );
                let events_out = out_tx.clone();
                tokio::spawn(async move {
                    while let Some(event) = event_rx.recv().await {
                        if events_out.send(ServerMessage::Event { event }).is_err() {
                            break;
                        }
                    }
                });
                Some(window)
            }
            Handshake::Control => None,
        };

        let result = self.read_requests(&mut reader, window, &out_tx).await;

        if let Some(window) = window {
            self.proxy.window_closed(window);
            info!("[proxy-daemon] {} disconnected", window);
        }

        result
    }

    async fn read_requests<R: AsyncRead + Unpin>(
        self: &Arc<Self>,
        reader: &mut R,
        window: Option<WindowId>,
        out: &Outgoing,
    ) -> anyhow::Result<()> {
        loop {
            let frame = match ipc::read_raw_frame(reader, FrameLimit::Message).await? {
                Some(frame) => frame,
                None => return Ok(()),
            };

            let message: ClientMessage = match serde_json::from_slice(&frame) {
                Ok(message) => message,
                Err(e) => {
                    warn!("[proxy-daemon] Dropping malformed request: {}", e);
                    continue;
                }
            };

            self.dispatch(message, window, out).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, message: ClientMessage, window: Option<WindowId>, out: &Outgoing) {
        let ClientMessage {
            request_id,
            request,
        } = message;

        let response = match request {
            Request::Open { request } => {
                let Some(window) = window else {
                    reply(
                        out,
                        request_id,
                        Response::error(
                            ErrorCode::NotPermitted,
                            "control connections cannot open sockets",
                        ),
                    );
                    return;
                };
                // Connecting suspends; keep serving this window meanwhile.
                // The `opened` reply is queued before the socket's first event.
                let proxy = self.proxy.clone();
                let out = out.clone();
                tokio::spawn(async move {
                    let opened = proxy
                        .open_then(window, request, |id| {
                            reply(&out, request_id, Response::Opened { id })
                        })
                        .await;
                    if let Err(e) = opened {
                        reply(&out, request_id, e.into());
                    }
                });
                return;
            }
            Request::Send { id, data } => {
                self.proxy.send(id, &data);
                Response::Ack
            }
            Request::Close { id, code, reason } => {
                self.proxy.close(id, code, reason);
                Response::Ack
            }
            Request::CloseForRuntime { runtime_id } => Response::Closed {
                count: self.proxy.close_connections_for_runtime(&runtime_id),
            },
            Request::CloseAll => Response::Closed {
                count: self.proxy.close_all(),
            },
            Request::NotifyRuntimeTerminated { runtime_id } => {
                self.proxy.mark_runtime_terminated(&runtime_id);
                Response::Ack
            }
            Request::IsRuntimeTerminated { runtime_id } => Response::Terminated {
                terminated: self.proxy.termination().is_terminated(&runtime_id),
            },
            Request::Status => Response::Stats {
                stats: self.proxy.stats(),
            },
            Request::Ping => Response::Pong,
            Request::Shutdown => {
                *self.shutdown.lock().await = true;
                self.shutdown_notify.notify_one();
                Response::ShuttingDown
            }
        };

        reply(out, request_id, response);
    }
}

fn reply(out: &Outgoing, request_id: u64, response: Response) {
    if out
        .send(ServerMessage::Response {
            request_id,
            response,
        })
        .is_err()
    {
        debug!("[proxy-daemon] Client gone before response {}", request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_proxy_config_default() {
        let config = ProxyConfig::default();
        assert!(config
            .socket_path
            .to_string_lossy()
            .contains("runtime-proxy"));
        assert!(config.lock_dir.is_none());
    }

    #[test]
    fn test_second_daemon_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config = ProxyConfig {
            socket_path: temp_dir.path().join("proxy.sock"),
            lock_dir: Some(temp_dir.path().to_path_buf()),
        };
        let first = ProxyDaemon::new(config.clone()).unwrap();
        assert!(ProxyDaemon::new(config).is_err());
        assert_eq!(first.proxy().stats().connections, 0);
    }
}
