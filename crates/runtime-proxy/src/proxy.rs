//! WebSocket proxy: opens sockets to remote runtimes on behalf of windows.
//!
//! Each proxied socket is owned by a pump task that holds the actual
//! WebSocket stream. The registry only holds a command channel to that task,
//! so no lock is ever held across socket I/O:
//!
//! - `send` / `close` push commands to the pump task
//! - the pump task forwards `message` / `close` / `error` events to the
//!   owning window's event channel
//! - registry removal always happens before a `close` event is forwarded
//!
//! Sockets bound to a runtime can be closed in bulk, and a window that goes
//! away has all of its sockets swept.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::frame;
use crate::protocol::ProxyEvent;
use crate::registry::{Connection, ConnectionRegistry};
use crate::termination::TerminationRegistry;
use crate::{ConnectionId, ProxyStats, WindowId};

/// Close code for an orderly shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code used when a window disappears with sockets still open.
pub const GOING_AWAY: u16 = 1001;
/// Close code reported when the peer closed without a status code.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Close code reported when the socket died without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

pub const RUNTIME_TERMINATED_REASON: &str = "runtime terminated";
pub const SHUTDOWN_REASON: &str = "shutdown";
const WINDOW_CLOSED_REASON: &str = "window closed";

/// Parameters for opening a proxied socket.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRequest {
    pub url: String,
    /// Requested WebSocket sub-protocol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Extra handshake headers (e.g. authorization for the runtime ingress).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Runtime this socket belongs to, for termination guarding and bulk close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_id: Option<String>,
}

impl OpenRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn for_runtime(mut self, runtime_id: impl Into<String>) -> Self {
        self.runtime_id = Some(runtime_id.into());
        self
    }
}

/// Error type for proxy operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProxyError {
    #[error("Runtime {0} has been terminated")]
    RuntimeTerminated(String),

    #[error("Unknown window: {0}")]
    UnknownWindow(WindowId),

    #[error("Invalid open request: {0}")]
    InvalidRequest(String),

    #[error("Failed to connect: {0}")]
    ConnectFailed(String),
}

/// Commands sent from the registry side to a socket's pump task.
#[derive(Debug)]
enum SocketCommand {
    Send(Message),
    Close(Option<CloseFrame<'static>>),
}

type SocketHandle = mpsc::UnboundedSender<SocketCommand>;

/// Channel on which a window receives events for its sockets.
pub type WindowEventSender = mpsc::UnboundedSender<ProxyEvent>;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Default)]
struct ProxyState {
    connections: ConnectionRegistry<SocketHandle>,
    windows: HashMap<WindowId, WindowEventSender>,
}

/// The connection multiplexer.
pub struct WebSocketProxy {
    state: Arc<Mutex<ProxyState>>,
    termination: TerminationRegistry,
    next_connection_id: AtomicU64,
    next_window_id: AtomicU64,
}

impl WebSocketProxy {
    /// Create a proxy guarded by the given termination registry.
    pub fn new(termination: TerminationRegistry) -> Self {
        Self {
            state: Arc::new(Mutex::new(ProxyState::default())),
            termination,
            next_connection_id: AtomicU64::new(1),
            next_window_id: AtomicU64::new(1),
        }
    }

    /// The termination registry this proxy consults on `open`.
    pub fn termination(&self) -> &TerminationRegistry {
        &self.termination
    }

    /// Register a window and the channel its events should be delivered on.
    pub fn register_window(&self, events: WindowEventSender) -> WindowId {
        let window = WindowId(self.next_window_id.fetch_add(1, Ordering::Relaxed));
        lock_state(&self.state).windows.insert(window, events);
        debug!("[ws-proxy] Registered {}", window);
        window
    }

    /// Tear down a window: every socket it owns is force-closed and removed
    /// without waiting for the remote end. Returns the number of sockets swept.
    pub fn window_closed(&self, window: WindowId) -> usize {
        let swept = {
            let mut state = lock_state(&self.state);
            state.windows.remove(&window);
            let ids = state.connections.by_window(window);
            ids.into_iter()
                .filter_map(|id| state.connections.remove(id))
                .collect::<Vec<_>>()
        };

        let count = swept.len();
        for connection in swept {
            let _ = connection.handle.send(SocketCommand::Close(close_frame(
                Some(GOING_AWAY),
                Some(WINDOW_CLOSED_REASON.to_string()),
            )));
        }
        if count > 0 {
            info!("[ws-proxy] {} closed, swept {} socket(s)", window, count);
        }
        count
    }

    /// Open a proxied socket owned by `window`.
    ///
    /// Fails immediately, without touching the network, if the request names
    /// a runtime that is already terminated. The flag is checked again under
    /// the state lock when the socket is registered, since termination may
    /// race the handshake.
    pub async fn open(
        &self,
        window: WindowId,
        request: OpenRequest,
    ) -> Result<ConnectionId, ProxyError> {
        self.open_then(window, request, |_| {}).await
    }

    /// Like [`open`](Self::open), but runs `registered` with the new id
    /// before the `open` event is emitted and before any frame is pumped.
    ///
    /// The daemon uses this to put its `opened` response on the wire ahead
    /// of every event for the socket.
    pub async fn open_then<F>(
        &self,
        window: WindowId,
        request: OpenRequest,
        registered: F,
    ) -> Result<ConnectionId, ProxyError>
    where
        F: FnOnce(ConnectionId) + Send,
    {
        self.check_runtime(&request)?;
        if !self.window_alive(window) {
            return Err(ProxyError::UnknownWindow(window));
        }

        let ws_request = build_ws_request(&request)?;
        let (mut socket, response) = tokio_tungstenite::connect_async(ws_request)
            .await
            .map_err(|e| ProxyError::ConnectFailed(e.to_string()))?;

        let negotiated = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        let id = ConnectionId(self.next_connection_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        // The termination check and the insert share one critical section
        // with the sweep in `mark_runtime_terminated`: either this open sees
        // the flag, or the sweep sees the socket.
        let refused = {
            let mut state = lock_state(&self.state);
            if !state.windows.contains_key(&window) {
                Some(ProxyError::UnknownWindow(window))
            } else if let Err(e) = self.check_runtime(&request) {
                Some(e)
            } else {
                state.connections.add(Connection {
                    id,
                    window,
                    url: request.url.clone(),
                    protocol: request.protocol.clone(),
                    runtime_id: request.runtime_id.clone(),
                    handle: tx,
                });
                None
            }
        };

        if let Some(e) = refused {
            let close = match &e {
                ProxyError::RuntimeTerminated(_) => {
                    warn!(
                        "[ws-proxy] Runtime terminated while connecting to {}, closing",
                        request.url
                    );
                    close_frame(
                        Some(NORMAL_CLOSURE),
                        Some(RUNTIME_TERMINATED_REASON.to_string()),
                    )
                }
                _ => None,
            };
            let _ = socket.close(close).await;
            return Err(e);
        }

        info!(
            "[ws-proxy] Opened socket {} for {} -> {}{}",
            id,
            window,
            request.url,
            request
                .runtime_id
                .as_deref()
                .map(|r| format!(" (runtime {})", r))
                .unwrap_or_default()
        );

        registered(id);
        emit(
            &self.state,
            window,
            ProxyEvent::Open {
                id,
                protocol: negotiated,
            },
        );
        tokio::spawn(pump_socket(id, window, socket, rx, self.state.clone()));

        Ok(id)
    }

    /// Send data on a socket. Unknown ids are logged and ignored, since the
    /// far end may already have closed.
    ///
    /// Returns whether the data was handed to the socket task.
    pub fn send(&self, id: ConnectionId, data: &Value) -> bool {
        let handle = lock_state(&self.state)
            .connections
            .get(id)
            .map(|c| c.handle.clone());

        match handle {
            Some(handle) => {
                let delivered = handle
                    .send(SocketCommand::Send(frame::encode_outgoing(data)))
                    .is_ok();
                if !delivered {
                    debug!("[ws-proxy] Socket {} task already gone", id);
                }
                delivered
            }
            None => {
                warn!("[ws-proxy] Send to unknown socket {}, dropping", id);
                false
            }
        }
    }

    /// Close a socket with an optional code and reason, then forget it.
    ///
    /// Returns `false` (with a warning) for unknown ids.
    pub fn close(&self, id: ConnectionId, code: Option<u16>, reason: Option<String>) -> bool {
        let removed = lock_state(&self.state).connections.remove(id);
        match removed {
            Some(connection) => {
                let _ = connection
                    .handle
                    .send(SocketCommand::Close(close_frame(code, reason)));
                debug!("[ws-proxy] Closed socket {}", id);
                true
            }
            None => {
                warn!("[ws-proxy] Close for unknown socket {}", id);
                false
            }
        }
    }

    /// Close every socket bound to `runtime_id` and drop its index bucket.
    pub fn close_connections_for_runtime(&self, runtime_id: &str) -> usize {
        let closed = {
            let mut state = lock_state(&self.state);
            let ids = state.connections.by_runtime(runtime_id);
            let closed = ids
                .into_iter()
                .filter_map(|id| state.connections.remove(id))
                .collect::<Vec<_>>();
            state.connections.drop_runtime_bucket(runtime_id);
            closed
        };

        if closed.is_empty() {
            debug!("[ws-proxy] No sockets to close for runtime {}", runtime_id);
            return 0;
        }

        let count = closed.len();
        for connection in closed {
            let _ = connection.handle.send(SocketCommand::Close(close_frame(
                Some(NORMAL_CLOSURE),
                Some(RUNTIME_TERMINATED_REASON.to_string()),
            )));
        }
        info!(
            "[ws-proxy] Closed {} socket(s) for runtime {}",
            count, runtime_id
        );
        count
    }

    /// Close every live socket and clear all indexes.
    pub fn close_all(&self) -> usize {
        let all = lock_state(&self.state).connections.drain();
        let count = all.len();
        for connection in all {
            let _ = connection.handle.send(SocketCommand::Close(close_frame(
                Some(NORMAL_CLOSURE),
                Some(SHUTDOWN_REASON.to_string()),
            )));
        }
        if count > 0 {
            info!("[ws-proxy] Closed all {} socket(s)", count);
        }
        count
    }

    /// Mark a runtime terminated in this process's registry, then close any
    /// socket that finished its handshake before the flag was set.
    ///
    /// Returns whether the runtime was newly marked.
    pub fn mark_runtime_terminated(&self, runtime_id: &str) -> bool {
        let newly_marked = self.termination.mark_terminated(runtime_id);
        self.close_connections_for_runtime(runtime_id);
        newly_marked
    }

    pub fn is_open(&self, id: ConnectionId) -> bool {
        lock_state(&self.state).connections.contains(id)
    }

    /// Ids currently owned by a window.
    pub fn window_connections(&self, window: WindowId) -> HashSet<ConnectionId> {
        lock_state(&self.state).connections.by_window(window)
    }

    /// Ids currently bound to a runtime.
    pub fn runtime_connections(&self, runtime_id: &str) -> HashSet<ConnectionId> {
        lock_state(&self.state).connections.by_runtime(runtime_id)
    }

    pub fn has_window_bucket(&self, window: WindowId) -> bool {
        lock_state(&self.state).connections.has_window(window)
    }

    pub fn has_runtime_bucket(&self, runtime_id: &str) -> bool {
        lock_state(&self.state).connections.has_runtime(runtime_id)
    }

    pub fn stats(&self) -> ProxyStats {
        let state = lock_state(&self.state);
        ProxyStats {
            connections: state.connections.len(),
            windows: state.windows.len(),
            terminated_runtimes: self.termination.len(),
        }
    }

    fn check_runtime(&self, request: &OpenRequest) -> Result<(), ProxyError> {
        match &request.runtime_id {
            Some(runtime_id) if self.termination.is_terminated(runtime_id) => {
                warn!(
                    "[ws-proxy] Refusing to open socket for terminated runtime {}",
                    runtime_id
                );
                Err(ProxyError::RuntimeTerminated(runtime_id.clone()))
            }
            _ => Ok(()),
        }
    }

    fn window_alive(&self, window: WindowId) -> bool {
        lock_state(&self.state)
            .windows
            .get(&window)
            .map_or(false, |events| !events.is_closed())
    }
}

impl Default for WebSocketProxy {
    fn default() -> Self {
        Self::new(TerminationRegistry::new())
    }
}

fn lock_state(state: &Mutex<ProxyState>) -> MutexGuard<'_, ProxyState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// Deliver an event to a window if it is still registered and listening.
fn emit(state: &Mutex<ProxyState>, window: WindowId, event: ProxyEvent) {
    let events = lock_state(state).windows.get(&window).cloned();
    if let Some(events) = events {
        if events.send(event).is_err() {
            debug!("[ws-proxy] {} no longer listening", window);
        }
    }
}

fn remove_connection(state: &Mutex<ProxyState>, id: ConnectionId) {
    lock_state(state).connections.remove(id);
}

fn close_frame(code: Option<u16>, reason: Option<String>) -> Option<CloseFrame<'static>> {
    code.map(|code| CloseFrame {
        code: CloseCode::from(code),
        reason: reason.unwrap_or_default().into(),
    })
}

fn build_ws_request(request: &OpenRequest) -> Result<Request, ProxyError> {
    let mut ws_request = request
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

    let headers = ws_request.headers_mut();
    if let Some(protocol) = &request.protocol {
        let value = HeaderValue::from_str(protocol)
            .map_err(|e| ProxyError::InvalidRequest(format!("sub-protocol: {}", e)))?;
        headers.insert(SEC_WEBSOCKET_PROTOCOL, value);
    }
    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProxyError::InvalidRequest(format!("header {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ProxyError::InvalidRequest(format!("header {}: {}", name, e)))?;
        headers.insert(name, value);
    }

    Ok(ws_request)
}

/// Own one socket: forward frames to the window and apply commands.
async fn pump_socket(
    id: ConnectionId,
    window: WindowId,
    socket: Socket,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    state: Arc<Mutex<ProxyState>>,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let data = frame::decode_incoming(text.as_bytes());
                    emit(&state, window, ProxyEvent::Message { id, data });
                }
                Some(Ok(Message::Binary(bytes))) => {
                    let data = frame::decode_incoming(&bytes);
                    emit(&state, window, ProxyEvent::Message { id, data });
                }
                Some(Ok(Message::Close(close))) => {
                    let (code, reason) = close
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    remove_connection(&state, id);
                    emit(&state, window, ProxyEvent::Close { id, code, reason });
                    let _ = sink.close().await;
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("[ws-proxy] Socket {} transport error: {}", id, e);
                    emit(&state, window, ProxyEvent::Error { id, message: e.to_string() });
                    remove_connection(&state, id);
                    emit(&state, window, ProxyEvent::Close {
                        id,
                        code: ABNORMAL_CLOSURE,
                        reason: e.to_string(),
                    });
                    break;
                }
                None => {
                    remove_connection(&state, id);
                    emit(&state, window, ProxyEvent::Close {
                        id,
                        code: ABNORMAL_CLOSURE,
                        reason: String::new(),
                    });
                    break;
                }
            },
            command = commands.recv() => match command {
                Some(SocketCommand::Send(message)) => {
                    if let Err(e) = sink.send(message).await {
                        warn!("[ws-proxy] Socket {} send failed: {}", id, e);
                        emit(&state, window, ProxyEvent::Error { id, message: e.to_string() });
                        remove_connection(&state, id);
                        emit(&state, window, ProxyEvent::Close {
                            id,
                            code: ABNORMAL_CLOSURE,
                            reason: e.to_string(),
                        });
                        break;
                    }
                }
                Some(SocketCommand::Close(close)) => {
                    let (code, reason) = close
                        .as_ref()
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    if let Err(e) = sink.send(Message::Close(close)).await {
                        debug!("[ws-proxy] Socket {} close frame not sent: {}", id, e);
                    }
                    remove_connection(&state, id);
                    emit(&state, window, ProxyEvent::Close { id, code, reason });
                    break;
                }
                None => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    }

    debug!("[ws-proxy] Socket {} task finished", id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_request_serialization_skips_empty() {
        let json = serde_json::to_string(&OpenRequest::new("ws://h/k")).unwrap();
        assert_eq!(json, r#"{"url":"ws://h/k"}"#);

        let request = OpenRequest::new("ws://h/k").for_runtime("rt-1");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["runtime_id"], "rt-1");
    }

    #[test]
    fn test_build_request_sets_protocol_and_headers() {
        let mut request = OpenRequest::new("wss://runtime.example/api/kernels/k1/channels");
        request.protocol = Some("v1.kernel.websocket.jupyter.org".into());
        request
            .headers
            .insert("Authorization".into(), "Bearer abc".into());

        let built = build_ws_request(&request).unwrap();
        assert_eq!(
            built.headers().get(SEC_WEBSOCKET_PROTOCOL).unwrap(),
            "v1.kernel.websocket.jupyter.org"
        );
        assert_eq!(built.headers().get("authorization").unwrap(), "Bearer abc");
    }

    #[test]
    fn test_build_request_rejects_bad_url() {
        let err = build_ws_request(&OpenRequest::new("not a url")).unwrap_err();
        assert!(matches!(err, ProxyError::InvalidRequest(_)));
    }

    #[test]
    fn test_close_frame_defaults() {
        assert!(close_frame(None, Some("ignored".into())).is_none());
        let frame = close_frame(Some(4000), None).unwrap();
        assert_eq!(u16::from(frame.code), 4000);
        assert_eq!(frame.reason, "");
    }

    #[tokio::test]
    async fn test_open_terminated_runtime_fails_without_connecting() {
        let termination = TerminationRegistry::new();
        termination.mark_terminated("rt-dead");
        let proxy = WebSocketProxy::new(termination);
        let (tx, _rx) = mpsc::unbounded_channel();
        let window = proxy.register_window(tx);

        // Port 9 is never reached: the guard fires first.
        let request = OpenRequest::new("ws://127.0.0.1:9/").for_runtime("rt-dead");
        let err = proxy.open(window, request).await.unwrap_err();
        assert_eq!(err, ProxyError::RuntimeTerminated("rt-dead".into()));
        assert!(!proxy.has_runtime_bucket("rt-dead"));
        assert_eq!(proxy.stats().connections, 0);
    }

    #[tokio::test]
    async fn test_open_unknown_window_fails() {
        let proxy = WebSocketProxy::default();
        let err = proxy
            .open(WindowId(99), OpenRequest::new("ws://127.0.0.1:9/"))
            .await
            .unwrap_err();
        assert_eq!(err, ProxyError::UnknownWindow(WindowId(99)));
    }

    #[test]
    fn test_send_and_close_unknown_are_noops() {
        let proxy = WebSocketProxy::default();
        assert!(!proxy.send(ConnectionId(5), &Value::String("x".into())));
        assert!(!proxy.close(ConnectionId(5), Some(1000), None));
        assert_eq!(proxy.close_connections_for_runtime("nope"), 0);
        assert_eq!(proxy.close_all(), 0);
    }
}
