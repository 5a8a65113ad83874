//! IPC protocol types for proxy daemon communication.
//!
//! Requests carry a client-chosen `request_id` that the daemon echoes on the
//! matching response. Socket lifecycle events are pushed on the same
//! connection, interleaved with responses (see `connection.rs`).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::frame::ProxyPayload;
use crate::proxy::{OpenRequest, ProxyError};
use crate::{ConnectionId, ProxyStats};

/// Requests that clients can send to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Open a proxied socket owned by the requesting window.
    Open {
        #[serde(flatten)]
        request: OpenRequest,
    },

    /// Send data on a socket (string, byte-array envelope, or any JSON).
    Send { id: ConnectionId, data: Value },

    /// Close a socket.
    Close {
        id: ConnectionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Close every socket bound to a runtime.
    CloseForRuntime { runtime_id: String },

    /// Close every socket (process-wide shutdown).
    CloseAll,

    /// Mirror a termination from the lifecycle side into the proxy's registry.
    NotifyRuntimeTerminated { runtime_id: String },

    /// Ask whether a runtime is marked terminated in the proxy's registry.
    IsRuntimeTerminated { runtime_id: String },

    /// Get proxy statistics.
    Status,

    /// Ping to check if the daemon is alive.
    Ping,

    /// Request daemon shutdown.
    Shutdown,
}

/// Machine-readable error classes so clients can rebuild typed errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    RuntimeTerminated,
    InvalidRequest,
    ConnectFailed,
    NotPermitted,
    Internal,
}

/// Responses from the daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Socket opened.
    Opened { id: ConnectionId },

    /// Fire-and-forget request accepted.
    Ack,

    /// Bulk close finished.
    Closed { count: usize },

    /// Termination flag state.
    Terminated { terminated: bool },

    /// Proxy statistics.
    Stats { stats: ProxyStats },

    /// Pong response to ping.
    Pong,

    /// Shutdown acknowledged.
    ShuttingDown,

    /// An error occurred.
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        runtime_id: Option<String>,
    },
}

impl Response {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Response::Error {
            code,
            message: message.into(),
            runtime_id: None,
        }
    }
}

impl From<ProxyError> for Response {
    fn from(err: ProxyError) -> Self {
        let message = err.to_string();
        match err {
            ProxyError::RuntimeTerminated(runtime_id) => Response::Error {
                code: ErrorCode::RuntimeTerminated,
                message,
                runtime_id: Some(runtime_id),
            },
            ProxyError::InvalidRequest(_) | ProxyError::UnknownWindow(_) => {
                Response::error(ErrorCode::InvalidRequest, message)
            }
            ProxyError::ConnectFailed(_) => Response::error(ErrorCode::ConnectFailed, message),
        }
    }
}

/// Socket lifecycle events delivered to the owning window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyEvent {
    Open {
        id: ConnectionId,
        /// Sub-protocol accepted by the server, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },
    Message {
        id: ConnectionId,
        data: ProxyPayload,
    },
    Close {
        id: ConnectionId,
        code: u16,
        reason: String,
    },
    Error {
        id: ConnectionId,
        message: String,
    },
}

impl ProxyEvent {
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            ProxyEvent::Open { id, .. }
            | ProxyEvent::Message { id, .. }
            | ProxyEvent::Close { id, .. }
            | ProxyEvent::Error { id, .. } => *id,
        }
    }
}

/// Client → daemon frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    pub request_id: u64,
    pub request: Request,
}

/// Daemon → client frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    Response { request_id: u64, response: Response },
    Event { event: ProxyEvent },
}
