//! runtime-proxy - Privileged WebSocket proxy for cloud notebook runtimes.
//!
//! Sandboxed notebook windows cannot open sockets to remote runtimes
//! themselves. They connect to this process over a local IPC socket and ask
//! it to open, feed, and close WebSocket connections on their behalf. The
//! proxy tracks every logical socket by window and by runtime so that a
//! closed window or a terminated runtime never leaves sockets behind.
//!
//! All traffic uses length-prefixed JSON framing over a Unix socket (named
//! pipe on Windows), with a channel handshake as the first frame.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub mod client;
pub mod daemon;
pub mod frame;
pub mod ipc;
pub mod protocol;
pub mod proxy;
pub mod registry;
pub mod singleton;
pub mod termination;

pub use proxy::{OpenRequest, ProxyError, WebSocketProxy};
pub use termination::TerminationRegistry;

// ============================================================================
// Paths
// ============================================================================

/// Get the base directory shared by the proxy daemon and the lifecycle side.
///
/// `~/.cache/cloud-runtimes/` on Linux, the platform cache dir elsewhere.
pub fn proxy_base_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("cloud-runtimes")
}

/// Get the default log path for the proxy daemon.
pub fn default_log_path() -> PathBuf {
    proxy_base_dir().join("runtime-proxy.log")
}

/// Get the default endpoint path for the proxy daemon.
///
/// On Unix, this returns a Unix socket path (e.g., ~/.cache/cloud-runtimes/runtime-proxy.sock).
#[cfg(unix)]
pub fn default_socket_path() -> PathBuf {
    proxy_base_dir().join("runtime-proxy.sock")
}

/// Get the default endpoint path for the proxy daemon.
///
/// On Windows, this returns a named pipe path (e.g., \\.\pipe\runtime-proxy).
#[cfg(windows)]
pub fn default_socket_path() -> PathBuf {
    PathBuf::from(r"\\.\pipe\runtime-proxy")
}

// ============================================================================
// Types
// ============================================================================

/// Identifier of a proxy-tracked socket. Monotonic per proxy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a window (one IPC client connection) that owns sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WindowId(pub u64);

impl std::fmt::Display for WindowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "window-{}", self.0)
    }
}

/// Proxy statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStats {
    /// Live proxied sockets.
    pub connections: usize,
    /// Windows currently registered with the proxy.
    pub windows: usize,
    /// Runtime ids marked terminated since the proxy started.
    pub terminated_runtimes: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_paths() {
        let socket = default_socket_path();
        assert!(socket.to_string_lossy().contains("runtime-proxy"));
        assert!(default_log_path()
            .to_string_lossy()
            .ends_with("runtime-proxy.log"));
    }

    #[test]
    fn test_ids_serialize_transparently() {
        assert_eq!(serde_json::to_string(&ConnectionId(7)).unwrap(), "7");
        assert_eq!(serde_json::to_string(&WindowId(3)).unwrap(), "3");
        assert_eq!(WindowId(3).to_string(), "window-3");
    }
}
