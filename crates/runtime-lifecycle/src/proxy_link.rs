//! Link from the lifecycle side to the WebSocket proxy.
//!
//! Teardown needs two things from the proxy: close every socket bound to a
//! runtime, and mirror the runtime's termination into the proxy's own
//! registry, which is the one consulted when a socket is opened.

use std::sync::Arc;

use async_trait::async_trait;
use log::debug;
use runtime_proxy::client::ProxyHandle;
use runtime_proxy::WebSocketProxy;

use crate::error::LifecycleError;

#[async_trait]
pub trait ProxyControl: Send + Sync {
    async fn close_connections_for_runtime(&self, runtime_id: &str) -> Result<usize, LifecycleError>;

    async fn notify_runtime_terminated(&self, runtime_id: &str) -> Result<(), LifecycleError>;
}

/// A proxy daemon reached over IPC.
#[async_trait]
impl ProxyControl for ProxyHandle {
    async fn close_connections_for_runtime(&self, runtime_id: &str) -> Result<usize, LifecycleError> {
        Ok(ProxyHandle::close_connections_for_runtime(self, runtime_id).await?)
    }

    async fn notify_runtime_terminated(&self, runtime_id: &str) -> Result<(), LifecycleError> {
        Ok(ProxyHandle::notify_runtime_terminated(self, runtime_id).await?)
    }
}

/// A proxy living in this process.
#[async_trait]
impl ProxyControl for Arc<WebSocketProxy> {
    async fn close_connections_for_runtime(&self, runtime_id: &str) -> Result<usize, LifecycleError> {
        Ok(WebSocketProxy::close_connections_for_runtime(self, runtime_id))
    }

    async fn notify_runtime_terminated(&self, runtime_id: &str) -> Result<(), LifecycleError> {
        self.mark_runtime_terminated(runtime_id);
        Ok(())
    }
}

/// No proxy running: there are no sockets to close and nobody to notify.
pub struct DetachedProxy;

#[async_trait]
impl ProxyControl for DetachedProxy {
    async fn close_connections_for_runtime(&self, runtime_id: &str) -> Result<usize, LifecycleError> {
        debug!("[runtime-lifecycle] No proxy attached, no sockets to close for {}", runtime_id);
        Ok(0)
    }

    async fn notify_runtime_terminated(&self, runtime_id: &str) -> Result<(), LifecycleError> {
        debug!("[runtime-lifecycle] No proxy attached to notify about {}", runtime_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runtime_proxy::{OpenRequest, ProxyError};
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_in_process_proxy_mirrors_termination() {
        let proxy = Arc::new(WebSocketProxy::default());
        let control: Arc<dyn ProxyControl> = Arc::new(proxy.clone());

        assert_eq!(control.close_connections_for_runtime("rt-1").await.unwrap(), 0);
        control.notify_runtime_terminated("rt-1").await.unwrap();
        assert!(proxy.termination().is_terminated("rt-1"));

        let (tx, _rx) = mpsc::unbounded_channel();
        let window = proxy.register_window(tx);
        let err = proxy
            .open(window, OpenRequest::new("ws://127.0.0.1:9/").for_runtime("rt-1"))
            .await
            .unwrap_err();
        assert_eq!(err, ProxyError::RuntimeTerminated("rt-1".into()));
    }

    #[tokio::test]
    async fn test_detached_proxy_is_a_noop() {
        let control = DetachedProxy;
        assert_eq!(control.close_connections_for_runtime("rt-1").await.unwrap(), 0);
        control.notify_runtime_terminated("rt-1").await.unwrap();
    }
}
