//! Session and kernel management on a runtime's Jupyter server.
//!
//! Teardown needs only a small slice of the Jupyter REST API: list and shut
//! down sessions and kernels. `SessionManager` is the capability the
//! lifecycle manager drives; `JupyterServices` implements it over HTTP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::runtime::Runtime;

/// Error type for session manager operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServicesError {
    /// The session or kernel no longer exists.
    #[error("{0} was already shut down")]
    AlreadyShutDown(String),

    /// The server answered 200 where 204 was expected for a shutdown.
    #[error("shutdown of {0} returned 200 instead of 204")]
    UnexpectedOk(String),

    #[error("session manager already disposed")]
    Disposed,

    #[error("polling cancelled")]
    PollCancelled,

    #[error("request failed ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ServicesError {
    /// Errors that mean the requested end state already holds.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            ServicesError::AlreadyShutDown(_)
                | ServicesError::UnexpectedOk(_)
                | ServicesError::Disposed
                | ServicesError::PollCancelled
        )
    }
}

impl From<reqwest::Error> for ServicesError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ServicesError::InvalidResponse(err.to_string())
        } else {
            ServicesError::Network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelModel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionModel {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<KernelModel>,
}

/// Live handle to a runtime's session and kernel services.
#[async_trait]
pub trait SessionManager: Send + Sync {
    async fn list_running_sessions(&self) -> Result<Vec<SessionModel>, ServicesError>;

    async fn shutdown_session(&self, session_id: &str) -> Result<(), ServicesError>;

    async fn list_running_kernels(&self) -> Result<Vec<KernelModel>, ServicesError>;

    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), ServicesError>;

    /// Release the handle. Disposing twice reports `ServicesError::Disposed`.
    async fn dispose(&self) -> Result<(), ServicesError>;

    /// Release the handle unconditionally, dropping any cached state.
    /// Used when `dispose` failed for a non-benign reason.
    fn force_dispose(&self);

    fn is_disposed(&self) -> bool;
}

impl std::fmt::Debug for dyn SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").finish_non_exhaustive()
    }
}

/// Builds session managers for runtimes.
#[async_trait]
pub trait SessionManagerFactory: Send + Sync {
    async fn connect(&self, runtime: &Runtime) -> Result<Arc<dyn SessionManager>, ServicesError>;
}

/// `SessionManager` over the Jupyter server REST API.
pub struct JupyterServices {
    client: reqwest::Client,
    base_url: String,
    token: String,
    disposed: AtomicBool,
}

impl JupyterServices {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            disposed: AtomicBool::new(false),
        }
    }

    fn ensure_live(&self) -> Result<(), ServicesError> {
        if self.is_disposed() {
            Err(ServicesError::Disposed)
        } else {
            Ok(())
        }
    }

    async fn list<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Vec<T>, ServicesError> {
        self.ensure_live()?;
        let response = self
            .client
            .get(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("token {}", self.token))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServicesError::Http {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }
        Ok(response.json().await?)
    }

    async fn shutdown(&self, path: &str, what: String) -> Result<(), ServicesError> {
        self.ensure_live()?;
        let response = self
            .client
            .delete(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("token {}", self.token))
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => {
                debug!("[jupyter-services] Shut down {}", what);
                Ok(())
            }
            StatusCode::OK => Err(ServicesError::UnexpectedOk(what)),
            StatusCode::NOT_FOUND => Err(ServicesError::AlreadyShutDown(what)),
            status => Err(ServicesError::Http {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl SessionManager for JupyterServices {
    async fn list_running_sessions(&self) -> Result<Vec<SessionModel>, ServicesError> {
        self.list("/api/sessions").await
    }

    async fn shutdown_session(&self, session_id: &str) -> Result<(), ServicesError> {
        self.shutdown(
            &format!("/api/sessions/{}", session_id),
            format!("session {}", session_id),
        )
        .await
    }

    async fn list_running_kernels(&self) -> Result<Vec<KernelModel>, ServicesError> {
        self.list("/api/kernels").await
    }

    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), ServicesError> {
        self.shutdown(
            &format!("/api/kernels/{}", kernel_id),
            format!("kernel {}", kernel_id),
        )
        .await
    }

    async fn dispose(&self) -> Result<(), ServicesError> {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return Err(ServicesError::Disposed);
        }
        info!("[jupyter-services] Disposed handle for {}", self.base_url);
        Ok(())
    }

    fn force_dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

/// Factory that points a `JupyterServices` at each runtime's ingress.
#[derive(Default)]
pub struct JupyterServicesFactory {
    client: reqwest::Client,
}

impl JupyterServicesFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionManagerFactory for JupyterServicesFactory {
    async fn connect(&self, runtime: &Runtime) -> Result<Arc<dyn SessionManager>, ServicesError> {
        Ok(Arc::new(JupyterServices::new(
            self.client.clone(),
            runtime.ingress.clone(),
            runtime.token.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_benign_classification() {
        assert!(ServicesError::AlreadyShutDown("kernel k".into()).is_benign());
        assert!(ServicesError::UnexpectedOk("kernel k".into()).is_benign());
        assert!(ServicesError::Disposed.is_benign());
        assert!(ServicesError::PollCancelled.is_benign());
        assert!(!ServicesError::Network("refused".into()).is_benign());
        assert!(!ServicesError::Http {
            status: 500,
            message: String::new()
        }
        .is_benign());
    }

    #[tokio::test]
    async fn test_list_and_shutdown() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/sessions"))
            .and(header("authorization", "token tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "s1", "path": "nb.ipynb", "kernel": {"id": "k1", "name": "python3"}}
            ])))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/kernels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "k1", "name": "python3", "execution_state": "idle"},
                {"id": "k2", "name": "python3"}
            ])))
            .mount(&mock_server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/sessions/s1"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&mock_server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/kernels/k1"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock_server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/kernels/k2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let services = JupyterServices::new(reqwest::Client::new(), mock_server.uri(), "tok");

        let sessions = services.list_running_sessions().await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].kernel.as_ref().unwrap().id, "k1");
        assert_eq!(services.list_running_kernels().await.unwrap().len(), 2);

        services.shutdown_session("s1").await.unwrap();
        let quirk = services.shutdown_kernel("k1").await.unwrap_err();
        assert!(matches!(quirk, ServicesError::UnexpectedOk(_)));
        assert!(quirk.is_benign());
        let gone = services.shutdown_kernel("k2").await.unwrap_err();
        assert!(matches!(gone, ServicesError::AlreadyShutDown(_)));
    }

    #[tokio::test]
    async fn test_dispose_twice_and_calls_after_dispose() {
        let services = JupyterServices::new(reqwest::Client::new(), "http://127.0.0.1:1", "tok");
        assert!(!services.is_disposed());
        services.dispose().await.unwrap();
        assert!(services.is_disposed());
        assert_eq!(services.dispose().await.unwrap_err(), ServicesError::Disposed);
        assert_eq!(
            services.list_running_kernels().await.unwrap_err(),
            ServicesError::Disposed
        );
    }

    #[tokio::test]
    async fn test_factory_uses_runtime_ingress() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/kernels"))
            .and(header("authorization", "token secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut runtime = crate::runtime::test_runtime("rt-1", "pod-1");
        runtime.ingress = format!("{}/", mock_server.uri());
        let manager = JupyterServicesFactory::new().connect(&runtime).await.unwrap();
        assert!(manager.list_running_kernels().await.unwrap().is_empty());
    }
}
