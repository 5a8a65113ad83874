//! Client for the remote Runtime API.
//!
//! Three calls are used: create, delete (by pod name) and status (by pod
//! name). Failures are classified by HTTP status class so callers can
//! react to the kind of failure without matching on messages.

use async_trait::async_trait;
use log::{debug, info};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::runtime::Runtime;

/// Error kinds reported by the Runtime API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("request rejected ({status}): {message}")]
    Client { status: u16, message: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            401 | 403 => ApiError::Unauthorized(message),
            404 => ApiError::NotFound(message),
            409 => ApiError::Conflict(message),
            500..=599 => ApiError::Server { status, message },
            _ => ApiError::Client { status, message },
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApiError::Server { .. } | ApiError::Network(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

/// Result of a status query.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeStatusReport {
    pub active: bool,
    pub runtime: Option<Runtime>,
}

impl RuntimeStatusReport {
    pub fn inactive() -> Self {
        Self {
            active: false,
            runtime: None,
        }
    }
}

/// The remote runtime service.
#[async_trait]
pub trait RuntimeApi: Send + Sync {
    async fn create_runtime(
        &self,
        environment_name: &str,
        given_name: &str,
        credits_limit: f64,
    ) -> Result<Runtime, ApiError>;

    /// Delete a runtime. Only the pod name is accepted, never the uid.
    async fn delete_runtime(&self, pod_name: &str) -> Result<(), ApiError>;

    async fn get_runtime_status(&self, pod_name: &str) -> Result<RuntimeStatusReport, ApiError>;
}

#[derive(Debug, Serialize)]
struct CreateRuntimeBody<'a> {
    environment_name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    given_name: &'a str,
    credits_limit: f64,
}

#[derive(Debug, Deserialize)]
struct RuntimeEnvelope {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    message: String,
    #[serde(default)]
    runtime: Option<Runtime>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Bearer-token authenticated HTTP client for the Runtime API.
pub struct HttpRuntimeApi {
    client: reqwest::Client,
    run_url: String,
    token: String,
}

impl HttpRuntimeApi {
    pub fn new(run_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            run_url: run_url.into(),
            token: token.into(),
        }
    }

    fn runtimes_url(&self) -> String {
        format!(
            "{}/api/runtimes/v1/runtimes",
            self.run_url.trim_end_matches('/')
        )
    }

    fn runtime_url(&self, pod_name: &str) -> String {
        format!("{}/{}", self.runtimes_url(), pod_name)
    }
}

/// Turn a non-success response into a classified error, preferring the
/// `message` field of a JSON error body.
async fn error_from_response(response: reqwest::Response) -> ApiError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&body)
        .ok()
        .map(|b| b.message)
        .filter(|m| !m.is_empty())
        .unwrap_or(body);
    ApiError::from_status(status, message)
}

#[async_trait]
impl RuntimeApi for HttpRuntimeApi {
    async fn create_runtime(
        &self,
        environment_name: &str,
        given_name: &str,
        credits_limit: f64,
    ) -> Result<Runtime, ApiError> {
        let body = CreateRuntimeBody {
            environment_name,
            kind: "notebook",
            given_name,
            credits_limit,
        };

        let response = self
            .client
            .post(self.runtimes_url())
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let status = response.status().as_u16();
        let envelope: RuntimeEnvelope = response.json().await?;
        if envelope.success == Some(false) {
            return Err(ApiError::Client {
                status,
                message: envelope.message,
            });
        }
        let runtime = envelope.runtime.ok_or_else(|| {
            ApiError::InvalidResponse("create response has no runtime".to_string())
        })?;

        info!(
            "[runtime-api] Created runtime {} (pod {}) in {}",
            runtime.uid, runtime.pod_name, environment_name
        );
        Ok(runtime)
    }

    async fn delete_runtime(&self, pod_name: &str) -> Result<(), ApiError> {
        let response = self
            .client
            .delete(self.runtime_url(pod_name))
            .bearer_auth(&self.token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            info!("[runtime-api] Runtime pod {} already gone", pod_name);
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        info!("[runtime-api] Deleted runtime pod {}", pod_name);
        Ok(())
    }

    async fn get_runtime_status(&self, pod_name: &str) -> Result<RuntimeStatusReport, ApiError> {
        let response = self
            .client
            .get(self.runtime_url(pod_name))
            .bearer_auth(&self.token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("[runtime-api] Runtime pod {} not found", pod_name);
            return Ok(RuntimeStatusReport::inactive());
        }
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let envelope: RuntimeEnvelope = response.json().await?;
        let active = envelope
            .runtime
            .as_ref()
            .map_or(false, Runtime::is_running);
        Ok(RuntimeStatusReport {
            active,
            runtime: envelope.runtime,
        })
    }
}
