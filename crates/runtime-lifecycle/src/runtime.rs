//! The remote runtime record.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use runtime_proxy::OpenRequest;
use serde::{Deserialize, Serialize};

/// Status value of a runtime that is up and billable.
pub const RUNNING_STATUS: &str = "running";

/// A remote compute session bound to a notebook.
///
/// `uid` is the logical identifier used for socket bookkeeping and the
/// termination registry; `pod_name` is the operational name the delete
/// endpoint accepts. The two are never interchangeable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runtime {
    pub uid: String,
    #[serde(default)]
    pub pod_name: String,
    /// Base URL of the runtime's Jupyter server.
    pub ingress: String,
    pub token: String,
    #[serde(default)]
    pub environment_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
    /// Credits consumed per second while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burning_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given_name: Option<String>,
}

impl Runtime {
    pub fn is_running(&self) -> bool {
        self.status.eq_ignore_ascii_case(RUNNING_STATUS)
    }

    /// WebSocket URL of a kernel's channels endpoint on this runtime.
    pub fn kernel_channels_url(&self, kernel_id: &str) -> String {
        let base = self.ingress.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/api/kernels/{}/channels", ws_base, kernel_id)
    }

    /// Proxy open request for a kernel socket, bound to this runtime so the
    /// proxy can refuse it once the runtime is terminated.
    pub fn kernel_socket_request(&self, kernel_id: &str) -> OpenRequest {
        let mut headers = BTreeMap::new();
        headers.insert("Authorization".to_string(), format!("token {}", self.token));
        OpenRequest {
            url: self.kernel_channels_url(kernel_id),
            protocol: None,
            headers,
            runtime_id: Some(self.uid.clone()),
        }
    }
}

#[cfg(test)]
pub(crate) fn test_runtime(uid: &str, pod_name: &str) -> Runtime {
    Runtime {
        uid: uid.to_string(),
        pod_name: pod_name.to_string(),
        ingress: "https://runtimes.example/jupyter/server/abc".to_string(),
        token: "secret".to_string(),
        environment_name: "python-cpu-env".to_string(),
        status: RUNNING_STATUS.to_string(),
        started_at: None,
        expired_at: None,
        burning_rate: Some(0.01),
        given_name: Some("brave-otter".to_string()),
    }
}
