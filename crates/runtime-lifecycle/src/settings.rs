//! Settings for the lifecycle side.
//!
//! Read from `settings.json` in the platform config directory; a missing or
//! invalid file falls back to defaults. Two environment variables apply on
//! top: `CLOUD_RUNTIMES_RUN_URL` overrides the API base URL and
//! `CLOUD_RUNTIMES_TOKEN` supplies the bearer token.

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub const RUN_URL_ENV: &str = "CLOUD_RUNTIMES_RUN_URL";
pub const TOKEN_ENV: &str = "CLOUD_RUNTIMES_TOKEN";

const DEFAULT_RUN_URL: &str = "http://localhost:2111";
const DEFAULT_ENVIRONMENT: &str = "python-cpu-env";
const DEFAULT_CREDITS_LIMIT: f64 = 10.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleSettings {
    /// Base URL of the Runtime API.
    pub run_url: String,
    /// Environment used when a creation does not name one.
    pub default_environment: String,
    /// Credits limit used when a creation does not set one.
    pub credits_limit: f64,
    /// Where bindings are persisted (default: next to the proxy socket).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bindings_path: Option<PathBuf>,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            run_url: DEFAULT_RUN_URL.to_string(),
            default_environment: DEFAULT_ENVIRONMENT.to_string(),
            credits_limit: DEFAULT_CREDITS_LIMIT,
            bindings_path: None,
        }
    }
}

impl LifecycleSettings {
    /// The API base URL, honouring the environment override.
    pub fn resolve_run_url(&self) -> String {
        std::env::var(RUN_URL_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.run_url.clone())
    }

    pub fn bindings_path(&self) -> PathBuf {
        self.bindings_path
            .clone()
            .unwrap_or_else(default_bindings_path)
    }
}

/// Bearer token from the environment, if set.
pub fn token_from_env() -> Option<String> {
    std::env::var(TOKEN_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Get the settings file path
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cloud-runtimes")
        .join("settings.json")
}

pub fn default_bindings_path() -> PathBuf {
    runtime_proxy::proxy_base_dir().join("runtime-bindings.json")
}

/// Load settings from disk, or return defaults
pub fn load_settings() -> LifecycleSettings {
    load_settings_from(&settings_path())
}

pub fn load_settings_from(path: &Path) -> LifecycleSettings {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    } else {
        LifecycleSettings::default()
    }
}

/// Save settings to disk
pub fn save_settings_to(path: &Path, settings: &LifecycleSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = LifecycleSettings::default();
        assert_eq!(settings.default_environment, "python-cpu-env");
        assert_eq!(settings.credits_limit, 10.0);
        assert!(settings.bindings_path().ends_with("runtime-bindings.json"));
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        std::fs::write(&path, r#"{"run_url": "https://api.example", "credits_limit": 3.5}"#).unwrap();

        let settings = load_settings_from(&path);
        assert_eq!(settings.run_url, "https://api.example");
        assert_eq!(settings.credits_limit, 3.5);
        assert_eq!(settings.default_environment, "python-cpu-env");
    }

    #[test]
    fn test_invalid_or_missing_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        assert_eq!(load_settings_from(&path), LifecycleSettings::default());

        std::fs::write(&path, "not json").unwrap();
        assert_eq!(load_settings_from(&path), LifecycleSettings::default());
    }

    #[test]
    fn test_save_and_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("settings.json");
        let settings = LifecycleSettings {
            bindings_path: Some(temp_dir.path().join("b.json")),
            ..Default::default()
        };
        save_settings_to(&path, &settings).unwrap();
        assert_eq!(load_settings_from(&path), settings);
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var(RUN_URL_ENV, "https://override.example");
        std::env::set_var(TOKEN_ENV, "  tok  ");
        let settings = LifecycleSettings::default();
        assert_eq!(settings.resolve_run_url(), "https://override.example");
        assert_eq!(token_from_env().as_deref(), Some("tok"));

        std::env::set_var(RUN_URL_ENV, "");
        std::env::remove_var(TOKEN_ENV);
        assert_eq!(settings.resolve_run_url(), DEFAULT_RUN_URL);
        assert!(token_from_env().is_none());
        std::env::remove_var(RUN_URL_ENV);
    }
}
