//! Persistence of notebook ↔ runtime bindings.
//!
//! Bindings are saved after every change so that a restarted process can
//! reconnect to runtimes that are still alive. The file store writes a
//! versioned JSON document; an empty binding set removes the file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::runtime::Runtime;

/// One persisted binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedBinding {
    pub notebook_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notebook_path: Option<String>,
    pub runtime: Runtime,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("failed to access {path}: {message}")]
    Io { path: String, message: String },

    #[error("failed to encode bindings: {0}")]
    Encode(String),
}

/// Storage for the binding set.
pub trait BindingStore: Send + Sync {
    fn load(&self) -> Result<Vec<PersistedBinding>, StoreError>;
    fn save(&self, bindings: &[PersistedBinding]) -> Result<(), StoreError>;
    fn clear(&self) -> Result<(), StoreError>;
}

/// On-disk document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BindingsFile {
    /// Schema version for forward compatibility
    pub schema_version: u32,
    /// RFC 3339 timestamp of the last save
    pub saved_at: String,
    pub bindings: Vec<PersistedBinding>,
}

impl BindingsFile {
    pub const CURRENT_SCHEMA_VERSION: u32 = 1;
}

/// JSON file store.
pub struct FileBindingStore {
    path: PathBuf,
}

impl FileBindingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, err: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            message: err.to_string(),
        }
    }
}

impl BindingStore for FileBindingStore {
    /// A missing, corrupt or newer-schema file loads as no bindings.
    fn load(&self) -> Result<Vec<PersistedBinding>, StoreError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let contents = std::fs::read_to_string(&self.path).map_err(|e| self.io_error(e))?;
        let file: BindingsFile = match serde_json::from_str(&contents) {
            Ok(f) => f,
            Err(e) => {
                warn!("[binding-store] Failed to parse {}: {}", self.path.display(), e);
                return Ok(Vec::new());
            }
        };

        if file.schema_version > BindingsFile::CURRENT_SCHEMA_VERSION {
            warn!(
                "[binding-store] Ignoring bindings with schema version {}",
                file.schema_version
            );
            return Ok(Vec::new());
        }

        info!(
            "[binding-store] Loaded {} binding(s) from {}",
            file.bindings.len(),
            self.path.display()
        );
        Ok(file.bindings)
    }

    fn save(&self, bindings: &[PersistedBinding]) -> Result<(), StoreError> {
        if bindings.is_empty() {
            return self.clear();
        }

        let file = BindingsFile {
            schema_version: BindingsFile::CURRENT_SCHEMA_VERSION,
            saved_at: chrono::Utc::now().to_rfc3339(),
            bindings: bindings.to_vec(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
        }
        let json =
            serde_json::to_string_pretty(&file).map_err(|e| StoreError::Encode(e.to_string()))?;
        std::fs::write(&self.path, format!("{json}\n")).map_err(|e| self.io_error(e))?;

        info!(
            "[binding-store] Saved {} binding(s) to {}",
            bindings.len(),
            self.path.display()
        );
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(|e| self.io_error(e))?;
            info!("[binding-store] Cleared {}", self.path.display());
        }
        Ok(())
    }
}

/// In-memory store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryBindingStore {
    bindings: Mutex<Vec<PersistedBinding>>,
}

impl MemoryBindingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bindings(bindings: Vec<PersistedBinding>) -> Self {
        Self {
            bindings: Mutex::new(bindings),
        }
    }

    pub fn snapshot(&self) -> Vec<PersistedBinding> {
        self.bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl BindingStore for MemoryBindingStore {
    fn load(&self) -> Result<Vec<PersistedBinding>, StoreError> {
        Ok(self.snapshot())
    }

    fn save(&self, bindings: &[PersistedBinding]) -> Result<(), StoreError> {
        *self.bindings.lock().unwrap_or_else(|e| e.into_inner()) = bindings.to_vec();
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.bindings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        Ok(())
    }
}
