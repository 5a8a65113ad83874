//! Singleton management for the proxy daemon.
//!
//! Ensures only one proxy daemon runs per user using file-based locking, and
//! publishes an info file so clients can discover the running instance.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::proxy_base_dir;

/// Information about a running proxy daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyInfo {
    /// Socket endpoint the daemon is listening on.
    pub endpoint: String,
    /// Process ID of the daemon.
    pub pid: u32,
    /// Version of the daemon.
    pub version: String,
    /// When the daemon started.
    pub started_at: DateTime<Utc>,
}

impl ProxyInfo {
    fn unknown() -> Self {
        Self {
            endpoint: "unknown".to_string(),
            pid: 0,
            version: "unknown".to_string(),
            started_at: Utc::now(),
        }
    }
}

/// A lock that ensures only one proxy daemon runs.
pub struct ProxyLock {
    _lock_file: File,
    info_path: PathBuf,
}

impl ProxyLock {
    /// Attempt to acquire the proxy lock.
    ///
    /// `lock_dir` overrides the default location (used in tests).
    /// Returns `Err(info)` with the running daemon's info if another holds it.
    pub fn try_acquire(lock_dir: Option<&PathBuf>) -> Result<Self, ProxyInfo> {
        let dir = lock_dir.cloned().unwrap_or_else(proxy_base_dir);
        let lock_path = dir.join("runtime-proxy.lock");
        let info_path = dir.join("runtime-proxy.json");

        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("[singleton] Failed to create {:?}: {}", dir, e);
        }

        let lock_file = match OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&lock_path)
        {
            Ok(f) => f,
            Err(e) => {
                warn!("[singleton] Failed to open lock file: {}", e);
                return Err(read_proxy_info(&info_path).unwrap_or_else(ProxyInfo::unknown));
            }
        };

        if !try_lock_exclusive(&lock_file) {
            info!("[singleton] Another proxy daemon is already running");
            return Err(read_proxy_info(&info_path).unwrap_or_else(ProxyInfo::unknown));
        }

        info!("[singleton] Acquired proxy lock");

        Ok(Self {
            _lock_file: lock_file,
            info_path,
        })
    }

    /// Write daemon info after successful startup.
    pub fn write_info(&self, endpoint: &str) -> std::io::Result<()> {
        let info = ProxyInfo {
            endpoint: endpoint.to_string(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            started_at: Utc::now(),
        };

        let json = serde_json::to_string_pretty(&info).map_err(std::io::Error::other)?;
        std::fs::write(&self.info_path, json)?;
        info!("[singleton] Wrote proxy info to {:?}", self.info_path);
        Ok(())
    }

    pub fn info_path(&self) -> &Path {
        &self.info_path
    }
}

impl Drop for ProxyLock {
    fn drop(&mut self) {
        if self.info_path.exists() {
            std::fs::remove_file(&self.info_path).ok();
        }
        info!("[singleton] Released proxy lock");
    }
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> bool {
    use std::os::unix::io::AsRawFd;
    let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    result == 0
}

#[cfg(windows)]
fn try_lock_exclusive(file: &File) -> bool {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    let handle = file.as_raw_handle() as HANDLE;
    let mut overlapped: OVERLAPPED = unsafe { std::mem::zeroed() };
    let result = unsafe {
        LockFileEx(
            handle,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            1,
            0,
            &mut overlapped,
        )
    };
    result != 0
}

/// Get the path to the default proxy info file.
pub fn proxy_info_path() -> PathBuf {
    proxy_base_dir().join("runtime-proxy.json")
}

/// Read proxy info from an info file.
pub fn read_proxy_info(path: &Path) -> Option<ProxyInfo> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
}

/// Check if a proxy daemon is running by reading the default info file.
pub fn get_running_proxy_info() -> Option<ProxyInfo> {
    read_proxy_info(&proxy_info_path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_info_path() {
        assert!(proxy_info_path()
            .to_string_lossy()
            .ends_with("runtime-proxy.json"));
    }

    #[test]
    fn test_lock_is_exclusive_and_info_cleaned_up() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().to_path_buf();

        let lock = ProxyLock::try_acquire(Some(&dir)).unwrap();
        lock.write_info("/tmp/test.sock").unwrap();

        let info = read_proxy_info(lock.info_path()).unwrap();
        assert_eq!(info.endpoint, "/tmp/test.sock");
        assert_eq!(info.pid, std::process::id());

        let second = ProxyLock::try_acquire(Some(&dir));
        match second {
            Err(info) => assert_eq!(info.endpoint, "/tmp/test.sock"),
            Ok(_) => panic!("second lock should fail"),
        }

        let info_path = lock.info_path().to_path_buf();
        drop(lock);
        assert!(!info_path.exists());
        assert!(ProxyLock::try_acquire(Some(&dir)).is_ok());
    }
}
