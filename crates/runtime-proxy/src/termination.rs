//! Termination registry: runtime ids known to be dead.
//!
//! Each process holds one registry. The proxy process copy is the guard
//! consulted by `open`; the lifecycle side keeps its own copy and mirrors
//! every mark to the proxy with an explicit notify request. Entries are
//! write-once: a runtime id marked terminated stays terminated for the
//! lifetime of the registry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use log::info;

#[derive(Debug, Clone, Copy)]
struct TerminationEntry {
    marked_at: DateTime<Utc>,
}

/// Shared, cloneable handle to a process-wide termination flag set.
#[derive(Debug, Clone, Default)]
pub struct TerminationRegistry {
    entries: Arc<Mutex<HashMap<String, TerminationEntry>>>,
}

impl TerminationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a runtime terminated. Returns `true` if it was not already marked.
    pub fn mark_terminated(&self, runtime_id: &str) -> bool {
        let mut entries = self.lock();
        if entries.contains_key(runtime_id) {
            return false;
        }
        entries.insert(
            runtime_id.to_string(),
            TerminationEntry {
                marked_at: Utc::now(),
            },
        );
        info!("[termination] Marked runtime {} as terminated", runtime_id);
        true
    }

    pub fn is_terminated(&self, runtime_id: &str) -> bool {
        self.lock().contains_key(runtime_id)
    }

    /// When the runtime was marked, if it was.
    pub fn marked_at(&self, runtime_id: &str) -> Option<DateTime<Utc>> {
        self.lock().get(runtime_id).map(|e| e.marked_at)
    }

    /// Snapshot of all terminated runtime ids, sorted.
    pub fn terminated_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TerminationEntry>> {
        // A poisoned lock still holds a consistent set: inserts are atomic.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}
