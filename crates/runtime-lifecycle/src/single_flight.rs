//! One outstanding runtime creation per notebook.
//!
//! The first caller for a notebook installs an entry and starts the work on
//! a spawned task; later callers await the same shared future. The task
//! removes its own entry when it settles, so the entry exists exactly while
//! the creation is outstanding, even if every caller stopped waiting.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};

use crate::error::LifecycleError;
use crate::runtime::Runtime;

pub type CreationResult = Result<Runtime, LifecycleError>;

/// A creation that any number of callers can await.
pub type SharedCreation = Shared<BoxFuture<'static, CreationResult>>;

struct Entry {
    generation: u64,
    creation: SharedCreation,
}

type Entries = Arc<Mutex<HashMap<String, Entry>>>;

/// In-flight creations keyed by notebook id.
#[derive(Clone, Default)]
pub struct CreationInFlight {
    entries: Entries,
    next_generation: Arc<AtomicU64>,
}

impl CreationInFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the outstanding creation for `notebook_id`, or start `work` as
    /// the new one. Returns whether `work` was started.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn join_or_start<F>(&self, notebook_id: &str, work: F) -> (bool, SharedCreation)
    where
        F: Future<Output = CreationResult> + Send + 'static,
    {
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get(notebook_id) {
            return (false, entry.creation.clone());
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let task_entries = self.entries.clone();
        let key = notebook_id.to_string();
        let handle = tokio::spawn(async move {
            let result = work.await;
            let mut entries = lock(&task_entries);
            // A cleared entry may have been replaced by a newer creation.
            if entries
                .get(&key)
                .map_or(false, |e| e.generation == generation)
            {
                entries.remove(&key);
            }
            result
        });

        let abandoned_id = notebook_id.to_string();
        let creation = async move {
            handle
                .await
                .unwrap_or_else(|_| Err(LifecycleError::CreationAbandoned(abandoned_id)))
        }
        .boxed()
        .shared();

        entries.insert(
            notebook_id.to_string(),
            Entry {
                generation,
                creation: creation.clone(),
            },
        );
        (true, creation)
    }

    /// Every creation still outstanding.
    pub fn outstanding(&self) -> Vec<SharedCreation> {
        lock(&self.entries)
            .values()
            .map(|e| e.creation.clone())
            .collect()
    }

    pub fn contains(&self, notebook_id: &str) -> bool {
        lock(&self.entries).contains_key(notebook_id)
    }

    /// Forget the entry for `notebook_id`. The creation keeps running for
    /// callers already awaiting it, but is no longer handed out.
    pub fn clear(&self, notebook_id: &str) -> bool {
        lock(&self.entries).remove(notebook_id).is_some()
    }

    pub fn clear_all(&self) {
        lock(&self.entries).clear();
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn lock(entries: &Mutex<HashMap<String, Entry>>) -> MutexGuard<'_, HashMap<String, Entry>> {
    entries.lock().unwrap_or_else(|e| e.into_inner())
}
