//! Runtime lifecycle manager.
//!
//! Per notebook: Absent → Creating → Bound → Terminating → Absent.
//!
//! Creation is single-flight per notebook. Termination runs nine ordered,
//! best-effort steps; a failing step is logged and recorded but never stops
//! the steps after it. The termination registry is re-checked right before
//! every action that would extend a runtime's life: reusing a binding,
//! building a session manager, and (in the proxy) opening a socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};
use runtime_proxy::TerminationRegistry;
use tokio::sync::broadcast;

use crate::api::RuntimeApi;
use crate::collab::{CollaborationCleanup, CollaborationSignal};
use crate::error::LifecycleError;
use crate::policy::{self, NotebookAdmission};
use crate::proxy_link::ProxyControl;
use crate::runtime::Runtime;
use crate::services::{ServicesError, SessionManager, SessionManagerFactory};
use crate::settings::LifecycleSettings;
use crate::single_flight::CreationInFlight;
use crate::store::{BindingStore, PersistedBinding};

/// Defaults applied to creations that leave a field unset.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    pub default_environment: String,
    pub credits_limit: f64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        let settings = LifecycleSettings::default();
        Self::from(&settings)
    }
}

impl From<&LifecycleSettings> for ManagerConfig {
    fn from(settings: &LifecycleSettings) -> Self {
        Self {
            default_environment: settings.default_environment.clone(),
            credits_limit: settings.credits_limit,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateRuntimeOptions {
    pub environment: Option<String>,
    /// Display name; a random two-word name when unset.
    pub given_name: Option<String>,
    pub credits_limit: Option<f64>,
}

/// A notebook's current runtime.
#[derive(Clone)]
pub struct NotebookRuntimeBinding {
    pub notebook_id: String,
    pub notebook_path: Option<String>,
    pub runtime: Runtime,
    pub session_manager: Option<Arc<dyn SessionManager>>,
}

impl std::fmt::Debug for NotebookRuntimeBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotebookRuntimeBinding")
            .field("notebook_id", &self.notebook_id)
            .field("notebook_path", &self.notebook_path)
            .field("runtime", &self.runtime.uid)
            .field("session_manager", &self.session_manager.is_some())
            .finish()
    }
}

impl NotebookRuntimeBinding {
    fn persisted(&self) -> PersistedBinding {
        PersistedBinding {
            notebook_id: self.notebook_id.clone(),
            notebook_path: self.notebook_path.clone(),
            runtime: self.runtime.clone(),
        }
    }
}

/// Outcome of restoring persisted bindings, by notebook id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectSummary {
    /// Runtime still active, binding restored.
    pub restored: Vec<String>,
    /// Runtime gone, entry dropped from storage.
    pub discarded: Vec<String>,
    /// Status query failed, entry kept for the next attempt.
    pub deferred: Vec<String>,
    /// A termination won the race, entry dropped.
    pub abandoned: Vec<String>,
}

#[derive(Default)]
struct ManagerState {
    bindings: HashMap<String, NotebookRuntimeBinding>,
    /// Persisted entries whose status could not be checked yet.
    deferred: HashMap<String, PersistedBinding>,
    active_notebook: Option<String>,
    last_error: Option<String>,
}

/// Lowers the terminate-all flag when dropped.
struct TerminatingAll<'a>(&'a AtomicBool);

impl Drop for TerminatingAll<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct RuntimeLifecycleManager {
    config: ManagerConfig,
    api: Arc<dyn RuntimeApi>,
    services: Arc<dyn SessionManagerFactory>,
    proxy: Arc<dyn ProxyControl>,
    store: Arc<dyn BindingStore>,
    termination: TerminationRegistry,
    collaboration: CollaborationSignal,
    in_flight: CreationInFlight,
    terminating_all: AtomicBool,
    /// Bumped by every terminate-all; creations that overlap one are discarded.
    terminate_all_epoch: AtomicU64,
    state: Mutex<ManagerState>,
}

impl RuntimeLifecycleManager {
    pub fn new(
        config: ManagerConfig,
        api: Arc<dyn RuntimeApi>,
        services: Arc<dyn SessionManagerFactory>,
        proxy: Arc<dyn ProxyControl>,
        store: Arc<dyn BindingStore>,
        termination: TerminationRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            api,
            services,
            proxy,
            store,
            termination,
            collaboration: CollaborationSignal::new(),
            in_flight: CreationInFlight::new(),
            terminating_all: AtomicBool::new(false),
            terminate_all_epoch: AtomicU64::new(0),
            state: Mutex::new(ManagerState::default()),
        })
    }

    // ------------------------------------------------------------------
    // Creation
    // ------------------------------------------------------------------

    /// Get the notebook's runtime, creating one if needed.
    ///
    /// A live binding is returned without any remote call. Concurrent
    /// callers for the same notebook share one remote creation and its
    /// result, success or failure.
    pub async fn create_runtime_for_notebook(
        self: &Arc<Self>,
        notebook_id: &str,
        notebook_path: Option<&str>,
        options: CreateRuntimeOptions,
    ) -> Result<Runtime, LifecycleError> {
        if let Some(runtime) = self.reusable_runtime(notebook_id) {
            info!(
                "[runtime-lifecycle] Reusing runtime {} for notebook {}",
                runtime.uid, notebook_id
            );
            return Ok(runtime);
        }

        let epoch = self.terminate_all_epoch.load(Ordering::SeqCst);
        if self.terminating_all.load(Ordering::SeqCst) {
            return Err(LifecycleError::TerminationInProgress);
        }

        let manager = self.clone();
        let id = notebook_id.to_string();
        let path = notebook_path.map(String::from);
        let (started, creation) = self.in_flight.join_or_start(notebook_id, async move {
            manager.create_and_bind(id, path, options, epoch).await
        });
        if !started {
            info!(
                "[runtime-lifecycle] Joining in-flight runtime creation for notebook {}",
                notebook_id
            );
        }

        creation.await
    }

    /// The bound runtime if it may be reused. A binding whose runtime was
    /// terminated is dropped here.
    fn reusable_runtime(&self, notebook_id: &str) -> Option<Runtime> {
        let stale = {
            let mut state = self.lock_state();
            let uid = state.bindings.get(notebook_id)?.runtime.uid.clone();
            if !self.termination.is_terminated(&uid) {
                return state.bindings.get(notebook_id).map(|b| b.runtime.clone());
            }
            let stale = state.bindings.remove(notebook_id);
            if state.active_notebook.as_deref() == Some(notebook_id) {
                state.active_notebook = None;
            }
            stale
        };

        if let Some(binding) = stale {
            info!(
                "[runtime-lifecycle] Dropping binding of notebook {} to terminated runtime {}",
                notebook_id, binding.runtime.uid
            );
            if let Some(manager) = binding.session_manager {
                manager.force_dispose();
            }
            self.persist();
        }
        None
    }

    async fn create_and_bind(
        self: Arc<Self>,
        notebook_id: String,
        notebook_path: Option<String>,
        options: CreateRuntimeOptions,
        epoch: u64,
    ) -> Result<Runtime, LifecycleError> {
        let environment = options
            .environment
            .unwrap_or_else(|| self.config.default_environment.clone());
        let given_name = options.given_name.unwrap_or_else(default_given_name);
        let credits_limit = options.credits_limit.unwrap_or(self.config.credits_limit);

        info!(
            "[runtime-lifecycle] Creating runtime \"{}\" in {} for notebook {}",
            given_name, environment, notebook_id
        );

        let runtime = match self
            .api
            .create_runtime(&environment, &given_name, credits_limit)
            .await
        {
            Ok(runtime) => runtime,
            Err(e) => {
                let err = LifecycleError::Api(e);
                error!(
                    "[runtime-lifecycle] Runtime creation for notebook {} failed: {}",
                    notebook_id, err
                );
                self.record_error(format!("Failed to create runtime: {}", err));
                return Err(err);
            }
        };

        // Checked under the state lock so a terminate-all either sees this
        // binding or this creation sees its epoch.
        let bound = {
            let mut state = self.lock_state();
            if self.terminate_all_epoch.load(Ordering::SeqCst) != epoch {
                false
            } else {
                state.deferred.remove(&notebook_id);
                state.bindings.insert(
                    notebook_id.clone(),
                    NotebookRuntimeBinding {
                        notebook_id: notebook_id.clone(),
                        notebook_path,
                        runtime: runtime.clone(),
                        session_manager: None,
                    },
                );
                if state.active_notebook.is_none() {
                    state.active_notebook = Some(notebook_id.clone());
                }
                state.last_error = None;
                true
            }
        };
        if !bound {
            self.discard_created_runtime(&notebook_id, &runtime).await;
            return Err(LifecycleError::TerminationInProgress);
        }
        self.persist();

        info!(
            "[runtime-lifecycle] Notebook {} bound to runtime {} (pod {})",
            notebook_id, runtime.uid, runtime.pod_name
        );
        Ok(runtime)
    }

    /// Delete a runtime whose creation overlapped a terminate-all. It was
    /// never bound, so only the flag, the proxy and the remote side know it.
    async fn discard_created_runtime(&self, notebook_id: &str, runtime: &Runtime) {
        warn!(
            "[runtime-lifecycle] Terminate-all overlapped creation for notebook {}, deleting runtime {}",
            notebook_id, runtime.uid
        );
        self.termination.mark_terminated(&runtime.uid);
        if let Err(e) = self.proxy.notify_runtime_terminated(&runtime.uid).await {
            debug!(
                "[runtime-lifecycle] Proxy not notified about {}: {}",
                runtime.uid, e
            );
        }
        if runtime.pod_name.is_empty() {
            error!(
                "[runtime-lifecycle] Runtime {} has no pod name, cannot delete it",
                runtime.uid
            );
            let err = LifecycleError::MissingPodName {
                uid: runtime.uid.clone(),
            };
            self.record_error(err.to_string());
            return;
        }
        if let Err(e) = self.api.delete_runtime(&runtime.pod_name).await {
            error!(
                "[runtime-lifecycle] Failed to delete runtime {}: {}",
                runtime.uid, e
            );
            self.record_error(format!("Failed to delete runtime {}: {}", runtime.uid, e));
        }
    }

    /// Attach (or return the attached) session manager for a bound notebook.
    pub async fn connect_session_manager(
        &self,
        notebook_id: &str,
    ) -> Result<Arc<dyn SessionManager>, LifecycleError> {
        let runtime = {
            let state = self.lock_state();
            let binding = state
                .bindings
                .get(notebook_id)
                .ok_or_else(|| LifecycleError::NotBound(notebook_id.to_string()))?;
            if let Some(manager) = binding.session_manager.as_ref().filter(|m| !m.is_disposed()) {
                return Ok(manager.clone());
            }
            binding.runtime.clone()
        };

        self.ensure_may_connect(&runtime.uid)?;
        let manager = self.services.connect(&runtime).await?;
        if let Err(e) = self.ensure_may_connect(&runtime.uid) {
            manager.force_dispose();
            return Err(e);
        }

        let mut state = self.lock_state();
        match state.bindings.get_mut(notebook_id) {
            Some(binding) if binding.runtime.uid == runtime.uid => {
                binding.session_manager = Some(manager.clone());
                Ok(manager)
            }
            _ => {
                manager.force_dispose();
                Err(LifecycleError::NotBound(notebook_id.to_string()))
            }
        }
    }

    fn ensure_may_connect(&self, uid: &str) -> Result<(), LifecycleError> {
        if self.terminating_all.load(Ordering::SeqCst) {
            return Err(LifecycleError::TerminationInProgress);
        }
        if self.termination.is_terminated(uid) {
            return Err(LifecycleError::RuntimeTerminated(uid.to_string()));
        }
        Ok(())
    }

    /// Query the remote status of a notebook's runtime and store it.
    /// Returns whether the runtime is active.
    pub async fn refresh_runtime_status(&self, notebook_id: &str) -> Result<bool, LifecycleError> {
        let runtime = self
            .runtime_for_notebook(notebook_id)
            .ok_or_else(|| LifecycleError::NotBound(notebook_id.to_string()))?;
        if runtime.pod_name.is_empty() {
            return Err(LifecycleError::MissingPodName { uid: runtime.uid });
        }

        let report = self.api.get_runtime_status(&runtime.pod_name).await?;

        let mut state = self.lock_state();
        if let Some(binding) = state.bindings.get_mut(notebook_id) {
            if binding.runtime.uid == runtime.uid {
                if let Some(fresh) = report.runtime.as_ref() {
                    binding.runtime.status = fresh.status.clone();
                    binding.runtime.expired_at = fresh.expired_at.or(binding.runtime.expired_at);
                } else if !report.active {
                    binding.runtime.status = "stopped".to_string();
                }
            }
        }
        Ok(report.active)
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    /// Tear down a notebook's runtime. Without a binding this returns
    /// immediately and makes no remote calls.
    pub async fn terminate_runtime_for_notebook(&self, notebook_id: &str) -> Result<(), LifecycleError> {
        let binding = match self.lock_state().bindings.get(notebook_id).cloned() {
            Some(binding) => binding,
            None => {
                debug!(
                    "[runtime-lifecycle] Notebook {} has no runtime, nothing to terminate",
                    notebook_id
                );
                return Ok(());
            }
        };
        let runtime = &binding.runtime;
        let uid = runtime.uid.as_str();

        info!(
            "[runtime-lifecycle] Terminating runtime {} (pod {}) for notebook {}",
            uid, runtime.pod_name, notebook_id
        );

        // 1. A stale creation must not be handed out.
        if self.in_flight.clear(notebook_id) {
            debug!("[runtime-lifecycle] Cleared in-flight creation for {}", notebook_id);
        }

        // 2. Sessions, then kernels.
        if let Some(manager) = binding.session_manager.as_ref().filter(|m| !m.is_disposed()) {
            self.shutdown_sessions_and_kernels(&**manager, uid).await;
        }

        // 3. Collaboration detaches before its socket dies.
        self.collaboration.emit(uid);

        // 4. Sockets.
        match self.proxy.close_connections_for_runtime(uid).await {
            Ok(count) => debug!("[runtime-lifecycle] Closed {} socket(s) for {}", count, uid),
            Err(e) => self.step_failed("close sockets", uid, &e),
        }

        // 5. Session manager.
        if let Some(manager) = binding.session_manager.as_ref() {
            match manager.dispose().await {
                Ok(()) => {}
                Err(e) if e.is_benign() => {
                    debug!("[runtime-lifecycle] Ignoring dispose error for {}: {}", uid, e)
                }
                Err(e) => {
                    self.step_failed("dispose session manager", uid, &LifecycleError::from(e));
                    manager.force_dispose();
                }
            }
        }

        // 6. Flag before delete, so reconnects lose the race.
        self.termination.mark_terminated(uid);
        if let Err(e) = self.proxy.notify_runtime_terminated(uid).await {
            self.step_failed("notify proxy", uid, &e);
        }

        // 7. Remote delete, by pod name.
        let outcome = if runtime.pod_name.is_empty() {
            error!("[runtime-lifecycle] Runtime {} has no pod name, cannot delete it", uid);
            let err = LifecycleError::MissingPodName {
                uid: uid.to_string(),
            };
            self.record_error(format!("Failed to terminate runtime: {}", err));
            Err(err)
        } else {
            if let Err(e) = self.api.delete_runtime(&runtime.pod_name).await {
                self.step_failed("delete runtime", uid, &LifecycleError::from(e));
            }
            Ok(())
        };

        // 8. Binding, unless a newer runtime took its place meanwhile.
        {
            let mut state = self.lock_state();
            if state
                .bindings
                .get(notebook_id)
                .map_or(false, |b| b.runtime.uid == uid)
            {
                state.bindings.remove(notebook_id);
                if state.active_notebook.as_deref() == Some(notebook_id) {
                    state.active_notebook = None;
                }
            }
        }

        // 9.
        self.persist();

        info!("[runtime-lifecycle] Runtime {} terminated", uid);
        outcome
    }

    async fn shutdown_sessions_and_kernels(&self, manager: &dyn SessionManager, uid: &str) {
        match manager.list_running_sessions().await {
            Ok(sessions) => {
                for session in sessions {
                    if let Err(e) = manager.shutdown_session(&session.id).await {
                        self.services_step_failed("shut down session", &session.id, uid, e);
                    }
                }
            }
            Err(e) => self.services_step_failed("list sessions", "-", uid, e),
        }

        match manager.list_running_kernels().await {
            Ok(kernels) => {
                for kernel in kernels {
                    if let Err(e) = manager.shutdown_kernel(&kernel.id).await {
                        self.services_step_failed("shut down kernel", &kernel.id, uid, e);
                    }
                }
            }
            Err(e) => self.services_step_failed("list kernels", "-", uid, e),
        }
    }

    fn services_step_failed(&self, step: &str, target: &str, uid: &str, err: ServicesError) {
        if err.is_benign() {
            debug!(
                "[runtime-lifecycle] {} {} on {}: {} (treated as success)",
                step, target, uid, err
            );
        } else {
            self.step_failed(step, uid, &LifecycleError::from(err));
        }
    }

    fn step_failed(&self, step: &str, uid: &str, err: &LifecycleError) {
        warn!("[runtime-lifecycle] Teardown of {}: {} failed: {}", uid, step, err);
        self.record_error(format!("Failed to {} for runtime {}: {}", step, uid, err));
    }

    /// Terminate every bound notebook, one after another, then clear all
    /// local and persisted state. Returns the first termination error.
    pub async fn terminate_all_runtimes(&self) -> Result<(), LifecycleError> {
        if self.terminating_all.swap(true, Ordering::SeqCst) {
            return Err(LifecycleError::TerminationInProgress);
        }
        let _flag = TerminatingAll(&self.terminating_all);
        self.terminate_all_epoch.fetch_add(1, Ordering::SeqCst);

        // Creations already running settle first; each one deletes its own
        // runtime instead of binding it.
        let pending = self.in_flight.outstanding();
        if !pending.is_empty() {
            info!(
                "[runtime-lifecycle] Waiting for {} in-flight creation(s)",
                pending.len()
            );
            futures::future::join_all(pending).await;
        }

        let mut notebook_ids: Vec<String> = self.lock_state().bindings.keys().cloned().collect();
        notebook_ids.sort();
        info!(
            "[runtime-lifecycle] Terminating {} runtime(s)",
            notebook_ids.len()
        );

        let mut first_error = None;
        for notebook_id in &notebook_ids {
            if let Err(e) = self.terminate_runtime_for_notebook(notebook_id).await {
                warn!(
                    "[runtime-lifecycle] Termination for notebook {} failed: {}",
                    notebook_id, e
                );
                first_error.get_or_insert(e);
            }
        }

        let leftovers: Vec<NotebookRuntimeBinding> = {
            let mut state = self.lock_state();
            state.deferred.clear();
            state.active_notebook = None;
            state.bindings.drain().map(|(_, b)| b).collect()
        };
        for binding in leftovers {
            if let Some(manager) = binding.session_manager {
                manager.force_dispose();
            }
        }
        self.in_flight.clear_all();
        if let Err(e) = self.store.clear() {
            warn!("[runtime-lifecycle] Failed to clear persisted bindings: {}", e);
            self.record_error(format!("Failed to clear saved runtimes: {}", e));
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------
    // Reconnection
    // ------------------------------------------------------------------

    /// Restore bindings persisted by an earlier process whose runtimes are
    /// still active.
    pub async fn reconnect_to_existing_runtimes(&self) -> Result<ReconnectSummary, LifecycleError> {
        if self.terminating_all.load(Ordering::SeqCst) {
            return Err(LifecycleError::TerminationInProgress);
        }

        let persisted = self.store.load()?;
        let mut summary = ReconnectSummary::default();

        for entry in persisted {
            let notebook_id = entry.notebook_id.clone();
            let uid = entry.runtime.uid.clone();

            if self.lock_state().bindings.contains_key(&notebook_id) {
                debug!("[runtime-lifecycle] Notebook {} already bound, skipping", notebook_id);
                continue;
            }
            if self.termination.is_terminated(&uid) || entry.runtime.pod_name.is_empty() {
                summary.discarded.push(notebook_id);
                continue;
            }

            let report = match self.api.get_runtime_status(&entry.runtime.pod_name).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(
                        "[runtime-lifecycle] Status of runtime {} unknown ({}), will retry later",
                        uid, e
                    );
                    self.lock_state()
                        .deferred
                        .insert(notebook_id.clone(), entry);
                    summary.deferred.push(notebook_id);
                    continue;
                }
            };

            if !report.active {
                info!(
                    "[runtime-lifecycle] Runtime {} of notebook {} is gone, discarding",
                    uid, notebook_id
                );
                self.lock_state().deferred.remove(&notebook_id);
                summary.discarded.push(notebook_id);
                continue;
            }

            let mut runtime = entry.runtime;
            if let Some(fresh) = report.runtime {
                runtime.status = fresh.status;
                runtime.expired_at = fresh.expired_at.or(runtime.expired_at);
            }

            match self.restore_binding(&notebook_id, entry.notebook_path, runtime).await {
                Ok(()) => summary.restored.push(notebook_id),
                Err(e) => {
                    info!(
                        "[runtime-lifecycle] Abandoned reconnect of notebook {}: {}",
                        notebook_id, e
                    );
                    self.lock_state().deferred.remove(&notebook_id);
                    summary.abandoned.push(notebook_id);
                }
            }
        }

        self.persist();
        info!(
            "[runtime-lifecycle] Reconnect: {} restored, {} discarded, {} deferred, {} abandoned",
            summary.restored.len(),
            summary.discarded.len(),
            summary.deferred.len(),
            summary.abandoned.len()
        );
        Ok(summary)
    }

    async fn restore_binding(
        &self,
        notebook_id: &str,
        notebook_path: Option<String>,
        runtime: Runtime,
    ) -> Result<(), LifecycleError> {
        self.ensure_may_connect(&runtime.uid)?;
        let session_manager = match self.services.connect(&runtime).await {
            Ok(manager) => Some(manager),
            Err(e) => {
                warn!(
                    "[runtime-lifecycle] No session manager for runtime {}: {}",
                    runtime.uid, e
                );
                None
            }
        };
        if let Err(e) = self.ensure_may_connect(&runtime.uid) {
            if let Some(manager) = session_manager {
                manager.force_dispose();
            }
            return Err(e);
        }

        let mut state = self.lock_state();
        state.deferred.remove(notebook_id);
        state.bindings.insert(
            notebook_id.to_string(),
            NotebookRuntimeBinding {
                notebook_id: notebook_id.to_string(),
                notebook_path,
                runtime: runtime.clone(),
                session_manager,
            },
        );
        if state.active_notebook.is_none() {
            state.active_notebook = Some(notebook_id.to_string());
        }
        info!(
            "[runtime-lifecycle] Reconnected notebook {} to runtime {}",
            notebook_id, runtime.uid
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn can_open_notebook(&self, notebook_id: &str) -> NotebookAdmission {
        let state = self.lock_state();
        let bound: Vec<String> = state.bindings.keys().cloned().collect();
        policy::can_open_notebook(notebook_id, &bound, state.active_notebook.as_deref())
    }

    pub fn runtime_for_notebook(&self, notebook_id: &str) -> Option<Runtime> {
        self.lock_state()
            .bindings
            .get(notebook_id)
            .map(|b| b.runtime.clone())
    }

    pub fn binding(&self, notebook_id: &str) -> Option<NotebookRuntimeBinding> {
        self.lock_state().bindings.get(notebook_id).cloned()
    }

    /// All bindings, ordered by notebook id.
    pub fn bindings(&self) -> Vec<NotebookRuntimeBinding> {
        let mut bindings: Vec<_> = self.lock_state().bindings.values().cloned().collect();
        bindings.sort_by(|a, b| a.notebook_id.cmp(&b.notebook_id));
        bindings
    }

    pub fn active_notebook(&self) -> Option<String> {
        self.lock_state().active_notebook.clone()
    }

    /// The most recent creation or teardown failure, for display.
    pub fn last_error(&self) -> Option<String> {
        self.lock_state().last_error.clone()
    }

    pub fn clear_error(&self) {
        self.lock_state().last_error = None;
    }

    pub fn is_creating(&self, notebook_id: &str) -> bool {
        self.in_flight.contains(notebook_id)
    }

    pub fn is_terminating_all(&self) -> bool {
        self.terminating_all.load(Ordering::SeqCst)
    }

    pub fn termination(&self) -> &TerminationRegistry {
        &self.termination
    }

    pub fn subscribe_collaboration_cleanup(&self) -> broadcast::Receiver<CollaborationCleanup> {
        self.collaboration.subscribe()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_error(&self, message: String) {
        self.lock_state().last_error = Some(message);
    }

    /// Save live bindings plus entries still waiting for a status check.
    fn persist(&self) {
        let snapshot: Vec<PersistedBinding> = {
            let state = self.lock_state();
            let mut snapshot: Vec<PersistedBinding> = state
                .bindings
                .values()
                .map(NotebookRuntimeBinding::persisted)
                .chain(
                    state
                        .deferred
                        .values()
                        .filter(|d| !state.bindings.contains_key(&d.notebook_id))
                        .cloned(),
                )
                .collect();
            snapshot.sort_by(|a, b| a.notebook_id.cmp(&b.notebook_id));
            snapshot
        };

        if let Err(e) = self.store.save(&snapshot) {
            warn!("[runtime-lifecycle] Failed to persist bindings: {}", e);
        }
    }
}

fn default_given_name() -> String {
    petname::petname(2, "-").unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_runtime;

    #[test]
    fn test_config_from_settings() {
        let settings = LifecycleSettings {
            default_environment: "ai-env".to_string(),
            credits_limit: 3.5,
            ..Default::default()
        };
        let config = ManagerConfig::from(&settings);
        assert_eq!(config.default_environment, "ai-env");
        assert_eq!(config.credits_limit, 3.5);
        assert_eq!(ManagerConfig::default().default_environment, "python-cpu-env");
    }

    #[test]
    fn test_binding_debug_hides_token() {
        let binding = NotebookRuntimeBinding {
            notebook_id: "nb-1".to_string(),
            notebook_path: None,
            runtime: test_runtime("rt-1", "pod-1"),
            session_manager: None,
        };
        let debug = format!("{:?}", binding);
        assert!(debug.contains("rt-1"));
        assert!(!debug.contains("secret"));
        assert_eq!(binding.persisted().runtime.pod_name, "pod-1");
    }

    #[test]
    fn test_default_given_name() {
        assert!(!default_given_name().is_empty());
    }
}
