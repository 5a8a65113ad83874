//! In-memory stand-ins for the runtimes service, the Jupyter services and
//! the proxy link. Every fake appends to one shared call log so tests can
//! assert the order of teardown steps.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use runtime_lifecycle::api::{ApiError, RuntimeApi, RuntimeStatusReport};
use runtime_lifecycle::services::{
    KernelModel, ServicesError, SessionManager, SessionManagerFactory, SessionModel,
};
use runtime_lifecycle::{
    LifecycleError, ManagerConfig, MemoryBindingStore, PersistedBinding, ProxyControl, Runtime,
    RuntimeLifecycleManager,
};
use runtime_proxy::{TerminationRegistry, WebSocketProxy};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries().iter().any(|e| e == entry)
    }

    pub fn count_prefix(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

pub fn runtime(uid: &str, pod_name: &str) -> Runtime {
    Runtime {
        uid: uid.to_string(),
        pod_name: pod_name.to_string(),
        ingress: "http://127.0.0.1:9".to_string(),
        token: "secret".to_string(),
        environment_name: "python-cpu-env".to_string(),
        status: "running".to_string(),
        started_at: None,
        expired_at: None,
        burning_rate: None,
        given_name: None,
    }
}

pub fn persisted(notebook_id: &str, uid: &str, pod_name: &str) -> PersistedBinding {
    PersistedBinding {
        notebook_id: notebook_id.to_string(),
        notebook_path: Some(format!("{}.ipynb", notebook_id)),
        runtime: runtime(uid, pod_name),
    }
}

// ============================================================================
// Runtimes service
// ============================================================================

pub struct FakeApi {
    log: CallLog,
    termination: TerminationRegistry,
    creates: AtomicUsize,
    pub create_delay: Mutex<Duration>,
    pub delete_delay: Mutex<Duration>,
    pub fail_creates: AtomicBool,
    pub fail_deletes: AtomicBool,
    pub omit_pod_name: AtomicBool,
    pub ingress: Mutex<String>,
    pub statuses: Mutex<HashMap<String, Result<RuntimeStatusReport, ApiError>>>,
}

impl FakeApi {
    fn new(log: CallLog, termination: TerminationRegistry) -> Self {
        Self {
            log,
            termination,
            creates: AtomicUsize::new(0),
            create_delay: Mutex::new(Duration::ZERO),
            delete_delay: Mutex::new(Duration::ZERO),
            fail_creates: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
            omit_pod_name: AtomicBool::new(false),
            ingress: Mutex::new("http://127.0.0.1:9".to_string()),
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, pod_name: &str, status: Result<RuntimeStatusReport, ApiError>) {
        self.statuses
            .lock()
            .unwrap()
            .insert(pod_name.to_string(), status);
    }
}

#[async_trait]
impl RuntimeApi for FakeApi {
    async fn create_runtime(
        &self,
        environment_name: &str,
        given_name: &str,
        _credits_limit: f64,
    ) -> Result<Runtime, ApiError> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.push("api.create");
        let delay = *self.create_delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(ApiError::Server {
                status: 503,
                message: "no capacity".to_string(),
            });
        }

        let pod_name = if self.omit_pod_name.load(Ordering::SeqCst) {
            String::new()
        } else {
            format!("pod-{}", n)
        };
        let mut runtime = runtime(&format!("rt-{}", n), &pod_name);
        runtime.environment_name = environment_name.to_string();
        runtime.given_name = Some(given_name.to_string());
        runtime.ingress = self.ingress.lock().unwrap().clone();
        Ok(runtime)
    }

    async fn delete_runtime(&self, pod_name: &str) -> Result<(), ApiError> {
        let uid = pod_name.replace("pod-", "rt-");
        let flag = if self.termination.is_terminated(&uid) {
            "flagged"
        } else {
            "unflagged"
        };
        self.log.push(format!("api.delete:{}:{}", pod_name, flag));
        let delay = *self.delete_delay.lock().unwrap();
        tokio::time::sleep(delay).await;

        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ApiError::Network("connection reset".to_string()));
        }
        Ok(())
    }

    async fn get_runtime_status(&self, pod_name: &str) -> Result<RuntimeStatusReport, ApiError> {
        self.log.push(format!("api.status:{}", pod_name));
        self.statuses
            .lock()
            .unwrap()
            .get(pod_name)
            .cloned()
            .unwrap_or(Ok(RuntimeStatusReport {
                active: true,
                runtime: None,
            }))
    }
}

// ============================================================================
// Jupyter services
// ============================================================================

pub struct FakeSessionManager {
    uid: String,
    log: CallLog,
    sessions: Vec<String>,
    kernels: Vec<String>,
    shutdown_error: Option<ServicesError>,
    dispose_error: Option<ServicesError>,
    dispose_delay: Duration,
    disposed: AtomicBool,
}

#[async_trait]
impl SessionManager for FakeSessionManager {
    async fn list_running_sessions(&self) -> Result<Vec<SessionModel>, ServicesError> {
        self.log.push(format!("sessions.list:{}", self.uid));
        Ok(self
            .sessions
            .iter()
            .map(|id| SessionModel {
                id: id.clone(),
                path: None,
                kernel: None,
            })
            .collect())
    }

    async fn shutdown_session(&self, session_id: &str) -> Result<(), ServicesError> {
        self.log.push(format!("sessions.shutdown:{}", session_id));
        match &self.shutdown_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn list_running_kernels(&self) -> Result<Vec<KernelModel>, ServicesError> {
        self.log.push(format!("kernels.list:{}", self.uid));
        Ok(self
            .kernels
            .iter()
            .map(|id| KernelModel {
                id: id.clone(),
                name: "python3".to_string(),
                execution_state: None,
            })
            .collect())
    }

    async fn shutdown_kernel(&self, kernel_id: &str) -> Result<(), ServicesError> {
        self.log.push(format!("kernels.shutdown:{}", kernel_id));
        match &self.shutdown_error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    async fn dispose(&self) -> Result<(), ServicesError> {
        self.log.push(format!("dispose:{}", self.uid));
        tokio::time::sleep(self.dispose_delay).await;
        if let Some(e) = &self.dispose_error {
            return Err(e.clone());
        }
        self.disposed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn force_dispose(&self) {
        self.log.push(format!("force_dispose:{}", self.uid));
        self.disposed.store(true, Ordering::SeqCst);
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

type ConnectHook = Box<dyn Fn(&Runtime) + Send + Sync>;

pub struct FakeSessionFactory {
    log: CallLog,
    pub sessions: Mutex<Vec<String>>,
    pub kernels: Mutex<Vec<String>>,
    pub shutdown_error: Mutex<Option<ServicesError>>,
    pub dispose_error: Mutex<Option<ServicesError>>,
    pub dispose_delay: Mutex<Duration>,
    pub fail_connect: AtomicBool,
    on_connect: Mutex<Option<ConnectHook>>,
    managers: Mutex<Vec<Arc<FakeSessionManager>>>,
}

impl FakeSessionFactory {
    fn new(log: CallLog) -> Self {
        Self {
            log,
            sessions: Mutex::new(Vec::new()),
            kernels: Mutex::new(Vec::new()),
            shutdown_error: Mutex::new(None),
            dispose_error: Mutex::new(None),
            dispose_delay: Mutex::new(Duration::ZERO),
            fail_connect: AtomicBool::new(false),
            on_connect: Mutex::new(None),
            managers: Mutex::new(Vec::new()),
        }
    }

    /// Run `hook` while a session manager is being built.
    pub fn on_connect(&self, hook: impl Fn(&Runtime) + Send + Sync + 'static) {
        *self.on_connect.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn managers(&self) -> Vec<Arc<FakeSessionManager>> {
        self.managers.lock().unwrap().clone()
    }
}

#[async_trait]
impl SessionManagerFactory for FakeSessionFactory {
    async fn connect(&self, runtime: &Runtime) -> Result<Arc<dyn SessionManager>, ServicesError> {
        self.log.push(format!("connect:{}", runtime.uid));
        if let Some(hook) = self.on_connect.lock().unwrap().as_ref() {
            hook(runtime);
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(ServicesError::Network("unreachable".to_string()));
        }

        let manager = Arc::new(FakeSessionManager {
            uid: runtime.uid.clone(),
            log: self.log.clone(),
            sessions: self.sessions.lock().unwrap().clone(),
            kernels: self.kernels.lock().unwrap().clone(),
            shutdown_error: self.shutdown_error.lock().unwrap().clone(),
            dispose_error: self.dispose_error.lock().unwrap().clone(),
            dispose_delay: *self.dispose_delay.lock().unwrap(),
            disposed: AtomicBool::new(false),
        });
        self.managers.lock().unwrap().push(manager.clone());
        Ok(manager)
    }
}

// ============================================================================
// Proxy link
// ============================================================================

/// In-process proxy that records what the manager asked of it.
pub struct RecordingProxy {
    log: CallLog,
    inner: Arc<WebSocketProxy>,
}

#[async_trait]
impl ProxyControl for RecordingProxy {
    async fn close_connections_for_runtime(&self, runtime_id: &str) -> Result<usize, LifecycleError> {
        self.log.push(format!("proxy.close:{}", runtime_id));
        ProxyControl::close_connections_for_runtime(&self.inner, runtime_id).await
    }

    async fn notify_runtime_terminated(&self, runtime_id: &str) -> Result<(), LifecycleError> {
        self.log.push(format!("proxy.notify:{}", runtime_id));
        ProxyControl::notify_runtime_terminated(&self.inner, runtime_id).await
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub manager: Arc<RuntimeLifecycleManager>,
    pub api: Arc<FakeApi>,
    pub services: Arc<FakeSessionFactory>,
    /// The proxy keeps its own registry, as it would in its own process.
    pub proxy: Arc<WebSocketProxy>,
    pub store: Arc<MemoryBindingStore>,
    pub log: CallLog,
}

pub fn harness() -> Harness {
    harness_with_store(MemoryBindingStore::new())
}

pub fn harness_with_store(store: MemoryBindingStore) -> Harness {
    let log = CallLog::default();
    let termination = TerminationRegistry::new();
    let api = Arc::new(FakeApi::new(log.clone(), termination.clone()));
    let services = Arc::new(FakeSessionFactory::new(log.clone()));
    let proxy = Arc::new(WebSocketProxy::default());
    let store = Arc::new(store);

    let manager = RuntimeLifecycleManager::new(
        ManagerConfig::default(),
        api.clone(),
        services.clone(),
        Arc::new(RecordingProxy {
            log: log.clone(),
            inner: proxy.clone(),
        }),
        store.clone(),
        termination,
    );

    Harness {
        manager,
        api,
        services,
        proxy,
        store,
        log,
    }
}

// ============================================================================
// Remote socket
// ============================================================================

/// A WebSocket server that echoes frames. Returns its `http://` base URL
/// and a counter of close frames received.
pub async fn spawn_kernel_server() -> (String, Arc<AtomicUsize>) {
    spawn_slow_kernel_server(Duration::ZERO).await
}

/// Like [`spawn_kernel_server`], but each WebSocket handshake completes
/// only after `handshake_delay`.
pub async fn spawn_slow_kernel_server(handshake_delay: Duration) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let close_frames = Arc::new(AtomicUsize::new(0));

    let closes = close_frames.clone();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let closes = closes.clone();
            tokio::spawn(async move {
                tokio::time::sleep(handshake_delay).await;
                let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    match message {
                        Message::Text(_) | Message::Binary(_) => {
                            if ws.send(message).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => {
                            closes.fetch_add(1, Ordering::SeqCst);
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    (format!("http://{}", addr), close_frames)
}

/// Poll `check` until it returns true or five seconds pass.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < Duration::from_secs(5) {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
