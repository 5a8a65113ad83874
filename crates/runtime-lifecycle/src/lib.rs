//! runtime-lifecycle - Cloud runtime lifecycle management for notebooks.
//!
//! Each notebook is bound to at most one remote runtime. This crate creates
//! runtimes on demand (one creation per notebook at a time), reuses live
//! ones, restores bindings left by an earlier process, and tears runtimes
//! down in a fixed order so that no session, kernel, socket, or remote
//! allocation outlives the teardown.
//!
//! Remote collaborators sit behind traits: [`api::RuntimeApi`] for the
//! runtimes service, [`services::SessionManagerFactory`] for Jupyter
//! sessions and kernels, [`proxy_link::ProxyControl`] for the WebSocket
//! proxy, and [`store::BindingStore`] for persistence.

pub mod api;
pub mod collab;
pub mod error;
pub mod manager;
pub mod policy;
pub mod proxy_link;
pub mod runtime;
pub mod services;
pub mod settings;
pub mod single_flight;
pub mod store;

pub use api::{ApiError, HttpRuntimeApi, RuntimeApi, RuntimeStatusReport};
pub use collab::CollaborationCleanup;
pub use error::LifecycleError;
pub use manager::{
    CreateRuntimeOptions, ManagerConfig, NotebookRuntimeBinding, ReconnectSummary,
    RuntimeLifecycleManager,
};
pub use policy::NotebookAdmission;
pub use proxy_link::{DetachedProxy, ProxyControl};
pub use runtime::Runtime;
pub use services::{JupyterServicesFactory, ServicesError, SessionManager, SessionManagerFactory};
pub use store::{BindingStore, FileBindingStore, MemoryBindingStore, PersistedBinding};
