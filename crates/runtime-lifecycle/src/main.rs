//! `runtimes` - manage cloud runtimes bound to notebooks from the shell.
//!
//! Every invocation first reconnects to the runtimes saved by earlier
//! invocations, then runs the requested command against them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use runtime_lifecycle::settings::{self, LifecycleSettings};
use runtime_lifecycle::{
    CreateRuntimeOptions, DetachedProxy, FileBindingStore, HttpRuntimeApi, JupyterServicesFactory,
    ManagerConfig, NotebookRuntimeBinding, ProxyControl, RuntimeLifecycleManager,
};
use runtime_proxy::client::ProxyClient;
use runtime_proxy::TerminationRegistry;
use tabled::{settings::Style, Table, Tabled};

#[derive(Parser, Debug)]
#[command(name = "runtimes")]
#[command(about = "Create, inspect and terminate cloud runtimes for notebooks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Proxy socket path (default: ~/.cache/cloud-runtimes/runtime-proxy.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List notebooks and their runtimes
    List {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Get or create the runtime for a notebook
    Create {
        /// Notebook id
        notebook_id: String,

        /// Notebook file path
        #[arg(long)]
        path: Option<String>,

        /// Runtime environment (default from settings)
        #[arg(long)]
        environment: Option<String>,

        /// Credits limit (default from settings)
        #[arg(long)]
        credits: Option<f64>,

        /// Display name for the runtime
        #[arg(long)]
        name: Option<String>,
    },

    /// Terminate the runtime of a notebook
    Terminate {
        /// Notebook id
        notebook_id: String,
    },

    /// Terminate every runtime
    TerminateAll,

    /// Check whether a notebook may be opened
    CanOpen {
        /// Notebook id
        notebook_id: String,
    },
}

#[derive(Tabled)]
struct BindingTableRow {
    #[tabled(rename = "NOTEBOOK")]
    notebook: String,
    #[tabled(rename = "RUNTIME")]
    runtime: String,
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "ENVIRONMENT")]
    environment: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "EXPIRES")]
    expires: String,
}

impl From<&NotebookRuntimeBinding> for BindingTableRow {
    fn from(binding: &NotebookRuntimeBinding) -> Self {
        let runtime = &binding.runtime;
        BindingTableRow {
            notebook: binding.notebook_id.clone(),
            runtime: runtime.uid.clone(),
            name: runtime.given_name.clone().unwrap_or_else(|| "-".to_string()),
            environment: runtime.environment_name.clone(),
            status: runtime.status.clone(),
            expires: runtime
                .expired_at
                .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let settings = settings::load_settings();
    let socket_path = cli
        .socket
        .unwrap_or_else(runtime_proxy::default_socket_path);
    let manager = build_manager(&settings, socket_path).await?;

    let summary = manager.reconnect_to_existing_runtimes().await?;
    if !summary.deferred.is_empty() {
        eprintln!(
            "Warning: could not check {} saved runtime(s), will retry next time",
            summary.deferred.len()
        );
    }

    match cli.command {
        Commands::List { json } => list(&manager, json)?,
        Commands::Create {
            notebook_id,
            path,
            environment,
            credits,
            name,
        } => {
            let options = CreateRuntimeOptions {
                environment,
                given_name: name,
                credits_limit: credits,
            };
            let runtime = manager
                .create_runtime_for_notebook(&notebook_id, path.as_deref(), options)
                .await?;
            println!("Notebook {} runs on runtime {}", notebook_id, runtime.uid);
            println!("  Pod:     {}", runtime.pod_name);
            println!("  Ingress: {}", runtime.ingress);
            println!("  Status:  {}", runtime.status);
        }
        Commands::Terminate { notebook_id } => {
            if manager.runtime_for_notebook(&notebook_id).is_none() {
                println!("Notebook {} has no runtime.", notebook_id);
                return Ok(());
            }
            manager.terminate_runtime_for_notebook(&notebook_id).await?;
            report_last_error(&manager);
            println!("Terminated runtime of notebook {}", notebook_id);
        }
        Commands::TerminateAll => {
            let count = manager.bindings().len();
            manager.terminate_all_runtimes().await?;
            report_last_error(&manager);
            println!("Terminated {} runtime(s)", count);
        }
        Commands::CanOpen { notebook_id } => {
            let admission = manager.can_open_notebook(&notebook_id);
            match admission.message {
                None => println!("Notebook {} can be opened.", notebook_id),
                Some(message) => {
                    println!("{}", message);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

async fn build_manager(
    settings: &LifecycleSettings,
    socket_path: PathBuf,
) -> Result<Arc<RuntimeLifecycleManager>> {
    let Some(token) = settings::token_from_env() else {
        bail!(
            "No API token. Set {} to your runtimes service token.",
            settings::TOKEN_ENV
        );
    };
    let run_url = settings.resolve_run_url();
    info!("Runtime API: {}", run_url);

    let proxy: Arc<dyn ProxyControl> = match ProxyClient::new(socket_path.clone())
        .connect_control()
        .await
    {
        Ok(handle) => Arc::new(handle),
        Err(e) => {
            warn!(
                "Proxy not reachable at {} ({}), sockets will not be closed on teardown",
                socket_path.display(),
                e
            );
            Arc::new(DetachedProxy)
        }
    };

    Ok(RuntimeLifecycleManager::new(
        ManagerConfig::from(settings),
        Arc::new(HttpRuntimeApi::new(run_url, token)),
        Arc::new(JupyterServicesFactory::new()),
        proxy,
        Arc::new(FileBindingStore::new(settings.bindings_path())),
        TerminationRegistry::new(),
    ))
}

fn list(manager: &RuntimeLifecycleManager, json_output: bool) -> Result<()> {
    let bindings = manager.bindings();

    if json_output {
        let entries: Vec<serde_json::Value> = bindings
            .iter()
            .map(|b| {
                serde_json::json!({
                    "notebook_id": b.notebook_id,
                    "notebook_path": b.notebook_path,
                    "active": manager.active_notebook().as_deref() == Some(b.notebook_id.as_str()),
                    "runtime": b.runtime,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if bindings.is_empty() {
        println!("No cloud runtimes.");
        return Ok(());
    }

    let rows: Vec<BindingTableRow> = bindings.iter().map(BindingTableRow::from).collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
    Ok(())
}

fn report_last_error(manager: &RuntimeLifecycleManager) {
    if let Some(message) = manager.last_error() {
        eprintln!("Warning: {}", message);
    }
}
