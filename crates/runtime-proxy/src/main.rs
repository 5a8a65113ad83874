//! runtime-proxy CLI entry point.
//!
//! Runs the WebSocket proxy as a standalone process that notebook windows
//! connect to over IPC.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use log::info;
use runtime_proxy::client::ProxyClient;
use runtime_proxy::daemon::{ProxyConfig, ProxyDaemon};
use runtime_proxy::singleton::get_running_proxy_info;

#[derive(Parser, Debug)]
#[command(name = "runtime-proxy")]
#[command(about = "WebSocket proxy for cloud notebook runtimes")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Socket path for IPC (default: ~/.cache/cloud-runtimes/runtime-proxy.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the proxy (default if no command specified)
    Run,

    /// Check proxy status
    Status {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Ask the running proxy to close all sockets and exit
    Stop,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let socket_path = cli
        .socket
        .unwrap_or_else(runtime_proxy::default_socket_path);

    match cli.command {
        None | Some(Commands::Run) => run_proxy(socket_path).await,
        Some(Commands::Status { json }) => status(socket_path, json).await,
        Some(Commands::Stop) => stop(socket_path).await,
    }
}

async fn run_proxy(socket_path: PathBuf) -> anyhow::Result<()> {
    info!("runtime-proxy starting...");
    info!("  Socket: {:?}", socket_path);

    let config = ProxyConfig {
        socket_path,
        ..Default::default()
    };

    let daemon = match ProxyDaemon::new(config) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!(
                "Running proxy: pid={}, endpoint={}",
                e.info.pid, e.info.endpoint
            );
            std::process::exit(1);
        }
    };
    daemon.run().await
}

async fn status(socket_path: PathBuf, json: bool) -> anyhow::Result<()> {
    let proxy_info = get_running_proxy_info();
    let client = ProxyClient::new(socket_path);
    let stats = client.status().await.ok();
    let running = stats.is_some();

    if json {
        let output = serde_json::json!({
            "running": running,
            "proxy_info": proxy_info,
            "stats": stats,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("runtime-proxy Status");
        println!("====================");
        println!("Proxy running: {}", if running { "yes" } else { "no" });

        if let Some(info) = proxy_info {
            println!();
            println!("Proxy Info:");
            println!("  PID:      {}", info.pid);
            println!("  Endpoint: {}", info.endpoint);
            println!("  Version:  {}", info.version);
            println!("  Started:  {}", info.started_at);
        }

        if let Some(stats) = stats {
            println!();
            println!("Statistics:");
            println!("  Open sockets:        {}", stats.connections);
            println!("  Windows:             {}", stats.windows);
            println!("  Terminated runtimes: {}", stats.terminated_runtimes);
        }
    }

    Ok(())
}

async fn stop(socket_path: PathBuf) -> anyhow::Result<()> {
    let client = ProxyClient::new(socket_path);
    if !client.is_daemon_running().await {
        eprintln!("Proxy is not running.");
        std::process::exit(1);
    }

    println!("Stopping runtime-proxy...");
    client.shutdown().await?;
    println!("Proxy stopped.");

    Ok(())
}
