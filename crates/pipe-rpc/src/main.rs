//! pipe-rpc command line: run a registry or a demo worker.

mod demo;

use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use pipe_rpc::{
    DEFAULT_REGISTRY_PIPE, RegistryConfig, RegistryEvent, RegistryServer, WorkerConfig,
    WorkerEvent, WorkerServer,
};

use crate::demo::{DemoClient, RegistryClient};

#[derive(Parser, Debug)]
#[command(name = "pipe-rpc", version)]
#[command(about = "Bidirectional RPC over local named pipes")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept workers and greet each one as it registers
    Registry {
        /// Channel name to listen on
        #[arg(long, default_value = DEFAULT_REGISTRY_PIPE)]
        pipe: String,

        /// Per-call response timeout
        #[arg(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// Connect to a registry and serve the demo interface
    Worker {
        /// Channel name of the registry
        #[arg(long, default_value = DEFAULT_REGISTRY_PIPE)]
        registry: String,

        /// Worker id (defaults to a random one)
        #[arg(long)]
        id: Option<String>,
    },
}

fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("PIPE_RPC_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };
        EnvFilter::new(format!("pipe_rpc={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Command::Registry { pipe, timeout_secs } => run_registry(pipe, timeout_secs).await,
        Command::Worker { registry, id } => run_worker(registry, id).await,
    }
}

async fn run_registry(pipe: String, timeout_secs: u64) -> Result<()> {
    let config =
        RegistryConfig::new(pipe).with_request_timeout(Duration::from_secs(timeout_secs));
    let registry = RegistryServer::new(config)?;
    registry.set_handler(demo::registry_methods(registry.downgrade()));

    let mut events = registry.subscribe();
    registry.start().await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            event = events.recv() => match event {
                Ok(RegistryEvent::WorkerConnected(worker_id)) => {
                    tokio::spawn(greet(registry.clone(), worker_id));
                }
                Ok(RegistryEvent::WorkerDisconnected(worker_id)) => {
                    tracing::info!(%worker_id, remaining = registry.connected_workers().len(), "Worker left");
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Missed registry events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    registry.stop().await;
    Ok(())
}

async fn greet(registry: RegistryServer, worker_id: String) {
    let client: DemoClient = registry.worker_interface(worker_id.clone());
    let result = async {
        let name = client.who_am_i().await?;
        let echoed = client.echo("hello from the registry").await?;
        let sum = client.add(2, 40).await?;
        client.ping("welcome").await?;
        tracing::info!(%worker_id, %name, ?echoed, sum, "Greeted worker");

        let everyone: DemoClient = registry.interface();
        let echoed = everyone.echo("broadcast").await?;
        tracing::info!(?echoed, workers = registry.connected_workers().len(), "Broadcast echo");
        Ok::<(), pipe_rpc::RpcError>(())
    }
    .await;

    if let Err(e) = result {
        tracing::warn!(%worker_id, error = %e, "Greeting failed");
    }
}

async fn run_worker(registry_pipe: String, id: Option<String>) -> Result<()> {
    let mut config = WorkerConfig::new(registry_pipe);
    if let Some(id) = id {
        config = config.with_worker_id(id);
    }
    let worker_id = config.worker_id.clone();
    let worker = WorkerServer::new(config, demo::worker_methods(worker_id.clone()))?;

    let mut events = worker.subscribe();
    worker.start().await?;

    let registry: RegistryClient = worker.registry_interface();
    match registry.list_workers().await {
        Ok(workers) => tracing::info!(?workers, "Workers known to the registry"),
        Err(e) => tracing::warn!(error = %e, "Could not list workers"),
    }
    if let Err(e) = registry.report(&worker_id, "ready").await {
        tracing::warn!(error = %e, "Could not report to registry");
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
        event = events.recv() => {
            if let Ok(WorkerEvent::ConnectionLost { reason, .. }) = event {
                tracing::warn!(%reason, "Registry went away, exiting");
            }
        }
    }

    worker.stop().await;
    Ok(())
}
