mod api;
mod cli;
mod config;
mod environment;
mod network;
mod tasks;
#[cfg(test)]
mod testing;
mod vagrant;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::api::ApiState;
use crate::environment::EnvironmentManager;
use crate::network::{AddressAllocator, Cidr};
use crate::tasks::{TaskQueue, Worker};
use crate::vagrant::VagrantCli;

#[derive(Parser)]
#[command(name = "fragrant", about = "Vagrant environment provisioning service")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API and the task worker.
    Serve {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
    /// Show the persisted address pool (no daemon needed).
    Status {
        /// Path to config file (TOML).
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to register SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, initiating shutdown");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, initiating shutdown");
        }
    }
    Ok(())
}

/// Take an exclusive lock next to the pool file so two daemons never share it.
fn acquire_instance_lock(pool_file: &std::path::Path) -> Result<std::fs::File> {
    let lock_path = pool_file
        .parent()
        .map(|p| p.join("fragrant.lock"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/fragrant/fragrant.lock"));
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .context("failed to open instance lock file")?;
    use std::os::unix::io::AsRawFd;
    let fd = lock_file.as_raw_fd();
    let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
    if result != 0 {
        anyhow::bail!(
            "Another fragrant instance is already running with pool file {}.\n\
             Two instances would hand out the same addresses. Stop the other one first.",
            pool_file.display()
        );
    }
    Ok(lock_file)
}

async fn serve(config: config::Config) -> Result<()> {
    // must stay alive for the whole serve duration
    let _lock = acquire_instance_lock(&config.network.address_file)?;

    tracing::info!("fragrant starting with config: {:?}", config);

    let range: Cidr = config.network.address_range.parse()?;
    let allocator = Arc::new(AddressAllocator::new(
        config.network.address_file.clone(),
        range,
    ));
    allocator
        .load()
        .await
        .context("failed to load address pool")?;

    tokio::fs::create_dir_all(&config.environments.env_dir)
        .await
        .with_context(|| {
            format!(
                "creating environment directory: {}",
                config.environments.env_dir.display()
            )
        })?;

    let tool = Arc::new(VagrantCli::new(config.tool.vagrant_binary.clone()));
    let (queue, rx) = TaskQueue::new();
    let worker = Worker::spawn(rx, tool.clone(), config.environments.env_dir.clone());

    let manager = Arc::new(EnvironmentManager::new(
        config.environments.clone(),
        allocator,
        queue,
        tool,
    ));
    let state = Arc::new(ApiState {
        manager,
        worker_state: worker.watch_state(),
        vboxmanage_binary: config.tool.vboxmanage_binary.clone(),
    });

    // Stop the worker the moment the signal arrives; the server may still
    // spend a while draining in-flight requests.
    let trigger = worker.shutdown_trigger();
    let shutdown = async move {
        if let Err(e) = shutdown_signal().await {
            tracing::error!(error = %e, "signal handling unavailable, shutting down");
        }
        trigger.trigger();
    };
    let serve_result = api::serve(state, &config.server.bind_addr, config.server.port, shutdown).await;

    // Always stop the worker, even if the server failed.
    tracing::info!("api server exited, stopping task worker");
    let worker_result = worker.shutdown().await;
    tracing::info!("fragrant shut down");

    serve_result?;
    worker_result
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config: config_path } => {
            let config = cli::load_config(config_path)?;
            serve(config).await?;
        }
        Commands::Status { config: config_path } => {
            let config = cli::load_config(config_path)?;
            cli::run_status(&config)?;
        }
    }

    Ok(())
}
