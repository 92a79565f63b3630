// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod abi;
mod approval;
mod config;
mod error;
mod expirer;
mod http;
mod listener;
mod monitor;
mod orchestrator;
mod queue;
mod resolver;
mod rpc;
mod store;
mod types;
mod underwriter;
mod wallet;

use orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv::dotenv().ok();

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("swap underwriter starting");

    let config = config::load()?;
    info!(chains = config.chains.len(), port = config.port, "configuration loaded");

    let orchestrator = Arc::new(Orchestrator::new());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let orchestrator_run = orchestrator.clone();
    let config_run = config.clone();
    let run_shutdown = shutdown_rx.clone();
    let run_handle = tokio::spawn(async move { orchestrator_run.run(config_run, run_shutdown).await });

    let http_status = orchestrator.status.clone();
    let http_shutdown = shutdown_rx.clone();
    let http_port = config.port;
    let http_handle = tokio::spawn(async move { http::serve(http_port, http_status, http_shutdown).await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
        }
    }

    let _ = shutdown_tx.send(true);

    if let Err(e) = run_handle.await? {
        tracing::error!(error = %e, "orchestrator exited with error");
    }
    if let Err(e) = http_handle.await? {
        tracing::error!(error = %e, "http server exited with error");
    }

    Ok(())
}
