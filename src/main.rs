//! swarmgate
//!
//! Self-clustering HTTP application runtime. The same binary runs as the
//! supervising master or, with `WORKER_ID` set, as one spawned worker.

use std::sync::Arc;
use swarmgate::orchestrator::{run_worker, Orchestrator};
use swarmgate::{Config, Result};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    // Load and validate configuration
    let config = Config::load()?;
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    // Spawned children re-enter here with a worker identity
    if let Ok(worker_id) = std::env::var("WORKER_ID") {
        return run_worker(config, worker_id).await;
    }

    info!("🚀 Starting swarmgate");
    info!("{}", config.summary());

    let orchestrator = Orchestrator::new(config);

    // Ctrl-C triggers the ordered shutdown path
    let signal_handle = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            signal_handle.shutdown();
        }
    });

    if let Err(e) = orchestrator.run().await {
        error!("Orchestrator failed: {}", e);
        std::process::exit(1);
    }

    Ok(())
}

/// Initialize logging and tracing
///
/// Logs go to stderr: a worker's stdout carries IPC frames, never text.
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();
}
