use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use helvard::Config;
use helvard::Engine;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// How long unloading may take before the daemon exits anyway.
const UNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Helvar lighting router daemon
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "helvard.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(config.logging.filter())
        .init();

    tracing::info!("helvard starting");
    tracing::info!("Loaded config from: {}", args.config.display());

    let engine = Arc::new(Engine::new(&config.engine));
    engine.register_integrations_from_config(&config);

    let engine_task = {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run().await {
                tracing::error!("Engine stopped: {}", e);
            }
        })
    };

    let (api_shutdown_tx, api_shutdown_rx) = tokio::sync::oneshot::channel();
    let api_task = config.api.clone().map(|api| {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = helvard::api::serve(api.listen, api.port, engine, api_shutdown_rx).await
            {
                tracing::error!("HTTP API server failed: {}", e);
            }
        })
    });

    tracing::info!("Press Ctrl+C to exit");
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }

    if let Some(api_task) = api_task {
        let _ = api_shutdown_tx.send(());
        let _ = api_task.await;
    }

    tracing::info!("Unloading integrations...");
    let unload = await_unloaded(engine.unload_all());
    if tokio::time::timeout(UNLOAD_TIMEOUT, unload).await.is_err() {
        tracing::warn!("Timed out unloading integrations");
    }

    engine_task.abort();
    tracing::info!("helvard shutdown complete");

    Ok(())
}

/// Await every handle in turn, logging tasks that panicked.
async fn await_unloaded(handles: Vec<tokio::task::JoinHandle<()>>) {
    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("Integration task failed: {}", e);
        }
    }
}
