//! feedrelay - Main entry point
//!
//! Live video relay gateway: WebSocket signaling in front of a media engine,
//! with supervised capture/encode pipelines per feed.

use clap::Parser;
use feedrelay::args::Args;
use feedrelay::config::Config;
use feedrelay::web::{run_http_server, spawn_event_pumps, SharedState};
use log::{error, info, warn};
use std::env;
use std::sync::Arc;
use tokio::signal;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Parse command line arguments
    let args = Args::parse();

    // Load configuration before logging so the file can set the level
    let (mut config, load_error) = match args.load_config() {
        Ok(cfg) => (cfg, None),
        Err(e) => (Config::default(), Some(e.to_string())),
    };
    args.apply_overrides(&mut config);

    env_logger::Builder::new()
        .parse_filters(&env::var("FEEDRELAY_LOG").unwrap_or_else(|_| config.logging.level.clone()))
        .init();

    info!("feedrelay v{}", env!("CARGO_PKG_VERSION"));
    match load_error {
        Some(e) => warn!("Failed to load config {:?}: {}, using defaults", args.config, e),
        None => info!("Loaded configuration from {:?}", args.config),
    }

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    let (state, ingest_events) = SharedState::new(config)?;
    let state = Arc::new(state);

    // Pumps subscribe before the engine starts emitting
    let pumps = spawn_event_pumps(state.clone(), ingest_events);

    if let Err(e) = state.engine.initialize().await {
        error!("Failed to initialize media engine: {}", e);
        return Err(e.into());
    }

    let mut http_handle = {
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_http_server(state).await {
                error!("HTTP server failed: {}", e);
            }
        })
    };

    // Wait for shutdown signal
    let shutdown = async {
        let _ = signal::ctrl_c().await;
    };

    let mut exit_code = 0;
    tokio::select! {
        _ = shutdown => {
            info!("Initiating graceful shutdown...");
        }
        reason = state.engine.worker_died() => {
            error!("Media engine worker died ({}), exiting", reason);
            exit_code = 1;
        }
        result = &mut http_handle => {
            log_async_task_result("HTTP server", result);
            exit_code = 1;
        }
    }

    info!("Stopping all tasks...");

    if !http_handle.is_finished() {
        http_handle.abort();
        let _ = http_handle.await;
    }

    // Ingest processes are stopped even when the engine is gone
    state.shutdown().await;

    for handle in pumps {
        handle.abort();
    }

    info!("feedrelay stopped");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

fn log_async_task_result(task: &str, result: Result<(), tokio::task::JoinError>) {
    match result {
        Ok(()) => warn!("{} stopped unexpectedly", task),
        Err(err) => error!("{} join error: {}", task, err),
    }
}
