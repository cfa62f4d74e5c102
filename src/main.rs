//! lora-serve binary.
//!
//! Loads configuration, starts the serving core on the simulated engine and
//! exposes it over HTTP until SIGINT/SIGTERM.

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use lora_serve::config::{Cli, Config};
use lora_serve::inference::{Engine, SimulatedEngine};
use lora_serve::server::api::{build_router, AppState};
use lora_serve::server::shutdown::shutdown_signal;
use lora_serve::LoraServe;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "lora_serve=debug,tower_http=debug"
    } else {
        "lora_serve=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| filter.into());
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }

    info!("lora-serve v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    config.apply_cli(&cli);

    info!(
        model = %config.model.model_id,
        dtype = %config.model.dtype,
        max_batch_tokens = config.scheduler.max_batch_tokens,
        max_wait_ms = config.scheduler.max_wait_ms,
        "Configuration loaded"
    );

    // Engines.
    let target: Arc<dyn Engine> = Arc::new(SimulatedEngine::new(config.model.model_id.clone()));
    let draft: Option<Arc<dyn Engine>> = config
        .model
        .draft_model_id
        .clone()
        .map(|id| Arc::new(SimulatedEngine::new(id)) as Arc<dyn Engine>);

    let listen_addr = config.server.listen.clone();
    let serve = Arc::new(LoraServe::start(config, target, draft).await?);

    // Build the HTTP router.
    let app = build_router(Arc::new(AppState::new(Arc::clone(&serve))));

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    serve.shutdown().await;
    Ok(())
}
