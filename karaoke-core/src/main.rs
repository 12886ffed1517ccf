//! Binary entrypoint: config load, collaborator wiring, and the axum
//! serve loop with graceful shutdown.

use clap::Parser;
use karaoke_core::api::rate_limit::ClientRateLimiter;
use karaoke_core::config::Settings;
use karaoke_core::pipeline::lyrics::LyricProvider;
use karaoke_core::pipeline::recognizer::RecognizerHandle;
use karaoke_core::pipeline::whisper_cli::CliModelLoader;
use karaoke_core::pipeline::Orchestrator;
use karaoke_core::registry::ProgressRegistry;
use karaoke_core::{build_router, AppState};
use karaoke_common::EventBus;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "karaoke-core", about = "Karaoke production pipeline service")]
struct Cli {
    /// Path to a TOML config file; CLI/env values still take priority.
    #[arg(long, env = "KARAOKE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Arc::new(Settings::load(cli.config.as_deref())?);
    info!(host = %settings.host, port = settings.port, "starting karaoke-core");

    let registry = ProgressRegistry::new();
    let lyrics = Arc::new(LyricProvider::new(settings.genius_api_token.clone()));
    let recognizer =
        RecognizerHandle::new(Arc::new(CliModelLoader), settings.whisper_model_tag.clone(), settings.device.clone());
    let events = Arc::new(EventBus::new(64));
    let orchestrator =
        Arc::new(Orchestrator::new(registry.clone(), settings.clone(), lyrics.clone(), recognizer, events));
    let rate_limiter =
        Arc::new(ClientRateLimiter::new(settings.rate_limit_requests, settings.rate_limit_window_secs));

    let shutdown = CancellationToken::new();
    let cleanup_registry = registry.clone();
    let cleanup_shutdown = shutdown.clone();
    let progress_ttl = Duration::from_secs(settings.progress_ttl_secs);
    tokio::spawn(async move {
        cleanup_registry.run_cleanup_loop(Duration::from_secs(60), progress_ttl, cleanup_shutdown).await;
    });

    let state = AppState { settings: settings.clone(), registry: registry.clone(), orchestrator, lyrics, rate_limiter };
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", settings.host, settings.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            server_shutdown.cancel();
        })
        .await?;

    shutdown.cancel();
    registry.cancel_all().await;
    tokio::time::sleep(Duration::from_secs(settings.shutdown_timeout_secs.min(5))).await;
    Ok(())
}
