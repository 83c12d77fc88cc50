use anyhow::{Context, Result};
use clap::Parser;
use llmrelay_core::runtime::AppState;
use tracing::info;

mod cli;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let loaded = llmrelay_core::bootstrap::load(&cli.config)
        .with_context(|| format!("loading config file {}", cli.config.display()))?;

    let mut patch = loaded.as_global_patch();
    patch.overlay(cli.as_global_patch());
    let global = patch.into_config().context("assembling global configuration")?;

    let persistence = llmrelay_core::bootstrap::FilePersistence::new(cli.config.clone(), &loaded);
    let sink_factory = persistence.sink_factory();
    let state = AppState::with_sinks(global.clone(), loaded.channels, Some(&sink_factory));

    let app = llmrelay_core::router(state);

    let bind = format!("{}:{}", global.host, global.port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    info!(event = "listening", addr = %bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    info!(event = "stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    }
}
