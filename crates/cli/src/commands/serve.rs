//! `localapi serve` — Start the HTTP/WebSocket gateway.

use localapi_config::AppConfig;
use localapi_gateway::AppState;
use std::sync::Arc;

pub async fn run(mut config: AppConfig, host: Option<String>, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(host) = host {
        config.gateway.host = host;
    }
    if let Some(port) = port {
        config.gateway.port = port;
    }

    let orchestrator = super::build_orchestrator(&config).await?;

    println!("LocalAPI gateway");
    println!("   Listening: {}:{}", config.gateway.host, config.gateway.port);
    println!("   Backend:   {} ({})", config.llm.base_url, config.llm.model);
    println!("   Database:  {}", config.database.path);

    let state = Arc::new(AppState::new(orchestrator, config));
    localapi_gateway::start(state, shutdown_signal()).await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
