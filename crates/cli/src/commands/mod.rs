pub mod ask;
pub mod config_cmd;
pub mod serve;

use anyhow::Context;
use localapi_config::AppConfig;
use localapi_engine::ResponseOrchestrator;
use localapi_providers::OpenAiCompatProvider;
use localapi_store::SqliteStore;
use std::path::Path;
use std::sync::Arc;

/// Load config from `path` (or the default location), then env overrides.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_with_env(path),
        None => AppConfig::load(),
    };
    config.context("Failed to load config")
}

/// Wire the SQLite store and the inference backend into an orchestrator.
pub async fn build_orchestrator(config: &AppConfig) -> anyhow::Result<Arc<ResponseOrchestrator>> {
    let store = SqliteStore::new(&config.database.path)
        .await
        .with_context(|| format!("Failed to open database at {}", config.database.path))?;

    let provider = OpenAiCompatProvider::from_config(&config.llm, config.api_key.clone())
        .context("Failed to build inference client")?;

    tracing::info!(
        database = %config.database.path,
        backend = %provider.base_url(),
        model = %config.llm.model,
        "Engine ready"
    );

    Ok(Arc::new(ResponseOrchestrator::new(
        Arc::new(provider),
        Arc::new(store),
        config,
    )))
}
