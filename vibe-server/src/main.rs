use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use vibe_agent::llm::{AnthropicClient, CompletionClient};
use vibe_server::config::ServerConfig;
use vibe_server::db::Db;
use vibe_server::web::{self, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (VIBE_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("VIBE_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env()
        .add_directive("vibe_server=info".parse()?)
        .add_directive("vibe_agent=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .init();
    }

    let config = ServerConfig::parse();

    tokio::fs::create_dir_all(&config.apps_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.apps_dir.display()))?;

    let db = if config.db_path.as_os_str() == ":memory:" {
        tracing::warn!("Using an in-memory catalog; projects are forgotten on restart");
        Db::open_memory()?
    } else {
        Db::open(&config.db_path)
            .with_context(|| format!("Failed to open {}", config.db_path.display()))?
    };

    let api_key = config.api_key.clone().unwrap_or_else(|| {
        tracing::warn!("ANTHROPIC_API_KEY not set; every generation will fail");
        String::new()
    });
    let llm: Arc<dyn CompletionClient> = Arc::new(
        AnthropicClient::new(api_key)
            .with_model(&config.model)
            .with_max_tokens(config.max_tokens)
            .with_url(&config.api_url),
    );

    let state = Arc::new(AppState::new(config, db, llm)?);
    let (_addr, handle) = web::start(state).await?;
    handle.await?
}
