//! Search service entry point.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;

use savor_config::Config;
use savor_llm::OllamaClient;
use savor_search::api::{self, AppState};
use savor_search::SearchSession;
use savor_store::Store;

#[derive(Parser, Debug)]
#[command(name = "savor-search", about = "Interactive restaurant search service")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, env = "SAVOR_CONFIG", default_value = "config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "savor_search=info,tower_http=info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;

    let store = Arc::new(Store::connect(&config.postgres.conn_str()).await?);
    store.ensure_schema().await?;

    let llm = OllamaClient::new(config.model.base_url.clone())?;
    let session = Arc::new(SearchSession::new(Arc::clone(&store), llm, &config.model));

    let state = Arc::new(AppState { store, session });
    let router = api::router(state);

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "search service listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
