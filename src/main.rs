mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use secrecy::SecretString;

use blockrelay_engine::{ModelSummarizer, ToolLoopCoordinator};
use blockrelay_llm::AnthropicProvider;
use blockrelay_store::{Database, SessionModelRepo, SqliteBroadcastLog, SqliteCancellationFlags, TurnRepo};
use blockrelay_telemetry::init_telemetry;

use crate::config::Cli;

const PURGE_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _telemetry = init_telemetry(cli.telemetry_config());

    tracing::info!("starting blockrelay");

    let db_path = cli.db_path();
    let db = Database::open(&db_path).with_context(|| format!("failed to open {}", db_path.display()))?;

    let api_key = cli
        .api_key
        .clone()
        .context("ANTHROPIC_API_KEY (or --api-key) is required")?;
    let mut provider = AnthropicProvider::new(SecretString::from(api_key), cli.model.as_deref())?;
    if let Some(base_url) = &cli.base_url {
        provider = provider.with_base_url(base_url.clone());
    }
    let provider = Arc::new(provider);

    let log = Arc::new(SqliteBroadcastLog::new(db.clone(), cli.log_config()));
    let mut coordinator = ToolLoopCoordinator::new(
        provider.clone(),
        Arc::new(TurnRepo::new(db.clone())),
        log.clone(),
        Arc::new(SqliteCancellationFlags::new(db.clone())),
        Arc::new(SessionModelRepo::new(db)),
        cli.coordinator_config(),
    );
    if let Some(model) = &cli.summary_model {
        coordinator = coordinator.with_summarizer(Arc::new(ModelSummarizer::new(provider, model.clone())));
    }

    let purge = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = log.purge_expired() {
                tracing::warn!(error = %e, "expired stream purge failed");
            }
        }
    });

    let handle = blockrelay_server::start(cli.server_config(), Arc::new(coordinator))
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "blockrelay ready");

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl+c")?;
    tracing::info!("shutting down");

    purge.abort();
    handle.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}
