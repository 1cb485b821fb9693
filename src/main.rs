use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use chainwatch_screener::config::Config;
use chainwatch_screener::pipeline::ScreeningPipeline;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;

    // Load configuration first: it decides the log format
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "screener.toml".to_string());
    let config = Config::load(&config_path)?;

    // Initialize structured logging (set RUST_LOG=debug for more output)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    tracing::info!(
        chains = config.inputs.chains.len(),
        output = %config.output.dir.display(),
        "Configuration loaded from {}",
        config_path
    );

    // Catalog and list failures abort before any chain is touched
    let pipeline = Arc::new(ScreeningPipeline::init(config)?);
    tracing::info!("Screening pipeline initialized");

    // Graceful shutdown on Ctrl+C
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        tracing::info!("Shutdown signal received, stopping screening run...");
        signal_token.cancel();
    });

    let summary = pipeline.run(shutdown).await?;

    if !summary.failed_chains.is_empty() {
        tracing::warn!(
            failed = summary.failed_chains.len(),
            "Some chains could not be screened"
        );
    }
    tracing::info!(
        alerts = summary.alerts,
        dossiers = summary.dossiers,
        "ChainWatch Screener finished"
    );
    Ok(())
}
