use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use dsapi_server::{DsApi, DsApiConfig, Tenants};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dataset control plane API server.
#[derive(Parser, Debug)]
#[command(name = "dsapi", version, about)]
struct Cli {
    /// Path of the JSON configuration
    #[arg(short, long, env = "DSAPI_CONFIG", default_value = "config/config.json")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long, env = "DSAPI_LOG_JSON")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = DsApiConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_deref().unwrap_or("info")));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    tracing::info!(
        version = %config.version.version,
        git_hash = %config.version.git_hash,
        accounts = config.accounts.len(),
        "dsapi starting"
    );

    let tenants = Tenants::build(&config).await?;
    if tenants.is_empty() {
        tracing::warn!("no accounts configured");
    }
    DsApi::new(&config, tenants)?.serve().await
}
