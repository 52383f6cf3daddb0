//! # Keybridge Main Entry Point
//!
//! Startup order matters: schema, then the encrypt-in-place migration, then
//! the stale session sweep, and only then the listener.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use keybridge::config::ConfigLoader;
use keybridge::server::{build_state, run_server};
use keybridge::{db, telemetry};

#[derive(Parser)]
#[command(name = "keybridge", version, about = "Third-party API credential broker")]
struct Cli {
    /// Directory holding the layered .env files (defaults to the working directory)
    #[arg(long)]
    env_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let loader = match cli.env_dir {
        Some(dir) => ConfigLoader::with_base_dir(dir),
        None => ConfigLoader::new(),
    };
    let config = Arc::new(loader.load()?);

    telemetry::init_tracing(&config)?;
    tracing::info!(profile = %config.profile, "loaded configuration");
    if let Ok(redacted) = config.redacted_json() {
        tracing::debug!(config = %redacted, "effective configuration");
    }

    let db = Arc::new(db::init_pool(&config).await?);
    db::ensure_schema(&db).await?;

    let state = build_state(Arc::clone(&config), Arc::clone(&db))?;

    let services = state.dispatcher.services();
    services
        .connections
        .encrypt_database_if_needed(config.flow.encryption_batch_size)
        .await?;

    let swept = services
        .sessions
        .clear_stale(config.flow.session_ttl_minutes)
        .await?;
    if swept > 0 {
        tracing::info!(count = swept, "swept abandoned sessions at startup");
    }

    run_server(state).await
}
