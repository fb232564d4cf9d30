use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use session_state_store::{session_end_callback, ProviderConfig, SessionPayload, SessionStateProvider, TickOutcome};

/// Session state store maintenance
#[derive(Parser, Debug)]
#[command(name = "session-store", version, about, long_about = None)]
struct Cli {
    /// Provider configuration file (TOML)
    #[arg(short, long)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the schema and register the application
    Init,
    /// Remove expired sessions once and exit
    Sweep,
    /// Keep removing expired sessions until interrupted
    Run,
}

fn log_expired(id: &str, payload: &SessionPayload) -> Result<(), session_state_store::reaper::CallbackError> {
    info!("Session {} expired ({} items)", id, payload.items.len());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = ProviderConfig::load(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    let provider = SessionStateProvider::open(&config).context("Failed to open session store")?;

    match cli.command {
        Commands::Init => {
            let store = provider.store();
            info!(
                "Application '{}' registered as {} (compression: {})",
                config.application_name,
                store.application_id(),
                store.compression_enabled()
            );
        }
        Commands::Sweep => {
            provider.reaper().sweeper().set_callback(Some(session_end_callback(log_expired)));
            let reaper = provider.reaper().sweeper().clone();
            let outcome = tokio::task::spawn_blocking(move || reaper.tick()).await?;
            match outcome {
                TickOutcome::Swept(count) => info!("Removed {} expired sessions", count),
                other => anyhow::bail!("Sweep did not complete: {:?}", other),
            }
        }
        Commands::Run => {
            provider.set_item_expire_callback(Some(session_end_callback(log_expired)));
            anyhow::ensure!(provider.reaper().is_timer_enabled(), "Expiration timer failed to start");
            info!("Reaping expired sessions every {}s; press Ctrl-C to stop", config.polling_interval_secs);
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
        }
    }

    provider.dispose();
    Ok(())
}
