use anyhow::Context;
use clap::Parser;
use rkosd::cli::{Cli, Commands};
use rkosd::config::load_config;
use rkosd::daemon;
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn config_path(path: &Path) -> anyhow::Result<&str> {
    path.to_str()
        .with_context(|| format!("config path {path:?} is not valid utf-8"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Start { config } => {
            let cfg = load_config(config_path(config)?)?;
            daemon::run(cfg).await?;
        }
        Commands::Scheme { config } => {
            let cfg = load_config(config_path(config)?)?;
            daemon::print_scheme(&cfg)?;
        }
        Commands::RemoveDevice { config, uuid } => {
            let cfg = load_config(config_path(config)?)?;
            daemon::remove_device(&cfg, uuid).await?;
        }
    }

    Ok(())
}
