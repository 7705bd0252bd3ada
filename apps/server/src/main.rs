//! chunkferry server entry point.

mod app;
mod config;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Resumable chunked upload server", long_about = None)]
struct Cli {
    /// Configuration file (created with defaults if missing)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting chunkferry server"
    );

    let config_path = cli.config.unwrap_or_else(config::default_path);
    let config = config::Config::load(&config_path)?;
    tracing::info!(
        path = %config_path.display(),
        storage = %config.storage_dir.display(),
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config, config_path))?;

    tracing::info!("server shut down cleanly");
    Ok(())
}
