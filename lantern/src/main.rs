use clap::{Parser, Subcommand};

use lantern::app::{self, Backend};
use lantern::config::AppConfig;
use lantern::logging::init_logging;
use lantern::telemetry::Telemetry;

#[derive(Parser)]
#[command(name = "lantern")]
#[command(about = "To-do service with request correlation and background exports", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Clone, Copy, Debug)]
enum Command {
    /// Run the HTTP tier
    Serve,
    /// Run background workers
    Worker,
    /// Run the HTTP tier and workers in one process
    All,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    init_logging(config.log_level)?;

    let telemetry = Telemetry::init(&config)?;
    tracing::info!(
        command = ?cli.command,
        version = %config.app_version,
        worker_pool_size = config.worker_pool_size,
        "Starting lantern"
    );

    let backend = Backend::connect(&config).await?;
    let result = match cli.command {
        Command::Serve => app::run_serve(&config, &telemetry, &backend).await,
        Command::Worker => app::run_worker(&config, &telemetry, &backend).await,
        Command::All => app::run_all(&config, &telemetry, &backend).await,
    };

    if let Err(err) = &result {
        tracing::error!(error = %format!("{err:#}"), "lantern exited with an error");
    }

    // The span exporter blocks while flushing.
    let flushing = telemetry.clone();
    if let Err(err) = tokio::task::spawn_blocking(move || flushing.shutdown()).await {
        tracing::warn!("Tracer shutdown task failed: {}", err);
    }
    result
}
