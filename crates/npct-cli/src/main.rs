use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "npct-cli")]
#[command(about = "Nordic Private Credit Tracker ETL pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the companies schema, run-audit table, and dashboard view.
    Setup,
    /// Run the extraction-and-load pipeline once.
    Sync,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = npct_sync::SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Setup => {
            let pool = npct_storage::connect(&config.database_url).await?;
            npct_storage::setup_schema(&pool).await?;
            println!("schema ready: {}", config.database_url);
        }
        Commands::Sync => {
            let summary = npct_sync::run_pipeline(&config).await?;
            println!(
                "sync complete: run_id={} fetched={} succeeded={} upserted={} duplicates_removed={} elapsed={:.1}s",
                summary.run_id,
                summary.fetched,
                summary.succeeded,
                summary.processed,
                summary.duplicates_removed,
                summary.execution_seconds
            );
        }
    }

    Ok(())
}
