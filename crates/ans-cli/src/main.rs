use anyhow::Result;
use ans_sync::{IngestConfig, IngestPipeline};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ans-cli")]
#[command(about = "Ingest ANS quarterly financial statements into SQLite")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download, enrich, aggregate and load the most recent quarters.
    Sync {
        /// Overrides ANS_QUARTERS.
        #[arg(long)]
        quarters: Option<usize>,
    },
    /// Print the archives that a sync would download, one per line.
    Discover {
        #[arg(long)]
        quarters: Option<usize>,
    },
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync { quarters: None }) {
        Commands::Sync { quarters } => {
            let summary = match quarters {
                None => ans_sync::run_ingest_once_from_env().await?,
                Some(quarters) => {
                    let mut config = IngestConfig::from_env();
                    config.quarters = quarters;
                    IngestPipeline::new(config)?.run_once().await?
                }
            };
            println!(
                "sync complete: run_id={} archives={} enriched={} dropped={} \
                 aggregated={} reports={}",
                summary.run_id,
                summary.archives.len(),
                summary.enriched_rows,
                summary.dropped_rows,
                summary.aggregated_rows,
                summary.reports_dir
            );
        }
        Commands::Discover { quarters } => {
            let config = IngestConfig::from_env();
            let quarters = quarters.unwrap_or(config.quarters);
            for archive in IngestPipeline::new(config)?.discover(quarters).await? {
                println!("{}\t{}", archive.period, archive.url);
            }
        }
        Commands::Migrate => {
            ans_sync::migrate_from_env().await?;
        }
    }

    Ok(())
}
