mod cli;
mod config;
mod daemon;
mod db;
mod error;
mod images;
mod models;
mod pipeline;
mod scheduler;
mod server;
mod store;
mod trends;
mod writer;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    // RUST_LOG wins over the configured level when set
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.trendwire.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    config::validate_config(&config)?;

    match cli.command {
        Some(Commands::Validate) => {
            println!("configuration OK: {}", cli.config.display());
            Ok(())
        }
        Some(Commands::Run) => {
            let report = daemon::run_batch(config).await?;
            println!("processed {} topics", report.processed);
            Ok(())
        }
        Some(Commands::Generate { hashtag }) => {
            let article = daemon::generate_single(config, &hashtag).await?;
            println!("created draft article {}: {}", article.id, article.title);
            Ok(())
        }
        None => daemon::run(config).await,
    }
}
