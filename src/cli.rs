use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Trend-driven newsroom automation daemon.
#[derive(Parser)]
#[command(name = "trendwire", version, about)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    pub config: PathBuf,

    /// With no subcommand, runs the daemon (scheduler + API server).
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check the configuration file and exit
    Validate,
    /// Run one generation batch and exit
    Run,
    /// Generate a single draft article for a hashtag and exit
    Generate {
        /// Topic hashtag, with or without the leading '#'
        hashtag: String,
    },
}
