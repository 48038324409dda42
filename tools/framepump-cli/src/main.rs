//! FramePump CLI: drive synthetic pipelines from the command line.
//!
//! Usage:
//!   framepump run [OPTIONS]    Pump a clock source through a program
//!   framepump config           Print the effective configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use framepump_common::config::EngineConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "framepump",
    about = "Drive frame-scheduled pipelines and report their timing",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to the standard location)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pump a clock source through a program and print the final counters
    Run {
        /// Frames per play (0 runs until Ctrl+C)
        #[arg(long, default_value = "100")]
        frames: u64,

        /// Nominal frame rate
        #[arg(long, default_value = "30")]
        fps: f64,

        /// Derive time from elapsed frames instead of the wall clock
        #[arg(long)]
        offline: bool,

        /// How many times a bounded source is played
        #[arg(long, default_value = "1")]
        plays: u64,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_path(path)?,
        None => EngineConfig::load(),
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    framepump_common::logging::init_logging(&config.logging);

    match cli.command {
        Commands::Run {
            frames,
            fps,
            offline,
            plays,
        } => commands::run::run(config, frames, fps, offline, plays).await,
        Commands::Config => commands::config::run(&config, cli.config),
    }
}
